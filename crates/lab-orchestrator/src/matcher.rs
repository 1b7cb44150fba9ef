//! Shell history matching for autograding
//!
//! An expected command matches a history line when the program names agree
//! and every expected argument is present in the line, in any order. Short
//! flag clusters are compared by their letters, so `-la` is satisfied by
//! `-al` or by `-l -a`.

use serde::Serialize;
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    pub matched_command: String,
    pub expected_command: String,
    pub message: String,
}

/// Shell-word splitting, or plain whitespace splitting when quoting is malformed.
pub fn tokenize(value: &str) -> Vec<String> {
    shlex::split(value)
        .unwrap_or_else(|| value.split_whitespace().map(str::to_string).collect())
}

fn is_short_flag(token: &str) -> bool {
    token.len() > 1 && token.starts_with('-') && !token.starts_with("--")
}

fn flag_letters(token: &str) -> impl Iterator<Item = char> + '_ {
    token[1..].chars().filter(|c| c.is_alphanumeric())
}

pub fn line_matches_expected(line: &str, expected: &str) -> bool {
    let actual = tokenize(line.trim());
    let target = tokenize(expected.trim());
    let (Some((program, actual_args)), Some((expected_program, expected_args))) =
        (actual.split_first(), target.split_first())
    else {
        return false;
    };
    if program != expected_program {
        return false;
    }

    let present: HashSet<char> = actual_args
        .iter()
        .filter(|arg| is_short_flag(arg))
        .flat_map(|arg| flag_letters(arg))
        .collect();

    expected_args.iter().all(|token| {
        if token.starts_with("--") {
            actual_args.contains(token)
        } else if token.len() > 1 && token.starts_with('-') {
            flag_letters(token).all(|c| present.contains(&c))
        } else {
            actual_args.contains(token)
        }
    })
}

/// Scans history newest-first and reports the first line matching any expected command.
///
/// `history` is in file order (oldest first). For each line, expected
/// commands are tried in the order given.
pub fn find_match<S: AsRef<str>>(history: &[S], expected: &[String]) -> Option<MatchResult> {
    history
        .iter()
        .rev()
        .map(|line| line.as_ref().trim())
        .filter(|line| !line.is_empty())
        .find_map(|line| {
            expected
                .iter()
                .find(|exp| line_matches_expected(line, exp))
                .map(|exp| MatchResult {
                    matched: true,
                    matched_command: line.to_string(),
                    expected_command: exp.clone(),
                    message: format!("Auto-validated from terminal activity: `{}`", exp),
                })
        })
}
