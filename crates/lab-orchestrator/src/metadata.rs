//! Ownership metadata recovered from container labels and names

use crate::AccessType;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Compose service names of the core platform. Never mutated.
pub const INFRA_SERVICES: &[&str] = &["ctfd", "db", "cache", "nginx", "control-service"];

pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const MANAGED_LABEL: &str = "ctfd.managed";
pub const CHALLENGE_ID_LABEL: &str = "ctfd.challenge_id";
pub const ACCESS_TYPE_LABEL: &str = "ctfd.access_type";
pub const INTERNAL_PORT_LABEL: &str = "ctfd.internal_port";
pub const SHELL_USER_LABEL: &str = "ctfd.shell_user";

const CHALLENGE_KEYS: [&str; 3] = ["ctfd.challenge_id", "challenge_id", "ctf.challenge_id"];
const USER_KEYS: [&str; 3] = ["ctfd.user_id", "user_id", "ctf.user_id"];
const TEAM_KEYS: [&str; 3] = ["ctfd.team_id", "team_id", "ctf.team_id"];
const SESSION_KEYS: [&str; 3] = ["ctfd.session_id", "session_id", "ctf.session_id"];

fn challenge_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"challenge[-_](\d+)").ok()).as_ref()
}

fn user_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"user[-_](\d+)").ok()).as_ref()
}

fn team_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"team[-_](\d+)").ok()).as_ref()
}

/// Typed identity facts of a container. Every field is resolved independently.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub challenge_id: Option<u64>,
    pub user_id: Option<u64>,
    pub team_id: Option<u64>,
    pub session_id: Option<String>,
    pub access_type: AccessType,
    pub internal_port: Option<u16>,
    pub shell_user: Option<String>,
    pub compose_service: Option<String>,
    pub managed: bool,
    pub protected: bool,
}

impl ContainerIdentity {
    /// Parses labels first, then falls back to `challenge-<n>` style name fragments.
    pub fn parse(labels: &HashMap<String, String>, name: &str) -> Self {
        let name = name.trim_start_matches('/');

        let challenge_id =
            numeric_label(labels, &CHALLENGE_KEYS).or_else(|| id_from_name(challenge_name_re(), name));
        let user_id = numeric_label(labels, &USER_KEYS).or_else(|| id_from_name(user_name_re(), name));
        let team_id = numeric_label(labels, &TEAM_KEYS).or_else(|| id_from_name(team_name_re(), name));
        let session_id = SESSION_KEYS
            .iter()
            .filter_map(|key| labels.get(*key))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(str::to_string);

        let compose_service = non_empty(labels.get(COMPOSE_SERVICE_LABEL));
        let protected = compose_service
            .as_deref()
            .map(|service| INFRA_SERVICES.contains(&service))
            .unwrap_or(false);

        let explicitly_managed = labels
            .get(MANAGED_LABEL)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            challenge_id,
            user_id,
            team_id,
            session_id,
            access_type: labels
                .get(ACCESS_TYPE_LABEL)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            internal_port: labels
                .get(INTERNAL_PORT_LABEL)
                .and_then(|v| v.trim().parse::<u16>().ok())
                .filter(|port| *port > 0),
            shell_user: non_empty(labels.get(SHELL_USER_LABEL)),
            compose_service,
            managed: challenge_id.is_some() || explicitly_managed,
            protected,
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First label among `keys` holding a plain decimal number.
fn numeric_label(labels: &HashMap<String, String>, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .filter_map(|key| labels.get(*key))
        .map(|v| v.trim())
        .find(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|v| v.parse().ok())
}

fn id_from_name(re: Option<&Regex>, name: &str) -> Option<u64> {
    re?.captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
