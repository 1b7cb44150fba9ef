//! Orchestrator configuration

use std::time::Duration;

pub const PUBLIC_HOST_ENV: &str = "CONTROL_PUBLIC_HOST";
pub const PUBLIC_SCHEME_ENV: &str = "CONTROL_PUBLIC_SCHEME";

/// Runtime settings shared by the lifecycle manager and the session reaper
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Host that players use to reach published lab ports.
    pub public_host: String,
    /// Scheme for non-desktop access URLs.
    pub public_scheme: String,
    /// Grace period for stop and restart.
    pub grace_period: Duration,
    /// How often the reaper sweeps expired sessions.
    pub reaper_interval: Duration,
    /// Number of trailing history lines the autograder reads.
    pub history_lines: usize,
    /// Network mode applied to ad hoc sessions (e.g. `none`); `None` keeps the daemon default.
    pub session_network_mode: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            public_scheme: "http".to_string(),
            grace_period: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(5),
            history_lines: 4000,
            session_network_mode: None,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `CONTROL_PUBLIC_HOST` / `CONTROL_PUBLIC_SCHEME`.
    ///
    /// Blank values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(host) = non_empty_env(PUBLIC_HOST_ENV) {
            config.public_host = host;
        }
        if let Some(scheme) = non_empty_env(PUBLIC_SCHEME_ENV) {
            config.public_scheme = scheme;
        }
        config
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
