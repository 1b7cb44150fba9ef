//! Lab Orchestrator
//!
//! Owns the per-challenge lab containers that run on a single Docker daemon,
//! plus short-lived ad hoc sandboxes that are reclaimed after a TTL. Provides:
//! - Provision / activate / reset / stop / restart / remove of lab containers
//! - Ownership metadata recovery from labels and container names
//! - Public endpoint resolution for a lab's access type
//! - Autograding by matching shell history against expected commands
//! - A session registry with a background expiry reaper
//!
//! ## Container naming
//!
//! Exactly one lab container exists per challenge id. Its name is derived from
//! the id (`ctfd-challenge-<id>-lab`), so "does one already exist" is a name
//! lookup rather than a scan.
//!
//! ## Protected containers
//!
//! Containers whose compose service belongs to the core infrastructure
//! (`ctfd`, `db`, `cache`, `nginx`, `control-service`) are never stopped,
//! restarted, removed or reset, whatever the caller asks for.

pub mod config;
pub mod connection;
pub mod container;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod matcher;
pub mod metadata;
pub mod run_spec;
pub mod sessions;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use bollard;
pub use config::*;
pub use connection::{resolve_connection, ConnectionInfo};
pub use container::ManagedContainer;
pub use docker::{BollardBridge, DockerBridge, DockerClient, ExecOutput};
pub use error::{LabError, LabResult};
pub use lifecycle::*;
pub use matcher::{find_match, line_matches_expected, MatchResult};
pub use metadata::ContainerIdentity;
pub use run_spec::{RunSpec, SecondaryNetwork};
pub use sessions::{
    SessionManager, SessionRegistry, SpawnRequest, SpawnedLab, SweepReport, EXPIRES_AT_LABEL,
    SESSION_USER_LABEL,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Port served by the in-lab web terminal when none is configured.
pub const DEFAULT_TERMINAL_PORT: u16 = 7681;

/// Unprivileged account the terminal drops into.
pub const SHELL_USER: &str = "ctf";

/// In-container location of the challenge flag.
pub const FLAG_PATH: &str = "/opt/ctf/flag.txt";

/// Shell history read by the autograder.
pub const HISTORY_PATH: &str = "/home/ctf/.bash_history";

/// Deterministic container name for a challenge's lab.
pub fn lab_container_name(challenge_id: u64) -> String {
    format!("ctfd-challenge-{}-lab", challenge_id)
}

/// Connection modality of a lab.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AccessType {
    /// Browser terminal served by the lab itself.
    #[default]
    Terminal,
    /// Remote desktop.
    Rdp,
    /// Anything else the challenge store knows about; served over the public scheme.
    Other(String),
}

impl AccessType {
    pub fn as_str(&self) -> &str {
        match self {
            AccessType::Terminal => "terminal",
            AccessType::Rdp => "rdp",
            AccessType::Other(value) => value,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AccessType::Terminal)
    }
}

impl FromStr for AccessType {
    type Err = LabError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().to_lowercase();
        match value.as_str() {
            "" | "terminal" => Ok(AccessType::Terminal),
            "rdp" => Ok(AccessType::Rdp),
            other if other.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
                Ok(AccessType::Other(other.to_string()))
            }
            other => Err(LabError::Validation(format!("Invalid access type: {}", other))),
        }
    }
}

impl TryFrom<String> for AccessType {
    type Error = LabError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccessType> for String {
    fn from(value: AccessType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status as reported to collaborators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Paused,
    Stopped,
    Other,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}
