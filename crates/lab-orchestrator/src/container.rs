//! Listing model for containers seen on the daemon

use crate::docker::short_id;
use crate::metadata::ContainerIdentity;
use crate::ContainerStatus;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A container as reported by the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct ManagedContainer {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub paused: bool,
    pub created: String,
    pub started_at: String,
    pub finished_at: String,
    pub challenge_id: Option<u64>,
    pub user_id: Option<u64>,
    pub team_id: Option<u64>,
    pub session_id: Option<String>,
    pub access_type: String,
    pub compose_service: Option<String>,
    pub managed: bool,
    pub protected: bool,
    /// Interactive sessions inside the container, when probed.
    pub active_logons: Option<u64>,
}

impl ManagedContainer {
    pub fn from_inspect(info: &ContainerInspectResponse) -> Self {
        let id = info.id.clone().unwrap_or_default();
        let name = info
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let config = info.config.as_ref();
        let labels = config.and_then(|c| c.labels.clone()).unwrap_or_default();
        let identity = ContainerIdentity::parse(&labels, &name);
        let state = info.state.as_ref();

        Self {
            short_id: short_id(&id),
            image: config
                .and_then(|c| c.image.clone())
                .or_else(|| info.image.clone())
                .unwrap_or_default(),
            status: status_of(info),
            paused: state.and_then(|s| s.paused).unwrap_or(false),
            created: format_timestamp(info.created.as_deref()),
            started_at: format_timestamp(state.and_then(|s| s.started_at.as_deref())),
            finished_at: format_timestamp(state.and_then(|s| s.finished_at.as_deref())),
            challenge_id: identity.challenge_id,
            user_id: identity.user_id,
            team_id: identity.team_id,
            session_id: identity.session_id,
            access_type: identity.access_type.to_string(),
            compose_service: identity.compose_service,
            managed: identity.managed,
            protected: identity.protected,
            active_logons: None,
            id,
            name,
        }
    }
}

/// Collapses the daemon's state machine onto the four reported states.
pub fn status_of(info: &ContainerInspectResponse) -> ContainerStatus {
    match info.state.as_ref().and_then(|s| s.status) {
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::CREATED)
        | Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Stopped,
        _ => ContainerStatus::Other,
    }
}

/// Formats a daemon timestamp as `YYYY-MM-DD HH:MM:SS UTC`.
///
/// Unparsable input is returned untouched; absent input becomes an empty string.
pub fn format_timestamp(raw: Option<&str>) -> String {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return String::new();
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts
            .with_timezone(&Utc)
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string(),
        Err(_) => raw.to_string(),
    }
}
