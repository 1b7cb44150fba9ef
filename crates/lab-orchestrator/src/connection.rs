//! Public endpoint resolution for lab containers

use crate::config::OrchestratorConfig;
use crate::container::status_of;
use crate::metadata::ContainerIdentity;
use crate::{AccessType, ContainerStatus};
use bollard::models::ContainerInspectResponse;
use serde::Serialize;

/// How a player reaches a lab.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub container_id: String,
    pub container_name: String,
    pub status: ContainerStatus,
    pub paused: bool,
    pub access_type: AccessType,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// `None` until the daemon has published the internal port.
    pub url: Option<String>,
}

/// Computes the externally reachable endpoint from live container attributes.
pub fn resolve_connection(
    info: &ContainerInspectResponse,
    config: &OrchestratorConfig,
) -> ConnectionInfo {
    let name = info
        .name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let labels = info
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();
    let identity = ContainerIdentity::parse(&labels, &name);

    let port = identity
        .internal_port
        .and_then(|internal| published_port(info, internal));
    let url = port.map(|port| match identity.access_type {
        AccessType::Rdp => format!("rdp://{}:{}", config.public_host, port),
        _ => format!("{}://{}:{}", config.public_scheme, config.public_host, port),
    });

    ConnectionInfo {
        container_id: info.id.clone().unwrap_or_default(),
        container_name: name,
        status: status_of(info),
        paused: info
            .state
            .as_ref()
            .and_then(|s| s.paused)
            .unwrap_or(false),
        access_type: identity.access_type,
        host: Some(config.public_host.clone()),
        port,
        url,
    }
}

/// Host port the daemon bound to `internal/tcp`, if any.
pub fn published_port(info: &ContainerInspectResponse, internal: u16) -> Option<u16> {
    info.network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&format!("{internal}/tcp"))?
        .as_ref()?
        .iter()
        .filter_map(|binding| binding.host_port.as_deref())
        .find_map(|port| port.parse::<u16>().ok().filter(|p| *p > 0))
}
