//! Lifecycle management for per-challenge lab containers
//!
//! A challenge's lab goes through `provision` (created, then paused),
//! `activate` (unpaused or started, recreated first when stale) and finally
//! one of the container actions. Provision and activate for the same
//! challenge id are serialized on a per-challenge lock.

use crate::config::OrchestratorConfig;
use crate::connection::{resolve_connection, ConnectionInfo};
use crate::container::{status_of, ManagedContainer};
use crate::docker::{short_id, DockerClient};
use crate::error::{LabError, LabResult};
use crate::matcher::{find_match, MatchResult};
use crate::metadata::{
    ContainerIdentity, ACCESS_TYPE_LABEL, CHALLENGE_ID_LABEL, INTERNAL_PORT_LABEL, MANAGED_LABEL,
    SHELL_USER_LABEL,
};
use crate::run_spec::RunSpec;
use crate::{
    lab_container_name, AccessType, ContainerStatus, DEFAULT_TERMINAL_PORT, FLAG_PATH,
    HISTORY_PATH, SHELL_USER,
};
use bollard::container::Config;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const IDLE_LOOP: &str = "while true; do sleep 3600; done";

const LOGON_PROBES: [&str; 2] = [
    "who | wc -l",
    "ps -eo tty= | grep -E 'pts|tty' | wc -l",
];

/// What a challenge's lab should look like.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProvisionSpec {
    #[serde(default, deserialize_with = "null_as_default")]
    pub image: String,
    /// `None` on activate leaves the flag file alone.
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(default)]
    pub internal_port: Option<u16>,
    #[serde(default)]
    pub startup_command: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub access_type: AccessType,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ProvisionSpec {
    /// Port the lab serves on; terminal labs fall back to the ttyd default.
    pub fn effective_port(&self) -> Option<u16> {
        self.internal_port
            .filter(|port| *port > 0)
            .or_else(|| self.access_type.is_terminal().then_some(DEFAULT_TERMINAL_PORT))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Restart,
    Stop,
    Remove,
    Reset,
}

impl ContainerAction {
    pub const ALL: [ContainerAction; 4] = [
        ContainerAction::Restart,
        ContainerAction::Stop,
        ContainerAction::Remove,
        ContainerAction::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Restart => "restart",
            ContainerAction::Stop => "stop",
            ContainerAction::Remove => "remove",
            ContainerAction::Reset => "reset",
        }
    }
}

impl FromStr for ContainerAction {
    type Err = LabError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "restart" => Ok(ContainerAction::Restart),
            "stop" => Ok(ContainerAction::Stop),
            "remove" => Ok(ContainerAction::Remove),
            "reset" => Ok(ContainerAction::Reset),
            _ => Err(LabError::Validation("Invalid action".to_string())),
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing options for [`LabOrchestrator::list_containers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListFilter {
    /// Only running containers.
    pub running: bool,
    /// Only containers this subsystem owns.
    pub managed: bool,
    /// Probe running containers for interactive sessions.
    pub logons: bool,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            running: true,
            managed: false,
            logons: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    ContainerNotFound,
    NoMatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Unmatched {
    pub matched: bool,
    pub reason: UnmatchedReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AutogradeOutcome {
    Matched(MatchResult),
    Unmatched(Unmatched),
}

impl AutogradeOutcome {
    fn unmatched(reason: UnmatchedReason) -> Self {
        AutogradeOutcome::Unmatched(Unmatched {
            matched: false,
            reason,
        })
    }

    pub fn is_match(&self) -> bool {
        matches!(self, AutogradeOutcome::Matched(_))
    }
}

/// Shell script run as the lab's main process.
///
/// The flag is written before anything else. Terminal labs serve a shell as
/// the unprivileged user and run the startup command in the background.
pub fn build_lab_command(
    startup_command: Option<&str>,
    access_type: &AccessType,
    internal_port: Option<u16>,
) -> Vec<String> {
    let setup = format!(
        "mkdir -p /opt/ctf && printf '%s' \"$FLAG\" > {FLAG_PATH} && chmod 400 {FLAG_PATH};"
    );
    let startup = startup_command.map(str::trim).unwrap_or_default();

    let script = if access_type.is_terminal() {
        let port = internal_port.unwrap_or(DEFAULT_TERMINAL_PORT);
        let background = if startup.is_empty() {
            String::new()
        } else {
            format!("({startup}) & ")
        };
        format!(
            "{setup} {background}exec ttyd -W -p {port} -i 0.0.0.0 bash -lc \
             'exec sudo -u {SHELL_USER} -H bash -lc \"cd /home/{SHELL_USER} && exec bash -li\"'"
        )
    } else if startup.is_empty() {
        format!("{setup} {IDLE_LOOP}")
    } else {
        format!("{setup} {startup}")
    };

    vec!["sh".to_string(), "-lc".to_string(), script]
}

/// Labels stamped on a freshly provisioned lab.
pub fn lab_labels(
    challenge_id: u64,
    access_type: &AccessType,
    internal_port: Option<u16>,
) -> HashMap<String, String> {
    let mut labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (CHALLENGE_ID_LABEL.to_string(), challenge_id.to_string()),
        (ACCESS_TYPE_LABEL.to_string(), access_type.to_string()),
    ]);
    if access_type.is_terminal() {
        labels.insert(SHELL_USER_LABEL.to_string(), SHELL_USER.to_string());
    }
    if let Some(port) = internal_port {
        labels.insert(INTERNAL_PORT_LABEL.to_string(), port.to_string());
    }
    labels
}

fn flag_refresh_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-lc".to_string(),
        format!("printf '%s' \"$FLAG\" > {FLAG_PATH} && chmod 400 {FLAG_PATH}"),
    ]
}

fn shell(script: String) -> Vec<String> {
    vec!["sh".to_string(), "-lc".to_string(), script]
}

fn identity_of(info: &ContainerInspectResponse) -> ContainerIdentity {
    let labels = info
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();
    ContainerIdentity::parse(&labels, info.name.as_deref().unwrap_or_default())
}

fn required_image(spec: &ProvisionSpec) -> LabResult<&str> {
    let image = spec.image.trim();
    if image.is_empty() {
        return Err(LabError::Validation(
            "Missing image for challenge container".to_string(),
        ));
    }
    Ok(image)
}

/// Held per-challenge lock. The map entry is dropped once nobody else holds or awaits it.
struct ChallengeGuard<'a> {
    locks: &'a DashMap<u64, Arc<Mutex<()>>>,
    challenge_id: u64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ChallengeGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.challenge_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Owns the lab containers of every challenge on one daemon.
pub struct LabOrchestrator {
    docker: DockerClient,
    config: OrchestratorConfig,
    challenge_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl LabOrchestrator {
    pub fn new(docker: DockerClient, config: OrchestratorConfig) -> Self {
        Self {
            docker,
            config,
            challenge_locks: DashMap::new(),
        }
    }

    pub fn docker(&self) -> &DockerClient {
        &self.docker
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn ping(&self) -> LabResult<()> {
        self.docker.ping().await
    }

    async fn lock_challenge(&self, challenge_id: u64) -> ChallengeGuard<'_> {
        let lock = self
            .challenge_locks
            .entry(challenge_id)
            .or_default()
            .value()
            .clone();
        ChallengeGuard {
            locks: &self.challenge_locks,
            challenge_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Lists containers as report rows, running first and then by name.
    pub async fn list_containers(&self, filter: ListFilter) -> LabResult<Vec<ManagedContainer>> {
        let containers = self.docker.list(!filter.running).await?;

        let rows: Vec<ManagedContainer> = containers
            .iter()
            .map(ManagedContainer::from_inspect)
            .filter(|row| !filter.managed || row.managed)
            .collect();

        let mut rows = futures::future::join_all(rows.into_iter().map(|mut row| async move {
            if filter.logons && row.status.is_running() {
                row.active_logons = self.active_logons(&row.id).await;
            }
            row
        }))
        .await;

        rows.sort_by(|a, b| {
            (!a.status.is_running(), &a.name).cmp(&(!b.status.is_running(), &b.name))
        });
        Ok(rows)
    }

    /// Number of interactive sessions inside a running container, if it can be told.
    pub async fn active_logons(&self, container_id: &str) -> Option<u64> {
        for probe in LOGON_PROBES {
            match self.docker.exec(container_id, shell(probe.to_string()), None).await {
                Ok(out) if out.success() => {
                    let text = out.output.trim();
                    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
                        if let Ok(count) = text.parse() {
                            return Some(count);
                        }
                    }
                }
                Ok(out) => {
                    debug!(container_id = %container_id, exit_code = out.exit_code, "Logon probe failed");
                }
                Err(e) => {
                    debug!(container_id = %container_id, error = %e, "Logon probe failed");
                }
            }
        }
        None
    }

    /// Tail of a container's combined output. `tail` must be within 10..=2000.
    pub async fn logs(&self, container_id: &str, tail: usize) -> LabResult<String> {
        if !(10..=2000).contains(&tail) {
            return Err(LabError::Validation(
                "tail must be between 10 and 2000".to_string(),
            ));
        }
        let info = self.docker.inspect(container_id).await?;
        let id = info.id.unwrap_or_else(|| container_id.to_string());
        self.docker.logs(&id, tail).await
    }

    /// Creates the challenge's lab from scratch and leaves it paused.
    ///
    /// Any existing lab under the deterministic name is force-removed first.
    pub async fn provision(
        &self,
        challenge_id: u64,
        spec: &ProvisionSpec,
    ) -> LabResult<ConnectionInfo> {
        required_image(spec)?;
        let _guard = self.lock_challenge(challenge_id).await;
        let info = self.provision_locked(challenge_id, spec).await?;
        Ok(resolve_connection(&info, &self.config))
    }

    async fn provision_locked(
        &self,
        challenge_id: u64,
        spec: &ProvisionSpec,
    ) -> LabResult<ContainerInspectResponse> {
        let image = required_image(spec)?;

        let name = lab_container_name(challenge_id);
        if let Some(existing) = self.docker.find_by_name(&name).await? {
            let id = existing.id.unwrap_or_else(|| name.clone());
            info!(challenge_id, container_id = %id, "Replacing existing lab container");
            self.docker.force_remove(&id).await?;
        }

        let port = spec.effective_port();
        let mut config = Config {
            image: Some(image.to_string()),
            cmd: Some(build_lab_command(
                spec.startup_command.as_deref(),
                &spec.access_type,
                port,
            )),
            env: Some(vec![format!(
                "FLAG={}",
                spec.flag.as_deref().unwrap_or_default()
            )]),
            labels: Some(lab_labels(challenge_id, &spec.access_type, port)),
            ..Default::default()
        };
        if let Some(port) = port {
            let key = format!("{port}/tcp");
            config.exposed_ports = Some(HashMap::from([(key.clone(), HashMap::new())]));
            config.host_config = Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    key,
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(String::new()),
                    }]),
                )])),
                ..Default::default()
            });
        }

        let id = self.docker.run(Some(&name), config).await?;
        self.docker.pause(&id).await?;
        info!(
            challenge_id,
            container_id = %id,
            access_type = %spec.access_type,
            "Provisioned lab container"
        );
        self.docker.inspect(&id).await
    }

    /// Makes the challenge's lab reachable, creating or recreating it as needed.
    pub async fn activate(
        &self,
        challenge_id: u64,
        spec: &ProvisionSpec,
    ) -> LabResult<ConnectionInfo> {
        let _guard = self.lock_challenge(challenge_id).await;

        let name = lab_container_name(challenge_id);
        let mut existing = self.docker.find_by_name(&name).await?;

        if let Some(info) = &existing {
            let identity = identity_of(info);
            let stale = spec.access_type.is_terminal()
                && (identity.internal_port.is_none()
                    || identity.shell_user.as_deref() != Some(SHELL_USER));
            if stale {
                let id = info.id.clone().unwrap_or_else(|| name.clone());
                info!(challenge_id, container_id = %id, "Removing stale lab container");
                self.docker.force_remove(&id).await?;
                existing = None;
            }
        }

        let info = match existing {
            Some(info) => info,
            None => self.provision_locked(challenge_id, spec).await?,
        };
        let id = info.id.clone().unwrap_or(name);

        let info = self.ensure_running(&id).await?;

        if let Some(flag) = &spec.flag {
            self.refresh_flag(&id, flag).await;
        }

        info!(challenge_id, container_id = %id, "Activated lab container");
        Ok(resolve_connection(&info, &self.config))
    }

    async fn ensure_running(&self, id: &str) -> LabResult<ContainerInspectResponse> {
        let mut info = self.docker.inspect(id).await?;
        if info.state.as_ref().and_then(|s| s.paused).unwrap_or(false) {
            self.docker.unpause(id).await?;
            info = self.docker.inspect(id).await?;
        }
        if status_of(&info) != ContainerStatus::Running {
            self.docker.start(id).await?;
            info = self.docker.inspect(id).await?;
        }
        Ok(info)
    }

    async fn refresh_flag(&self, id: &str, flag: &str) {
        let env = vec![format!("FLAG={flag}")];
        match self.docker.exec(id, flag_refresh_command(), Some(env)).await {
            Ok(out) if out.success() => debug!(container_id = %id, "Flag refreshed"),
            Ok(out) => {
                warn!(container_id = %id, exit_code = out.exit_code, "Flag refresh failed")
            }
            Err(e) => warn!(container_id = %id, error = %e, "Flag refresh failed"),
        }
    }

    /// Removes a container and recreates it from its own live attributes.
    ///
    /// Secondary networks are reattached best-effort. Returns the new container id.
    pub async fn reset(&self, info: &ContainerInspectResponse) -> LabResult<String> {
        let spec = RunSpec::from_inspect(info).cleaned();
        let old_id = info.id.clone().unwrap_or_else(|| spec.name.clone());

        self.docker.force_remove(&old_id).await?;
        let name = (!spec.name.is_empty()).then_some(spec.name.as_str());
        let new_id = self.docker.run(name, spec.create_config()).await?;

        for network in &spec.secondary_networks {
            if let Err(e) = self
                .docker
                .connect_network(&network.name, &new_id, network.aliases.clone())
                .await
            {
                warn!(
                    container_id = %new_id,
                    network = %network.name,
                    error = %e,
                    "Failed to reattach network"
                );
            }
        }

        info!(old_id = %short_id(&old_id), new_id = %short_id(&new_id), "Container reset");
        Ok(new_id)
    }

    /// Applies a lifecycle action to any non-protected container.
    ///
    /// Returns a human-readable summary of what happened.
    pub async fn action(&self, container_id: &str, action: ContainerAction) -> LabResult<String> {
        let info = self.docker.inspect(container_id).await?;
        let identity = identity_of(&info);
        let name = info
            .name
            .as_deref()
            .unwrap_or(container_id)
            .trim_start_matches('/')
            .to_string();
        if identity.protected {
            warn!(container = %name, action = %action, "Refused action on protected container");
            return Err(LabError::Protected(name));
        }

        let _guard = match identity.challenge_id {
            Some(challenge_id) => Some(self.lock_challenge(challenge_id).await),
            None => None,
        };

        let id = info.id.clone().unwrap_or_else(|| container_id.to_string());
        let grace = self.config.grace_period;
        let message = match action {
            ContainerAction::Restart => {
                self.docker.restart(&id, grace).await?;
                "Container restarted".to_string()
            }
            ContainerAction::Stop => {
                self.docker.stop(&id, grace).await?;
                "Container stopped".to_string()
            }
            ContainerAction::Remove => {
                self.docker.force_remove(&id).await?;
                "Container removed".to_string()
            }
            ContainerAction::Reset => {
                let new_id = self.reset(&info).await?;
                format!("Container reset to {}", short_id(&new_id))
            }
        };
        info!(container = %name, action = %action, "{}", message);
        Ok(message)
    }

    /// Checks the lab's shell history against the expected commands.
    pub async fn autograde(
        &self,
        challenge_id: u64,
        commands: &[String],
    ) -> LabResult<AutogradeOutcome> {
        let expected: Vec<String> = commands
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if expected.is_empty() {
            return Err(LabError::Validation(
                "Missing expected command list".to_string(),
            ));
        }

        let Some(info) = self
            .docker
            .find_by_name(&lab_container_name(challenge_id))
            .await?
        else {
            return Ok(AutogradeOutcome::unmatched(
                UnmatchedReason::ContainerNotFound,
            ));
        };
        let id = info.id.unwrap_or_default();

        let history = self.read_history(&id).await;
        Ok(match find_match(&history, &expected) {
            Some(result) => {
                info!(challenge_id, matched = %result.matched_command, "Autograde matched");
                AutogradeOutcome::Matched(result)
            }
            None => AutogradeOutcome::unmatched(UnmatchedReason::NoMatch),
        })
    }

    async fn read_history(&self, id: &str) -> Vec<String> {
        let script = format!(
            "tail -n {} {HISTORY_PATH} 2>/dev/null || true",
            self.config.history_lines
        );
        match self.docker.exec(id, shell(script), None).await {
            Ok(out) if out.success() => out
                .output
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Ok(out) => {
                debug!(container_id = %id, exit_code = out.exit_code, "History read failed");
                Vec::new()
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "History read failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDocker;
    use bollard::models::PortMap;

    fn orchestrator() -> (FakeDocker, LabOrchestrator) {
        let fake = FakeDocker::default();
        let orchestrator = LabOrchestrator::new(
            DockerClient::with_bridge(fake.clone()),
            OrchestratorConfig::default(),
        );
        (fake, orchestrator)
    }

    fn terminal_spec() -> ProvisionSpec {
        ProvisionSpec {
            image: "ctf/linux-basics:1".to_string(),
            flag: Some("flag{first}".to_string()),
            ..Default::default()
        }
    }

    fn labels_of(info: &ContainerInspectResponse) -> HashMap<String, String> {
        info.config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_effective_port_defaults_for_terminal_only() {
        assert_eq!(terminal_spec().effective_port(), Some(7681));
        let rdp = ProvisionSpec {
            access_type: AccessType::Rdp,
            ..terminal_spec()
        };
        assert_eq!(rdp.effective_port(), None);
        let custom = ProvisionSpec {
            internal_port: Some(8080),
            ..terminal_spec()
        };
        assert_eq!(custom.effective_port(), Some(8080));
    }

    #[test]
    fn test_build_lab_command_terminal() {
        let cmd = build_lab_command(Some("service ssh start"), &AccessType::Terminal, Some(7681));
        assert_eq!(&cmd[..2], &["sh".to_string(), "-lc".to_string()]);
        let script = &cmd[2];
        assert!(script.starts_with("mkdir -p /opt/ctf && printf '%s' \"$FLAG\" > /opt/ctf/flag.txt"));
        assert!(script.contains("(service ssh start) & exec ttyd -W -p 7681 -i 0.0.0.0"));
        assert!(script.contains("sudo -u ctf -H"));
    }

    #[test]
    fn test_build_lab_command_other_access() {
        let idle = build_lab_command(None, &AccessType::Rdp, Some(3389));
        assert!(idle[2].ends_with("while true; do sleep 3600; done"));
        assert!(!idle[2].contains("ttyd"));

        let custom = build_lab_command(Some("  /start.sh  "), &AccessType::Rdp, None);
        assert!(custom[2].ends_with("; /start.sh"));
    }

    #[test]
    fn test_container_action_parsing() {
        assert_eq!(" Reset ".parse::<ContainerAction>().unwrap(), ContainerAction::Reset);
        let err = "explode".parse::<ContainerAction>().unwrap_err();
        assert!(matches!(err, LabError::Validation(ref m) if m == "Invalid action"));
    }

    #[test]
    fn test_autograde_outcome_serialization() {
        let json = serde_json::to_value(AutogradeOutcome::unmatched(
            UnmatchedReason::ContainerNotFound,
        ))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"matched": false, "reason": "container_not_found"})
        );
    }

    #[tokio::test]
    async fn test_provision_twice_keeps_single_container() {
        let (fake, orchestrator) = orchestrator();

        let first = orchestrator.provision(42, &terminal_spec()).await.unwrap();
        let second = orchestrator.provision(42, &terminal_spec()).await.unwrap();

        assert_ne!(first.container_id, second.container_id);
        assert_eq!(fake.container_count(), 1);
        let current = fake.container("ctfd-challenge-42-lab").unwrap();
        assert_eq!(current.id, Some(second.container_id.clone()));
        assert_eq!(fake.status("ctfd-challenge-42-lab"), Some("paused"));
        assert!(second.paused);
        assert!(fake
            .operations()
            .contains(&format!("remove:{}", first.container_id)));
    }

    #[tokio::test]
    async fn test_concurrent_provisions_serialize() {
        let (fake, orchestrator) = orchestrator();
        let spec = terminal_spec();
        let (a, b) = tokio::join!(
            orchestrator.provision(9, &spec),
            orchestrator.provision(9, &spec)
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(fake.container_count(), 1);
        assert!(orchestrator.challenge_locks.is_empty());
    }

    #[tokio::test]
    async fn test_provision_requires_image() {
        let (fake, orchestrator) = orchestrator();
        let spec = ProvisionSpec {
            image: "   ".to_string(),
            ..terminal_spec()
        };
        let err = orchestrator.provision(1, &spec).await.unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
        assert_eq!(fake.container_count(), 0);
        assert!(fake.operations().is_empty());
    }

    #[tokio::test]
    async fn test_challenge_locks_do_not_accumulate() {
        let (_fake, orchestrator) = orchestrator();
        let missing = ProvisionSpec::default();
        for challenge_id in 0..50 {
            assert!(orchestrator.provision(challenge_id, &missing).await.is_err());
            assert!(orchestrator.activate(challenge_id, &missing).await.is_err());
        }
        orchestrator.provision(7, &terminal_spec()).await.unwrap();
        orchestrator.activate(7, &terminal_spec()).await.unwrap();
        assert!(orchestrator.challenge_locks.is_empty());
    }

    #[test]
    fn test_provision_spec_treats_null_as_missing() {
        let spec: ProvisionSpec = serde_json::from_value(serde_json::json!({
            "image": null,
            "flag": null,
            "access_type": null
        }))
        .unwrap();
        assert_eq!(spec.image, "");
        assert_eq!(spec.flag, None);
        assert_eq!(spec.access_type, AccessType::default());
    }

    #[tokio::test]
    async fn test_provision_terminal_defaults() {
        let (fake, orchestrator) = orchestrator();
        orchestrator.provision(5, &terminal_spec()).await.unwrap();

        let info = fake.container("ctfd-challenge-5-lab").unwrap();
        let labels = labels_of(&info);
        assert_eq!(labels.get("ctfd.internal_port").map(String::as_str), Some("7681"));
        assert_eq!(labels.get("ctfd.shell_user").map(String::as_str), Some("ctf"));
        assert_eq!(labels.get("ctfd.managed").map(String::as_str), Some("true"));
        assert_eq!(labels.get("ctfd.challenge_id").map(String::as_str), Some("5"));

        let config = info.config.unwrap_or_default();
        assert_eq!(config.env, Some(vec!["FLAG=flag{first}".to_string()]));
        let cmd = config.cmd.unwrap_or_default();
        assert!(cmd[2].contains("ttyd -W -p 7681"));
    }

    #[tokio::test]
    async fn test_activate_never_provisioned() {
        let (fake, orchestrator) = orchestrator();
        let info = orchestrator.activate(7, &terminal_spec()).await.unwrap();

        assert_eq!(info.status, ContainerStatus::Running);
        assert!(!info.paused);
        assert_eq!(fake.status("ctfd-challenge-7-lab"), Some("running"));
        let port = info.port.unwrap();
        assert_eq!(info.url, Some(format!("http://localhost:{port}")));
    }

    #[tokio::test]
    async fn test_activate_unpauses_and_refreshes_flag() {
        let (fake, orchestrator) = orchestrator();
        let provisioned = orchestrator.provision(8, &terminal_spec()).await.unwrap();

        let spec = ProvisionSpec {
            flag: Some("flag{second}".to_string()),
            ..terminal_spec()
        };
        let info = orchestrator.activate(8, &spec).await.unwrap();

        assert_eq!(info.container_id, provisioned.container_id);
        assert_eq!(info.status, ContainerStatus::Running);
        let refresh = fake
            .exec_calls()
            .into_iter()
            .find(|call| call.command.contains("/opt/ctf/flag.txt"))
            .unwrap();
        assert_eq!(refresh.env, vec!["FLAG=flag{second}".to_string()]);
    }

    #[tokio::test]
    async fn test_activate_without_flag_skips_refresh() {
        let (fake, orchestrator) = orchestrator();
        let spec = ProvisionSpec {
            flag: None,
            ..terminal_spec()
        };
        orchestrator.activate(8, &spec).await.unwrap();
        assert!(fake.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_activate_recreates_stale_terminal_container() {
        let (fake, orchestrator) = orchestrator();
        let stale_id = fake.seed_running(
            "ctfd-challenge-11-lab",
            Config {
                image: Some("ctf/old:1".to_string()),
                labels: Some(HashMap::from([(
                    "ctfd.challenge_id".to_string(),
                    "11".to_string(),
                )])),
                ..Default::default()
            },
        );

        let info = orchestrator.activate(11, &terminal_spec()).await.unwrap();

        assert_ne!(info.container_id, stale_id);
        assert!(fake.container(&stale_id).is_none());
        let labels = labels_of(&fake.container(&info.container_id).unwrap());
        assert_eq!(labels.get("ctfd.internal_port").map(String::as_str), Some("7681"));
        assert_eq!(info.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_activate_without_image_and_container_fails() {
        let (_fake, orchestrator) = orchestrator();
        let err = orchestrator
            .activate(3, &ProvisionSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
    }

    #[tokio::test]
    async fn test_reset_preserves_configuration() {
        let (fake, orchestrator) = orchestrator();
        let mut ports: PortMap = HashMap::new();
        ports.insert(
            "8080/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some("18080".to_string()),
            }]),
        );
        let original = orchestrator
            .docker()
            .run(
                Some("ctfd-challenge-21-lab"),
                Config {
                    image: Some("ctf/web:2".to_string()),
                    env: Some(vec!["FLAG=flag{web}".to_string(), "MODE=hard".to_string()]),
                    labels: Some(HashMap::from([
                        ("ctfd.challenge_id".to_string(), "21".to_string()),
                        ("team".to_string(), "blue".to_string()),
                    ])),
                    host_config: Some(HostConfig {
                        network_mode: Some("labnet".to_string()),
                        port_bindings: Some(ports.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        orchestrator
            .docker()
            .connect_network("backend", &original, Some(vec!["api".to_string()]))
            .await
            .unwrap();

        let message = orchestrator
            .action(&original, ContainerAction::Reset)
            .await
            .unwrap();

        let recreated = fake.container("ctfd-challenge-21-lab").unwrap();
        let new_id = recreated.id.clone().unwrap();
        assert_ne!(new_id, original);
        assert_eq!(message, format!("Container reset to {}", short_id(&new_id)));
        assert_eq!(fake.status(&new_id), Some("running"));

        let config = recreated.config.clone().unwrap_or_default();
        assert_eq!(
            config.env,
            Some(vec!["FLAG=flag{web}".to_string(), "MODE=hard".to_string()])
        );
        let labels = labels_of(&recreated);
        assert_eq!(labels.get("team").map(String::as_str), Some("blue"));

        let host = recreated.host_config.clone().unwrap_or_default();
        assert_eq!(host.port_bindings, Some(ports));
        assert_eq!(host.network_mode.as_deref(), Some("labnet"));

        let networks = recreated
            .network_settings
            .and_then(|n| n.networks)
            .unwrap_or_default();
        assert_eq!(
            networks.get("backend").and_then(|e| e.aliases.clone()),
            Some(vec!["api".to_string()])
        );
    }

    #[tokio::test]
    async fn test_reset_tolerates_missing_secondary_network() {
        let (fake, orchestrator) = orchestrator();
        let id = fake.seed_running("lab-x", Config::default());
        orchestrator
            .docker()
            .connect_network("gone", &id, None)
            .await
            .unwrap();
        fake.remove_network("gone");

        let message = orchestrator.action(&id, ContainerAction::Reset).await.unwrap();
        assert!(message.starts_with("Container reset to "));
        assert_eq!(fake.container_count(), 1);
    }

    #[tokio::test]
    async fn test_protected_container_refuses_every_action() {
        let (fake, orchestrator) = orchestrator();
        let id = fake.seed_running(
            "ctfd-db-1",
            Config {
                labels: Some(HashMap::from([(
                    "com.docker.compose.service".to_string(),
                    "db".to_string(),
                )])),
                ..Default::default()
            },
        );

        for action in ContainerAction::ALL {
            let err = orchestrator.action(&id, action).await.unwrap_err();
            assert!(matches!(err, LabError::Protected(_)), "{action} was not refused");
            assert_eq!(fake.status(&id), Some("running"));
        }
        assert_eq!(fake.container_count(), 1);
        assert!(fake.operations().is_empty());
    }

    #[tokio::test]
    async fn test_actions_on_regular_container() {
        let (fake, orchestrator) = orchestrator();
        let id = fake.seed_running("scratch", Config::default());

        assert_eq!(
            orchestrator.action(&id, ContainerAction::Stop).await.unwrap(),
            "Container stopped"
        );
        assert_eq!(fake.status(&id), Some("exited"));
        assert_eq!(
            orchestrator.action(&id, ContainerAction::Restart).await.unwrap(),
            "Container restarted"
        );
        assert_eq!(fake.status(&id), Some("running"));
        assert_eq!(
            orchestrator.action(&id, ContainerAction::Remove).await.unwrap(),
            "Container removed"
        );
        assert_eq!(fake.container_count(), 0);
    }

    #[tokio::test]
    async fn test_action_on_missing_container() {
        let (_fake, orchestrator) = orchestrator();
        let err = orchestrator
            .action("deadbeef", ContainerAction::Stop)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_containers_filters_and_sorts() {
        let (fake, orchestrator) = orchestrator();
        fake.set_exec_response("who", 0, "2\n");
        orchestrator.activate(2, &terminal_spec()).await.unwrap();
        orchestrator.provision(1, &terminal_spec()).await.unwrap();
        fake.seed_running("zz-unmanaged", Config::default());
        let stopped = fake.seed_running("aa-stopped", Config::default());
        orchestrator
            .docker()
            .stop(&stopped, std::time::Duration::from_secs(1))
            .await
            .unwrap();

        let running = orchestrator.list_containers(ListFilter::default()).await.unwrap();
        let names: Vec<_> = running.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ctfd-challenge-2-lab", "zz-unmanaged"]);
        assert!(running.iter().all(|r| r.active_logons == Some(2)));

        let all_managed = orchestrator
            .list_containers(ListFilter {
                running: false,
                managed: true,
                logons: false,
            })
            .await
            .unwrap();
        let names: Vec<_> = all_managed.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ctfd-challenge-2-lab", "ctfd-challenge-1-lab"]);
        assert!(all_managed.iter().all(|r| r.active_logons.is_none()));

        let everything = orchestrator
            .list_containers(ListFilter {
                running: false,
                managed: false,
                logons: false,
            })
            .await
            .unwrap();
        let names: Vec<_> = everything.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ctfd-challenge-2-lab",
                "zz-unmanaged",
                "aa-stopped",
                "ctfd-challenge-1-lab"
            ]
        );
    }

    #[tokio::test]
    async fn test_active_logons_falls_back_to_tty_count() {
        let (fake, orchestrator) = orchestrator();
        fake.set_exec_response("who", 127, "sh: who: not found");
        fake.set_exec_response("ps -eo", 0, "4\n");
        let id = fake.seed_running("box", Config::default());
        assert_eq!(orchestrator.active_logons(&id).await, Some(4));
    }

    #[tokio::test]
    async fn test_active_logons_unknown() {
        let (fake, orchestrator) = orchestrator();
        fake.set_exec_response("wc -l", 0, "lots");
        let id = fake.seed_running("box", Config::default());
        assert_eq!(orchestrator.active_logons(&id).await, None);
    }

    #[tokio::test]
    async fn test_logs_validates_tail() {
        let (fake, orchestrator) = orchestrator();
        let id = fake.seed_running("box", Config::default());
        fake.push_log(&id, "booted\n");

        assert!(matches!(
            orchestrator.logs(&id, 5).await,
            Err(LabError::Validation(_))
        ));
        assert!(matches!(
            orchestrator.logs(&id, 2001).await,
            Err(LabError::Validation(_))
        ));
        assert_eq!(orchestrator.logs(&id, 300).await.unwrap(), "booted\n");
        assert!(matches!(
            orchestrator.logs("missing", 300).await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_autograde_matches_history() {
        let (fake, orchestrator) = orchestrator();
        fake.set_exec_response(".bash_history", 0, "cd /tmp\npwd\n");
        orchestrator.activate(4, &terminal_spec()).await.unwrap();

        let outcome = orchestrator
            .autograde(4, &["pwd".to_string()])
            .await
            .unwrap();
        match outcome {
            AutogradeOutcome::Matched(result) => {
                assert!(result.matched);
                assert_eq!(result.matched_command, "pwd");
                assert_eq!(result.expected_command, "pwd");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let read = fake
            .exec_calls()
            .into_iter()
            .find(|c| c.command.contains(".bash_history"))
            .unwrap();
        assert!(read.command.contains("tail -n 4000 /home/ctf/.bash_history"));
    }

    #[tokio::test]
    async fn test_autograde_unmatched_reasons() {
        let (fake, orchestrator) = orchestrator();
        let missing = orchestrator
            .autograde(4, &["pwd".to_string()])
            .await
            .unwrap();
        assert_eq!(
            missing,
            AutogradeOutcome::unmatched(UnmatchedReason::ContainerNotFound)
        );

        fake.set_exec_response(".bash_history", 0, "id\n");
        orchestrator.activate(4, &terminal_spec()).await.unwrap();
        let none = orchestrator
            .autograde(4, &["pwd".to_string()])
            .await
            .unwrap();
        assert_eq!(none, AutogradeOutcome::unmatched(UnmatchedReason::NoMatch));
    }

    #[tokio::test]
    async fn test_autograde_requires_commands() {
        let (_fake, orchestrator) = orchestrator();
        let err = orchestrator
            .autograde(4, &["  ".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(ref m) if m == "Missing expected command list"));
    }
}
