//! In-memory Docker stand-in for tests
//!
//! Models just enough daemon behaviour for the orchestrator: unique names,
//! created/running/paused/exited states, random host port assignment on start,
//! network attachments with aliases, scripted exec output and container logs.
//! Every mutating call is appended to an operation log.

use crate::docker::{DockerBridge, ExecOutput, LogStream};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::CreateExecOptions;
use bollard::models::{
    ContainerConfig, ContainerCreateResponse, ContainerInspectResponse, ContainerState,
    ContainerStateStatusEnum, ContainerSummary, EndpointSettings, NetworkSettings, PortBinding,
    PortMap,
};
use bollard::network::ConnectNetworkOptions;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct FakeDocker {
    inner: Arc<FakeDockerInner>,
}

struct FakeDockerInner {
    containers: Mutex<Vec<ContainerInspectResponse>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    exec_rules: Mutex<Vec<(String, ExecOutput)>>,
    exec_calls: Mutex<Vec<ExecCall>>,
    operations: Mutex<Vec<String>>,
    failing_removals: Mutex<HashSet<String>>,
    missing_networks: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    failing_starts: AtomicBool,
    next_id: AtomicUsize,
    next_host_port: AtomicU16,
}

impl Default for FakeDockerInner {
    fn default() -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            logs: Mutex::new(HashMap::new()),
            exec_rules: Mutex::new(Vec::new()),
            exec_calls: Mutex::new(Vec::new()),
            operations: Mutex::new(Vec::new()),
            failing_removals: Mutex::new(HashSet::new()),
            missing_networks: Mutex::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
            failing_starts: AtomicBool::new(false),
            next_id: AtomicUsize::new(1),
            next_host_port: AtomicU16::new(32768),
        }
    }
}

/// One recorded exec invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecCall {
    pub container_id: String,
    pub command: String,
    pub env: Vec<String>,
}

fn server_error(status_code: u16, message: impl Into<String>) -> DockerError {
    DockerError::DockerResponseServerError {
        status_code,
        message: message.into(),
    }
}

fn no_such_container(id: &str) -> DockerError {
    server_error(404, format!("No such container: {id}"))
}

fn status_of(info: &ContainerInspectResponse) -> ContainerStateStatusEnum {
    info.state
        .as_ref()
        .and_then(|s| s.status)
        .unwrap_or(ContainerStateStatusEnum::EMPTY)
}

fn status_name(status: ContainerStateStatusEnum) -> &'static str {
    match status {
        ContainerStateStatusEnum::CREATED => "created",
        ContainerStateStatusEnum::RUNNING => "running",
        ContainerStateStatusEnum::PAUSED => "paused",
        ContainerStateStatusEnum::RESTARTING => "restarting",
        ContainerStateStatusEnum::REMOVING => "removing",
        ContainerStateStatusEnum::EXITED => "exited",
        ContainerStateStatusEnum::DEAD => "dead",
        _ => "",
    }
}

fn set_status(info: &mut ContainerInspectResponse, status: ContainerStateStatusEnum) {
    let now = chrono::Utc::now().to_rfc3339();
    let state = info.state.get_or_insert_with(ContainerState::default);
    state.status = Some(status);
    state.running = Some(matches!(
        status,
        ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::PAUSED
    ));
    state.paused = Some(status == ContainerStateStatusEnum::PAUSED);
    match status {
        ContainerStateStatusEnum::RUNNING => state.started_at = Some(now),
        ContainerStateStatusEnum::EXITED => state.finished_at = Some(now),
        _ => {}
    }
}

fn matches_reference(info: &ContainerInspectResponse, reference: &str) -> bool {
    let reference = reference.trim_start_matches('/');
    let by_name = info
        .name
        .as_deref()
        .map(|n| n.trim_start_matches('/') == reference)
        .unwrap_or(false);
    let by_id = info
        .id
        .as_deref()
        .map(|id| !reference.is_empty() && id.starts_with(reference))
        .unwrap_or(false);
    by_name || by_id
}

impl FakeDocker {
    /// Operation log, e.g. `create:<name>`, `start:<id>`, `remove:<id>`.
    pub fn operations(&self) -> Vec<String> {
        self.inner.operations.lock().clone()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.inner.exec_calls.lock().clone()
    }

    /// Makes every call fail as if the daemon socket were gone.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Any exec whose joined command contains `pattern` answers with this output.
    pub fn set_exec_response(&self, pattern: &str, exit_code: i64, output: &str) {
        self.inner.exec_rules.lock().push((
            pattern.to_string(),
            ExecOutput {
                exit_code,
                output: output.to_string(),
            },
        ));
    }

    /// Every start fails with a daemon-side 500, as when the entrypoint cannot be found.
    pub fn set_start_failure(&self, failing: bool) {
        self.inner.failing_starts.store(failing, Ordering::SeqCst);
    }

    pub fn push_log(&self, container_id: &str, line: &str) {
        self.inner
            .logs
            .lock()
            .entry(container_id.to_string())
            .or_default()
            .push(line.to_string());
    }

    /// Removal of this id fails with a daemon-side 500.
    pub fn fail_removal(&self, container_id: &str) {
        self.inner
            .failing_removals
            .lock()
            .insert(container_id.to_string());
    }

    pub fn allow_removal(&self, container_id: &str) {
        self.inner.failing_removals.lock().remove(container_id);
    }

    /// Connecting anything to this network fails with a 404.
    pub fn remove_network(&self, network: &str) {
        self.inner
            .missing_networks
            .lock()
            .insert(network.to_string());
    }

    pub fn container(&self, reference: &str) -> Option<ContainerInspectResponse> {
        self.inner
            .containers
            .lock()
            .iter()
            .find(|c| matches_reference(c, reference))
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.inner.containers.lock().len()
    }

    /// Daemon status string (`running`, `paused`, `exited`, ...) of a container.
    pub fn status(&self, reference: &str) -> Option<&'static str> {
        self.container(reference).map(|c| status_name(status_of(&c)))
    }

    /// Creates and starts a container directly, bypassing the operation log.
    pub fn seed_running(&self, name: &str, config: Config<String>) -> String {
        let id = self.insert(Some(name.to_string()), config);
        self.with_container(&id, |info| {
            Self::publish_ports(&self.inner.next_host_port, info);
            set_status(info, ContainerStateStatusEnum::RUNNING);
            Ok(())
        })
        .ok();
        id
    }

    fn record(&self, entry: impl Into<String>) {
        self.inner.operations.lock().push(entry.into());
    }

    fn check_available(&self) -> Result<(), DockerError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(DockerError::IOError {
                err: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "docker socket unavailable",
                ),
            });
        }
        Ok(())
    }

    fn with_container<T>(
        &self,
        reference: &str,
        f: impl FnOnce(&mut ContainerInspectResponse) -> Result<T, DockerError>,
    ) -> Result<T, DockerError> {
        let mut containers = self.inner.containers.lock();
        let info = containers
            .iter_mut()
            .find(|c| matches_reference(c, reference))
            .ok_or_else(|| no_such_container(reference))?;
        f(info)
    }

    fn insert(&self, name: Option<String>, config: Config<String>) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{:012x}{:052x}", n, 0);
        let name = name.unwrap_or_else(|| format!("fake_{n}"));

        let host_config = config.host_config.clone().unwrap_or_default();
        let primary = host_config
            .network_mode
            .clone()
            .filter(|mode| !mode.is_empty() && mode != "default")
            .unwrap_or_else(|| "bridge".to_string());
        let primary_aliases = config
            .networking_config
            .as_ref()
            .and_then(|nc| nc.endpoints_config.get(&primary))
            .and_then(|e| e.aliases.clone());
        let mut networks = HashMap::new();
        networks.insert(
            primary,
            EndpointSettings {
                aliases: primary_aliases,
                ..Default::default()
            },
        );

        let info = ContainerInspectResponse {
            id: Some(id.clone()),
            name: Some(format!("/{name}")),
            created: Some(chrono::Utc::now().to_rfc3339()),
            image: Some(format!("sha256:{:064x}", n)),
            config: Some(ContainerConfig {
                hostname: config.hostname.clone().or_else(|| Some(id[..12].to_string())),
                user: config.user.clone(),
                tty: config.tty,
                open_stdin: config.open_stdin,
                env: config.env.clone(),
                cmd: config.cmd.clone(),
                image: config.image.clone(),
                working_dir: config.working_dir.clone(),
                entrypoint: config.entrypoint.clone(),
                labels: config.labels.clone(),
                exposed_ports: config.exposed_ports.clone(),
                ..Default::default()
            }),
            host_config: Some(host_config),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::CREATED),
                running: Some(false),
                paused: Some(false),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.inner.containers.lock().push(info);
        id
    }

    fn publish_ports(next_port: &AtomicU16, info: &mut ContainerInspectResponse) {
        let bindings = info
            .host_config
            .as_ref()
            .and_then(|h| h.port_bindings.clone())
            .unwrap_or_default();
        let mut ports: PortMap = HashMap::new();
        for (container_port, requested) in bindings {
            let requested = requested.unwrap_or_default();
            let requested = if requested.is_empty() {
                vec![PortBinding::default()]
            } else {
                requested
            };
            let assigned = requested
                .into_iter()
                .map(|binding| {
                    let host_port = binding
                        .host_port
                        .filter(|p| !p.is_empty() && p != "0")
                        .unwrap_or_else(|| next_port.fetch_add(1, Ordering::SeqCst).to_string());
                    PortBinding {
                        host_ip: Some(
                            binding
                                .host_ip
                                .filter(|ip| !ip.is_empty())
                                .unwrap_or_else(|| "0.0.0.0".to_string()),
                        ),
                        host_port: Some(host_port),
                    }
                })
                .collect();
            ports.insert(container_port, Some(assigned));
        }
        info.network_settings
            .get_or_insert_with(NetworkSettings::default)
            .ports = Some(ports);
    }

    fn clear_ports(info: &mut ContainerInspectResponse) {
        if let Some(settings) = info.network_settings.as_mut() {
            settings.ports = Some(HashMap::new());
        }
    }
}

#[async_trait]
impl DockerBridge for FakeDocker {
    async fn ping(&self) -> Result<(), DockerError> {
        self.check_available()
    }

    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        self.check_available()?;
        let all = options.map(|o| o.all).unwrap_or(false);
        Ok(self
            .inner
            .containers
            .lock()
            .iter()
            .filter(|c| all || status_of(c) == ContainerStateStatusEnum::RUNNING)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: c.name.clone().map(|n| vec![n]),
                image: c.config.as_ref().and_then(|cfg| cfg.image.clone()),
                labels: c.config.as_ref().and_then(|cfg| cfg.labels.clone()),
                state: Some(status_name(status_of(c)).to_string()),
                ..Default::default()
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        self.check_available()?;
        self.container(id).ok_or_else(|| no_such_container(id))
    }

    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        self.check_available()?;
        let name = options.map(|o| o.name);
        if let Some(name) = &name {
            if self.container(name).is_some() {
                return Err(server_error(
                    409,
                    format!("Conflict. The container name \"/{name}\" is already in use"),
                ));
            }
        }
        self.record(format!(
            "create:{}",
            name.clone().unwrap_or_else(|| "<anonymous>".to_string())
        ));
        let id = self.insert(name, config);
        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.check_available()?;
        if self.inner.failing_starts.load(Ordering::SeqCst) {
            return Err(server_error(500, "OCI runtime create failed: executable file not found"));
        }
        let next_port = &self.inner.next_host_port;
        self.with_container(id, |info| {
            if status_of(info) == ContainerStateStatusEnum::PAUSED {
                return Err(server_error(409, "cannot start a paused container"));
            }
            if status_of(info) != ContainerStateStatusEnum::RUNNING {
                Self::publish_ports(next_port, info);
                set_status(info, ContainerStateStatusEnum::RUNNING);
            }
            Ok(())
        })?;
        self.record(format!("start:{id}"));
        Ok(())
    }

    async fn stop_container(
        &self,
        id: &str,
        _options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError> {
        self.check_available()?;
        self.with_container(id, |info| {
            Self::clear_ports(info);
            set_status(info, ContainerStateStatusEnum::EXITED);
            Ok(())
        })?;
        self.record(format!("stop:{id}"));
        Ok(())
    }

    async fn restart_container(
        &self,
        id: &str,
        _options: Option<RestartContainerOptions>,
    ) -> Result<(), DockerError> {
        self.check_available()?;
        let next_port = &self.inner.next_host_port;
        self.with_container(id, |info| {
            Self::publish_ports(next_port, info);
            set_status(info, ContainerStateStatusEnum::RUNNING);
            Ok(())
        })?;
        self.record(format!("restart:{id}"));
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<(), DockerError> {
        self.check_available()?;
        self.with_container(id, |info| {
            if status_of(info) != ContainerStateStatusEnum::RUNNING {
                return Err(server_error(409, format!("Container {id} is not running")));
            }
            set_status(info, ContainerStateStatusEnum::PAUSED);
            Ok(())
        })?;
        self.record(format!("pause:{id}"));
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), DockerError> {
        self.check_available()?;
        self.with_container(id, |info| {
            if status_of(info) != ContainerStateStatusEnum::PAUSED {
                return Err(server_error(409, format!("Container {id} is not paused")));
            }
            set_status(info, ContainerStateStatusEnum::RUNNING);
            Ok(())
        })?;
        self.record(format!("unpause:{id}"));
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.check_available()?;
        let force = options.map(|o| o.force).unwrap_or(false);
        let mut containers = self.inner.containers.lock();
        let index = containers
            .iter()
            .position(|c| matches_reference(c, id))
            .ok_or_else(|| no_such_container(id))?;
        let full_id = containers[index].id.clone().unwrap_or_default();
        if self.inner.failing_removals.lock().contains(&full_id) {
            return Err(server_error(500, "driver failed to remove root filesystem"));
        }
        let status = status_of(&containers[index]);
        if !force
            && matches!(
                status,
                ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::PAUSED
            )
        {
            return Err(server_error(
                409,
                "You cannot remove a running container. Stop the container before attempting removal or force remove",
            ));
        }
        containers.remove(index);
        drop(containers);
        self.record(format!("remove:{full_id}"));
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<ExecOutput, DockerError> {
        self.check_available()?;
        let info = self.container(id).ok_or_else(|| no_such_container(id))?;
        if status_of(&info) != ContainerStateStatusEnum::RUNNING {
            return Err(server_error(
                409,
                format!("Container {id} is not running or is paused"),
            ));
        }

        let command = options.cmd.unwrap_or_default().join(" ");
        self.inner.exec_calls.lock().push(ExecCall {
            container_id: info.id.clone().unwrap_or_default(),
            command: command.clone(),
            env: options.env.unwrap_or_default(),
        });

        Ok(self
            .inner
            .exec_rules
            .lock()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    fn logs_stream(&self, id: &str, options: LogsOptions<String>) -> LogStream {
        let Some(info) = self.container(id) else {
            let err = no_such_container(id);
            return futures::stream::once(async move { Err(err) }).boxed();
        };
        let full_id = info.id.unwrap_or_default();
        let lines = self
            .inner
            .logs
            .lock()
            .get(&full_id)
            .cloned()
            .unwrap_or_default();
        let tail = options.tail.parse::<usize>().unwrap_or(lines.len());
        let skip = lines.len().saturating_sub(tail);
        let items: Vec<Result<LogOutput, DockerError>> = lines
            .into_iter()
            .skip(skip)
            .map(|line| {
                Ok(LogOutput::StdOut {
                    message: line.into(),
                })
            })
            .collect();
        futures::stream::iter(items).boxed()
    }

    async fn connect_network(
        &self,
        network: &str,
        options: ConnectNetworkOptions<String>,
    ) -> Result<(), DockerError> {
        self.check_available()?;
        if self.inner.missing_networks.lock().contains(network) {
            return Err(server_error(404, format!("network {network} not found")));
        }
        let container = options.container.clone();
        self.with_container(&container, |info| {
            info.network_settings
                .get_or_insert_with(NetworkSettings::default)
                .networks
                .get_or_insert_with(HashMap::new)
                .insert(network.to_string(), options.endpoint_config.clone());
            Ok(())
        })?;
        self.record(format!("connect:{network}:{container}"));
        Ok(())
    }
}
