//! Docker client wrapper for lab container management
//!
//! `DockerBridge` is the raw capability set the orchestrator needs from the
//! daemon. `BollardBridge` talks to a real daemon; tests substitute the
//! in-memory fake from [`crate::testing`].

use crate::error::{is_not_found, LabError, LabResult};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, EndpointSettings,
};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use futures::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;

/// Combined output and exit code of a command run inside a container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait DockerBridge: Send + Sync {
    async fn ping(&self) -> Result<(), DockerError>;
    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError>;
    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError>;
    async fn start_container(&self, id: &str) -> Result<(), DockerError>;
    async fn stop_container(
        &self,
        id: &str,
        options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError>;
    async fn restart_container(
        &self,
        id: &str,
        options: Option<RestartContainerOptions>,
    ) -> Result<(), DockerError>;
    async fn pause_container(&self, id: &str) -> Result<(), DockerError>;
    async fn unpause_container(&self, id: &str) -> Result<(), DockerError>;
    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError>;
    /// Runs a command to completion and collects stdout and stderr.
    async fn exec(
        &self,
        id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<ExecOutput, DockerError>;
    fn logs_stream(&self, id: &str, options: LogsOptions<String>) -> LogStream;
    async fn connect_network(
        &self,
        network: &str,
        options: ConnectNetworkOptions<String>,
    ) -> Result<(), DockerError>;
}

#[derive(Clone)]
pub struct BollardBridge {
    docker: Docker,
}

impl BollardBridge {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl DockerBridge for BollardBridge {
    async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await.map(|_| ())
    }

    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        self.docker.list_containers(options).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspectResponse, DockerError> {
        self.docker.inspect_container(id, None).await
    }

    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        self.docker.create_container(options, config).await
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
    }

    async fn stop_container(
        &self,
        id: &str,
        options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.stop_container(id, options).await
    }

    async fn restart_container(
        &self,
        id: &str,
        options: Option<RestartContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.restart_container(id, options).await
    }

    async fn pause_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker.pause_container(id).await
    }

    async fn unpause_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker.unpause_container(id).await
    }

    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.remove_container(id, options).await
    }

    /// Creates an exec instance, drains its attached output and reads back the exit code.
    async fn exec(
        &self,
        id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<ExecOutput, DockerError> {
        let exec = self.docker.create_exec(id, options).await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&chunk?.to_string());
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    fn logs_stream(&self, id: &str, options: LogsOptions<String>) -> LogStream {
        Box::pin(self.docker.logs(id, Some(options)))
    }

    async fn connect_network(
        &self,
        network: &str,
        options: ConnectNetworkOptions<String>,
    ) -> Result<(), DockerError> {
        self.docker.connect_network(network, options).await
    }
}

/// Docker client for managing lab containers
#[derive(Clone)]
pub struct DockerClient {
    docker: Arc<dyn DockerBridge>,
}

impl DockerClient {
    fn from_bridge(docker: Arc<dyn DockerBridge>) -> Self {
        Self { docker }
    }

    /// Constructs a DockerClient over any `DockerBridge` implementation.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use lab_orchestrator::testing::FakeDocker;
    /// use lab_orchestrator::DockerClient;
    ///
    /// let client = DockerClient::with_bridge(FakeDocker::default());
    /// # let _ = client;
    /// ```
    pub fn with_bridge(docker: impl DockerBridge + 'static) -> Self {
        Self::from_bridge(Arc::new(docker))
    }

    /// Connects to the local Docker daemon and pings it before handing out a client.
    ///
    /// # Errors
    ///
    /// Returns [`LabError::RuntimeUnavailable`] when the socket cannot be opened
    /// or the daemon does not answer the ping.
    pub async fn connect() -> LabResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| LabError::RuntimeUnavailable(e.to_string()))?;

        let bridge = Arc::new(BollardBridge::new(docker));
        bridge
            .ping()
            .await
            .map_err(|e| LabError::RuntimeUnavailable(e.to_string()))?;
        info!("Connected to Docker daemon");

        Ok(Self::from_bridge(bridge))
    }

    pub async fn ping(&self) -> LabResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| LabError::RuntimeUnavailable(e.to_string()))
    }

    pub async fn inspect(&self, id: &str) -> LabResult<ContainerInspectResponse> {
        Ok(self.docker.inspect_container(id).await?)
    }

    /// Looks a container up by its exact name.
    ///
    /// Returns `Ok(None)` when no container carries that name. The daemon also
    /// resolves id prefixes on inspect, so the returned name is checked.
    pub async fn find_by_name(&self, name: &str) -> LabResult<Option<ContainerInspectResponse>> {
        match self.docker.inspect_container(name).await {
            Ok(info) => {
                let matches = info
                    .name
                    .as_deref()
                    .map(|n| n.trim_start_matches('/') == name)
                    .unwrap_or(false);
                Ok(matches.then_some(info))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists containers with full inspect data.
    ///
    /// `all = false` restricts the listing to running containers. Containers
    /// that vanish between the list and the inspect are skipped.
    pub async fn list(&self, all: bool) -> LabResult<Vec<ContainerInspectResponse>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|c| c.id) {
            match self.docker.inspect_container(&id).await {
                Ok(info) => containers.push(info),
                Err(e) if is_not_found(&e) => {
                    debug!(container_id = %id, "Container disappeared during listing");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(containers)
    }

    /// Creates and starts a detached container, returning its id.
    pub async fn run(&self, name: Option<&str>, config: Config<String>) -> LabResult<String> {
        let options = name.map(|name| CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        });
        let response = self.docker.create_container(options, config).await?;
        for warning in &response.warnings {
            debug!(container_id = %response.id, warning = %warning, "Create warning");
        }

        if let Err(e) = self.docker.start_container(&response.id).await {
            warn!(container_id = %response.id, error = %e, "Start failed, removing created container");
            if let Err(cleanup) = self.remove_if_present(&response.id).await {
                warn!(container_id = %response.id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }
        Ok(response.id)
    }

    pub async fn start(&self, id: &str) -> LabResult<()> {
        Ok(self.docker.start_container(id).await?)
    }

    pub async fn pause(&self, id: &str) -> LabResult<()> {
        Ok(self.docker.pause_container(id).await?)
    }

    pub async fn unpause(&self, id: &str) -> LabResult<()> {
        Ok(self.docker.unpause_container(id).await?)
    }

    pub async fn stop(&self, id: &str, grace: Duration) -> LabResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        Ok(self.docker.stop_container(id, Some(options)).await?)
    }

    pub async fn restart(&self, id: &str, grace: Duration) -> LabResult<()> {
        let options = RestartContainerOptions {
            t: grace.as_secs() as isize,
        };
        Ok(self.docker.restart_container(id, Some(options)).await?)
    }

    /// Force-removes a container; a missing container is an error.
    pub async fn force_remove(&self, id: &str) -> LabResult<()> {
        self.docker
            .remove_container(id, Some(force_options()))
            .await?;
        debug!(container_id = %id, "Container removed");
        Ok(())
    }

    /// Force-removes a container, treating "already gone" as success.
    ///
    /// Returns whether a container was actually removed. The raw daemon error
    /// is kept so callers can tell a missing container from a failed removal.
    pub async fn remove_if_present(&self, id: &str) -> Result<bool, DockerError> {
        match self.docker.remove_container(id, Some(force_options())).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs `cmd` inside the container, optionally with extra environment.
    pub async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Option<Vec<String>>,
    ) -> LabResult<ExecOutput> {
        let options = CreateExecOptions::<String> {
            cmd: Some(cmd),
            env,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        Ok(self.docker.exec(id, options).await?)
    }

    /// Fetches the last `tail` lines of stdout and stderr as one string.
    pub async fn logs(&self, id: &str, tail: usize) -> LabResult<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let logs: Vec<_> = self.docker.logs_stream(id, options).try_collect().await?;

        Ok(logs
            .into_iter()
            .map(|log| log.to_string())
            .collect::<Vec<_>>()
            .join(""))
    }

    /// Attaches a container to a network under the given aliases.
    pub async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: Option<Vec<String>>,
    ) -> LabResult<()> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings {
                aliases,
                ..Default::default()
            },
        };
        Ok(self.docker.connect_network(network, options).await?)
    }
}

fn force_options() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        ..Default::default()
    }
}

/// First twelve characters of a container id, as shown by `docker ps`.
pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDocker;
    use std::collections::HashMap;

    fn alpine() -> Config<String> {
        Config {
            image: Some("alpine:3.19".to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_docker_connect() {
        let client = DockerClient::connect().await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_ping_unavailable_maps_to_runtime_unavailable() {
        let fake = FakeDocker::default();
        fake.set_unavailable(true);
        let client = DockerClient::with_bridge(fake);
        assert!(matches!(
            client.ping().await,
            Err(LabError::RuntimeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_run_creates_and_starts() {
        let fake = FakeDocker::default();
        let client = DockerClient::with_bridge(fake.clone());

        let id = client.run(Some("lab-a"), alpine()).await.unwrap();
        let info = client.inspect(&id).await.unwrap();
        assert_eq!(info.state.and_then(|s| s.running), Some(true));
        assert_eq!(fake.operations(), vec!["create:lab-a".to_string(), format!("start:{id}")]);
    }

    #[tokio::test]
    async fn test_run_removes_container_that_fails_to_start() {
        let fake = FakeDocker::default();
        fake.set_start_failure(true);
        let client = DockerClient::with_bridge(fake.clone());

        let err = client.run(Some("lab-a"), alpine()).await.unwrap_err();
        assert!(matches!(err, LabError::Runtime(_)));
        assert_eq!(fake.container_count(), 0);
        assert!(fake.container("lab-a").is_none());

        fake.set_start_failure(false);
        client.run(Some("lab-a"), alpine()).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_rejects_duplicate_names() {
        let client = DockerClient::with_bridge(FakeDocker::default());
        client.run(Some("lab-a"), alpine()).await.unwrap();
        let err = client.run(Some("lab-a"), alpine()).await.unwrap_err();
        assert!(matches!(err, LabError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_find_by_name_requires_exact_match() {
        let client = DockerClient::with_bridge(FakeDocker::default());
        let id = client.run(Some("ctfd-challenge-7-lab"), alpine()).await.unwrap();

        let found = client.find_by_name("ctfd-challenge-7-lab").await.unwrap();
        assert_eq!(found.and_then(|c| c.id), Some(id));
        assert!(client
            .find_by_name("ctfd-challenge-8-lab")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_filters_running_unless_all() {
        let fake = FakeDocker::default();
        let client = DockerClient::with_bridge(fake.clone());
        let running = client.run(Some("running"), alpine()).await.unwrap();
        let stopped = client.run(Some("stopped"), alpine()).await.unwrap();
        client.stop(&stopped, Duration::from_secs(1)).await.unwrap();

        let ids: Vec<_> = client
            .list(false)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![running.clone()]);
        assert_eq!(client.list(true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_if_present_tolerates_missing() {
        let client = DockerClient::with_bridge(FakeDocker::default());
        let id = client.run(None, alpine()).await.unwrap();
        assert!(client.remove_if_present(&id).await.unwrap());
        assert!(!client.remove_if_present(&id).await.unwrap());
        assert!(matches!(
            client.force_remove(&id).await,
            Err(LabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_returns_scripted_output() {
        let fake = FakeDocker::default();
        fake.set_exec_response("who", 0, "3\n");
        let client = DockerClient::with_bridge(fake);
        let id = client.run(None, alpine()).await.unwrap();

        let out = client
            .exec(&id, vec!["sh".into(), "-lc".into(), "who | wc -l".into()], None)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.output.trim(), "3");
    }

    #[tokio::test]
    async fn test_logs_joins_tail() {
        let fake = FakeDocker::default();
        let client = DockerClient::with_bridge(fake.clone());
        let id = client.run(None, alpine()).await.unwrap();
        for line in ["one\n", "two\n", "three\n"] {
            fake.push_log(&id, line);
        }
        assert_eq!(client.logs(&id, 2).await.unwrap(), "two\nthree\n");
    }

    #[tokio::test]
    async fn test_connect_network_records_aliases() {
        let fake = FakeDocker::default();
        let client = DockerClient::with_bridge(fake.clone());
        let id = client.run(None, alpine()).await.unwrap();
        client
            .connect_network("backend", &id, Some(vec!["db-alias".to_string()]))
            .await
            .unwrap();

        let networks: HashMap<_, _> = client
            .inspect(&id)
            .await
            .unwrap()
            .network_settings
            .and_then(|n| n.networks)
            .unwrap_or_default();
        assert_eq!(
            networks.get("backend").and_then(|e| e.aliases.clone()),
            Some(vec!["db-alias".to_string()])
        );
    }

    #[test]
    fn test_short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
