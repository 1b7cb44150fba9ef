//! Ad hoc sandboxes with a time-to-live
//!
//! Spawned containers are tracked in memory against their expiry. A background
//! reaper sweeps the registry on a fixed interval: it snapshots the expired
//! ids under the lock, removes the containers with the lock released, then
//! takes the lock again only to drop the entries.
//!
//! A container whose removal fails still leaves the registry, but it is kept
//! in an orphan set that later sweeps retry until the daemon confirms it gone.

use crate::config::OrchestratorConfig;
use crate::docker::DockerClient;
use crate::error::{LabError, LabResult};
use crate::metadata::ContainerIdentity;
use bollard::container::Config;
use bollard::models::HostConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MIN_TTL_MINUTES: u32 = 5;
pub const MAX_TTL_MINUTES: u32 = 180;
const PIDS_LIMIT: i64 = 100;

pub const SESSION_USER_LABEL: &str = "ctf.user_id";
pub const EXPIRES_AT_LABEL: &str = "ctf.expires_at";

fn default_command() -> String {
    "sh -c 'sleep infinity'".to_string()
}

fn default_ttl() -> u32 {
    30
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpu_quota() -> i64 {
    50000
}

#[derive(Clone, Debug, Deserialize)]
pub struct SpawnRequest {
    #[serde(alias = "userId")]
    pub user_id: u64,
    #[serde(alias = "challengeImage")]
    pub challenge_image: String,
    #[serde(alias = "challengeCommand", default = "default_command")]
    pub challenge_command: String,
    #[serde(alias = "ttlMinutes", default = "default_ttl")]
    pub ttl_minutes: u32,
    #[serde(alias = "memoryLimit", default = "default_memory")]
    pub memory_limit: String,
    #[serde(alias = "cpuQuota", default = "default_cpu_quota")]
    pub cpu_quota: i64,
    #[serde(alias = "readOnly", default)]
    pub read_only: bool,
}

impl SpawnRequest {
    pub fn new(user_id: u64, challenge_image: impl Into<String>) -> Self {
        Self {
            user_id,
            challenge_image: challenge_image.into(),
            challenge_command: default_command(),
            ttl_minutes: default_ttl(),
            memory_limit: default_memory(),
            cpu_quota: default_cpu_quota(),
            read_only: false,
        }
    }

    fn validate(&self) -> LabResult<()> {
        if self.challenge_image.trim().is_empty() {
            return Err(LabError::Validation("challenge_image is required".to_string()));
        }
        if !(MIN_TTL_MINUTES..=MAX_TTL_MINUTES).contains(&self.ttl_minutes) {
            return Err(LabError::Validation(format!(
                "ttl_minutes must be between {} and {}",
                MIN_TTL_MINUTES, MAX_TTL_MINUTES
            )));
        }
        if self.cpu_quota < 0 {
            return Err(LabError::Validation("cpu_quota must not be negative".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SpawnedLab {
    pub status: String,
    pub container_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of one reaper pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired sessions whose container is gone.
    pub reaped: Vec<String>,
    /// Expired sessions whose removal failed; now in the orphan set.
    pub orphaned: Vec<String>,
    /// Previously orphaned containers confirmed gone on this pass.
    pub recovered: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.orphaned.is_empty() && self.recovered.is_empty()
    }
}

/// Container id to expiry, plus the orphan set.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, DateTime<Utc>>>,
    orphans: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    pub fn track(&self, container_id: &str, expires_at: DateTime<Utc>) {
        self.sessions
            .lock()
            .insert(container_id.to_string(), expires_at);
    }

    pub fn untrack(&self, container_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.lock().remove(container_id)
    }

    pub fn expiry(&self, container_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.lock().get(container_id).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Ids whose expiry is at or before `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn orphans(&self) -> Vec<String> {
        let mut orphans: Vec<String> = self.orphans.lock().iter().cloned().collect();
        orphans.sort();
        orphans
    }

    fn add_orphan(&self, container_id: &str) {
        self.orphans.lock().insert(container_id.to_string());
    }

    fn clear_orphan(&self, container_id: &str) {
        self.orphans.lock().remove(container_id);
    }
}

/// Spawns, stops and expires ad hoc sandboxes.
#[derive(Clone)]
pub struct SessionManager {
    docker: DockerClient,
    registry: Arc<SessionRegistry>,
    config: OrchestratorConfig,
}

impl SessionManager {
    pub fn new(docker: DockerClient, config: OrchestratorConfig) -> Self {
        Self {
            docker,
            registry: Arc::new(SessionRegistry::default()),
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn tracked(&self, container_id: &str) -> bool {
        self.registry.expiry(container_id).is_some()
    }

    pub fn orphans(&self) -> Vec<String> {
        self.registry.orphans()
    }

    /// Starts a restricted sandbox and tracks it until its TTL elapses.
    pub async fn spawn(&self, request: &SpawnRequest) -> LabResult<SpawnedLab> {
        request.validate()?;
        let memory = parse_memory_limit(&request.memory_limit)?;
        let cmd = shlex::split(&request.challenge_command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                LabError::Validation(format!(
                    "Invalid challenge_command: {}",
                    request.challenge_command
                ))
            })?;

        let expires_at = Utc::now() + ChronoDuration::minutes(i64::from(request.ttl_minutes));
        let labels = HashMap::from([
            (SESSION_USER_LABEL.to_string(), request.user_id.to_string()),
            (EXPIRES_AT_LABEL.to_string(), expires_at.to_rfc3339()),
        ]);

        let config = Config {
            image: Some(request.challenge_image.trim().to_string()),
            cmd: Some(cmd),
            tty: Some(true),
            open_stdin: Some(true),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: Some(memory),
                cpu_quota: (request.cpu_quota > 0).then_some(request.cpu_quota),
                readonly_rootfs: Some(request.read_only),
                cap_drop: Some(vec!["ALL".to_string()]),
                cap_add: Some(vec!["SYS_CHROOT".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                pids_limit: Some(PIDS_LIMIT),
                network_mode: self.config.session_network_mode.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_id = self.docker.run(None, config).await?;
        self.registry.track(&container_id, expires_at);
        info!(
            container_id = %container_id,
            user_id = request.user_id,
            expires_at = %expires_at,
            "Spawned lab session"
        );

        Ok(SpawnedLab {
            status: "running".to_string(),
            container_id,
            expires_at,
        })
    }

    /// Force-removes a session container. A container that is already gone is not an error.
    ///
    /// Only containers this manager tracks or that carry the session expiry
    /// label can be stopped; infrastructure containers are always refused.
    /// Once removal is attempted the registry entry is dropped, and a failed
    /// removal leaves the id in the orphan set for the reaper to retry.
    pub async fn stop(&self, container_id: &str) -> LabResult<()> {
        let info = match self.docker.inspect(container_id).await {
            Ok(info) => info,
            Err(LabError::NotFound(_)) => {
                self.registry.untrack(container_id);
                debug!(container_id = %container_id, "Lab session already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let id = info.id.clone().unwrap_or_else(|| container_id.to_string());
        let name = info
            .name
            .as_deref()
            .unwrap_or(container_id)
            .trim_start_matches('/')
            .to_string();
        let labels = info
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        if ContainerIdentity::parse(&labels, &name).protected {
            warn!(container = %name, "Refused to stop protected container as a lab session");
            return Err(LabError::Protected(name));
        }
        if !self.tracked(&id) && !labels.contains_key(EXPIRES_AT_LABEL) {
            warn!(container = %name, "Refused to stop container that is not a lab session");
            return Err(LabError::Validation(format!(
                "Container {name} is not a lab session"
            )));
        }

        let result = self.docker.remove_if_present(&id).await;
        self.registry.untrack(&id);
        match result {
            Ok(removed) => {
                info!(container_id = %id, removed, "Stopped lab session");
                Ok(())
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "Failed to stop lab session");
                self.registry.add_orphan(&id);
                Err(e.into())
            }
        }
    }

    /// One reaper pass at `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for container_id in self.registry.orphans() {
            match self.docker.remove_if_present(&container_id).await {
                Ok(_) => {
                    self.registry.clear_orphan(&container_id);
                    report.recovered.push(container_id);
                }
                Err(e) => {
                    debug!(container_id = %container_id, error = %e, "Orphan still present");
                }
            }
        }

        let expired = self.registry.expired(now);
        for container_id in expired {
            match self.docker.remove_if_present(&container_id).await {
                Ok(_) => report.reaped.push(container_id.clone()),
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Failed to reap expired session");
                    self.registry.add_orphan(&container_id);
                    report.orphaned.push(container_id.clone());
                }
            }
            self.registry.untrack(&container_id);
        }

        report
    }

    /// Runs [`sweep`](Self::sweep) every `reaper_interval` for the life of the process.
    pub fn start_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.reaper_interval);
            loop {
                interval.tick().await;
                let report = manager.sweep(Utc::now()).await;
                if !report.is_empty() {
                    info!(
                        reaped = report.reaped.len(),
                        orphaned = report.orphaned.len(),
                        recovered = report.recovered.len(),
                        "Session sweep"
                    );
                }
            }
        })
    }
}

/// Parses a docker-style memory size (`512m`, `1g`, `256mb`, `1048576`) into bytes.
pub fn parse_memory_limit(raw: &str) -> LabResult<i64> {
    let invalid = || LabError::Validation(format!("Invalid memory_limit: {}", raw));
    let value = raw.trim().to_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1i64 << 10),
        Some('m') => (&value[..value.len() - 1], 1i64 << 20),
        Some('g') => (&value[..value.len() - 1], 1i64 << 30),
        _ => (value, 1),
    };
    let amount: i64 = digits.parse().map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    amount.checked_mul(multiplier).ok_or_else(invalid)
}
