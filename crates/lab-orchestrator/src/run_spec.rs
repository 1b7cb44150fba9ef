//! Creation spec reconstructed from a live container
//!
//! Used by reset: the container is removed and recreated from what the daemon
//! reports about it, then reattached to any networks beyond its primary one.

use crate::docker::short_id;
use bollard::container::{Config, NetworkingConfig};
use bollard::models::{
    ContainerInspectResponse, EndpointSettings, HostConfig, PortMap, RestartPolicy,
};
use std::collections::HashMap;

/// Network attached after creation, with the aliases it had before.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecondaryNetwork {
    pub name: String,
    pub aliases: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSpec {
    pub name: String,
    pub image: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub read_only: bool,
    pub privileged: bool,
    pub security_opt: Option<Vec<String>>,
    pub cap_add: Option<Vec<String>>,
    pub cap_drop: Option<Vec<String>>,
    pub pids_limit: Option<i64>,
    pub restart_policy: Option<RestartPolicy>,
    pub memory: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub dns: Option<Vec<String>>,
    pub extra_hosts: Option<Vec<String>>,
    /// Either a special mode (`host`, `none`, `container:<id>`) or the primary network name.
    pub network_mode: Option<String>,
    pub network_aliases: Option<Vec<String>>,
    pub binds: Option<Vec<String>>,
    pub port_bindings: Option<PortMap>,
    pub secondary_networks: Vec<SecondaryNetwork>,
}

impl RunSpec {
    pub fn from_inspect(info: &ContainerInspectResponse) -> Self {
        let config = info.config.clone().unwrap_or_default();
        let host = info.host_config.clone().unwrap_or_default();
        let networks = info
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.clone())
            .unwrap_or_default();
        let old_short_id = info.id.as_deref().map(short_id);
        let keep_alias = |alias: &String| Some(alias) != old_short_id.as_ref();

        let primary = primary_network(host.network_mode.as_deref(), &networks);
        let network_aliases = primary
            .as_ref()
            .filter(|name| name.as_str() != "bridge")
            .and_then(|name| networks.get(name))
            .and_then(|endpoint| endpoint.aliases.clone())
            .map(|aliases| aliases.into_iter().filter(keep_alias).collect());

        let mut secondary_networks: Vec<SecondaryNetwork> = networks
            .iter()
            .filter(|(name, _)| Some(*name) != primary.as_ref())
            .map(|(name, endpoint)| SecondaryNetwork {
                name: name.clone(),
                aliases: endpoint
                    .aliases
                    .clone()
                    .map(|aliases| aliases.into_iter().filter(keep_alias).collect()),
            })
            .collect();
        secondary_networks.sort_by(|a, b| a.name.cmp(&b.name));

        let network_mode = match host.network_mode.as_deref() {
            Some(mode) if !matches!(mode, "" | "default" | "bridge") => Some(mode.to_string()),
            _ => primary,
        };

        RunSpec {
            name: info
                .name
                .as_deref()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: config.image,
            cmd: config.cmd,
            entrypoint: config.entrypoint,
            env: config.env,
            working_dir: config.working_dir,
            hostname: config.hostname,
            user: config.user,
            labels: config.labels.unwrap_or_default(),
            tty: config.tty.unwrap_or(false),
            open_stdin: config.open_stdin.unwrap_or(false),
            read_only: host.readonly_rootfs.unwrap_or(false),
            privileged: host.privileged.unwrap_or(false),
            security_opt: host.security_opt,
            cap_add: host.cap_add,
            cap_drop: host.cap_drop,
            pids_limit: host.pids_limit,
            restart_policy: host.restart_policy,
            memory: host.memory,
            nano_cpus: host.nano_cpus,
            cpu_quota: host.cpu_quota,
            cpu_period: host.cpu_period,
            dns: host.dns,
            extra_hosts: host.extra_hosts,
            network_mode,
            network_aliases,
            binds: host.binds,
            port_bindings: host.port_bindings,
            secondary_networks,
        }
    }

    /// Drops empty and zero values so the daemon applies its own defaults.
    pub fn cleaned(mut self) -> Self {
        fn text(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.is_empty())
        }
        fn list(value: Option<Vec<String>>) -> Option<Vec<String>> {
            value.filter(|v| !v.is_empty())
        }
        fn positive(value: Option<i64>) -> Option<i64> {
            value.filter(|v| *v > 0)
        }

        self.image = text(self.image);
        self.cmd = list(self.cmd);
        self.entrypoint = list(self.entrypoint);
        self.env = list(self.env);
        self.working_dir = text(self.working_dir);
        self.hostname = text(self.hostname);
        self.user = text(self.user);
        self.security_opt = list(self.security_opt);
        self.cap_add = list(self.cap_add);
        self.cap_drop = list(self.cap_drop);
        self.pids_limit = positive(self.pids_limit);
        self.restart_policy = self.restart_policy.filter(|p| p.name.is_some());
        self.memory = positive(self.memory);
        self.nano_cpus = positive(self.nano_cpus);
        self.cpu_quota = positive(self.cpu_quota);
        self.cpu_period = positive(self.cpu_period);
        self.dns = list(self.dns);
        self.extra_hosts = list(self.extra_hosts);
        self.network_mode = text(self.network_mode);
        self.network_aliases = list(self.network_aliases);
        self.binds = list(self.binds);
        self.port_bindings = self.port_bindings.filter(|p| !p.is_empty());
        for network in &mut self.secondary_networks {
            network.aliases = list(network.aliases.take());
        }
        self
    }

    pub fn create_config(&self) -> Config<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in self.port_bindings.iter().flat_map(|p| p.keys()) {
            exposed_ports.insert(port.clone(), HashMap::new());
        }

        let networking_config = match (&self.network_mode, &self.network_aliases) {
            (Some(network), Some(aliases)) => Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    network.clone(),
                    EndpointSettings {
                        aliases: Some(aliases.clone()),
                        ..Default::default()
                    },
                )]),
            }),
            _ => None,
        };

        Config {
            image: self.image.clone(),
            cmd: self.cmd.clone(),
            entrypoint: self.entrypoint.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            hostname: self.hostname.clone(),
            user: self.user.clone(),
            labels: Some(self.labels.clone()),
            tty: Some(self.tty),
            open_stdin: Some(self.open_stdin),
            attach_stdin: Some(false),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                readonly_rootfs: Some(self.read_only),
                privileged: Some(self.privileged),
                security_opt: self.security_opt.clone(),
                cap_add: self.cap_add.clone(),
                cap_drop: self.cap_drop.clone(),
                pids_limit: self.pids_limit,
                restart_policy: self.restart_policy.clone(),
                memory: self.memory,
                nano_cpus: self.nano_cpus,
                cpu_quota: self.cpu_quota,
                cpu_period: self.cpu_period,
                dns: self.dns.clone(),
                extra_hosts: self.extra_hosts.clone(),
                network_mode: self.network_mode.clone(),
                binds: self.binds.clone(),
                port_bindings: self.port_bindings.clone(),
                ..Default::default()
            }),
            networking_config,
            ..Default::default()
        }
    }
}

/// The network a container is created on; everything else is reattached afterwards.
fn primary_network(
    network_mode: Option<&str>,
    networks: &HashMap<String, EndpointSettings>,
) -> Option<String> {
    match network_mode {
        Some(mode) if !matches!(mode, "" | "default" | "bridge") => Some(mode.to_string()),
        _ if networks.contains_key("bridge") => Some("bridge".to_string()),
        _ => networks.keys().min().cloned(),
    }
}
