//! Agent configuration.
//!
//! Built once by the daemon from flags and environment, validated, and then
//! passed by reference into the unit constructors. Nothing below the daemon
//! reads the environment.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{CoreError, Result};
use crate::units::BuiltinCollector;

/// Where the kubelet keeps its kubeconfig, in lookup order.
pub const DEFAULT_KUBECONFIG_PATHS: [&str; 2] =
    ["/var/lib/kubelet/kubeconfig", "/etc/kubernetes/kubelet.conf"];

/// Mounted service-account credentials.
pub const DEFAULT_SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Label of the in-cluster API server probe.
pub const API_SERVER_TARGET: &str = "APIServerConnectivity";

/// Label of the probe whose host is resolved at run time. Probed right after
/// [`API_SERVER_TARGET`].
pub const TUNNEL_TARGET: &str = "TunnelConnectivity";

/// A named `host:port` to probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeTarget {
    pub label: String,
    pub endpoint: String,
}

impl ProbeTarget {
    pub fn new(label: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
        }
    }

    /// The static targets probed on every node.
    pub fn defaults() -> Vec<ProbeTarget> {
        vec![
            ProbeTarget::new("InternetConnectivity", "google.com:80"),
            ProbeTarget::new(API_SERVER_TARGET, "kubernetes.default.svc.cluster.local:443"),
            ProbeTarget::new("ACRConnectivity", "azurecr.io:80"),
            ProbeTarget::new("MCRConnectivity", "mcr.microsoft.com:80"),
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "probe target {:?} has an empty label",
                self.endpoint
            )));
        }
        let valid = self
            .endpoint
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(CoreError::InvalidConfig(format!(
                "probe target {}: endpoint {:?} is not host:port",
                self.label, self.endpoint
            )));
        }
        Ok(())
    }
}

/// Settings of the network-outbound diagnoser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub enabled: bool,
    /// Probe rounds per run.
    pub rounds: u32,
    /// Pause between two rounds; also the incident gap threshold.
    pub probe_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub targets: Vec<ProbeTarget>,
    /// Probe the API server tunnel on `<api server host>:<tunnel_port>`.
    pub tunnel_enabled: bool,
    pub tunnel_port: u16,
    pub kubeconfig_paths: Vec<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rounds: 6,
            probe_interval_secs: 5,
            connect_timeout_secs: 5,
            targets: ProbeTarget::defaults(),
            tunnel_enabled: true,
            tunnel_port: 9000,
            kubeconfig_paths: DEFAULT_KUBECONFIG_PATHS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Everything the agent needs to know at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Node the agent runs on; names the archive.
    pub node_name: String,
    /// File holding the run identifier.
    pub run_id_file: PathBuf,
    pub poll_interval_secs: u64,
    pub unit_timeout_secs: u64,
    /// Root of the local export directory.
    pub output_dir: PathBuf,
    /// Also export a compressed archive of each bundle.
    pub archive: bool,
    /// Check service-account credentials before every run.
    pub preflight: bool,
    pub service_account_dir: PathBuf,
    /// Run host commands inside PID 1's namespaces via `nsenter`.
    pub host_namespace: bool,
    pub collectors: Vec<BuiltinCollector>,
    /// Files copied by the `nodelogs` unit. Empty disables it.
    pub log_files: Vec<PathBuf>,
    /// Run the `networkconfig` unit.
    pub network_config: bool,
    pub network: NetworkConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            run_id_file: PathBuf::from("/etc/periscope/RUN_ID"),
            poll_interval_secs: 10,
            unit_timeout_secs: 600,
            output_dir: PathBuf::from("/var/log/periscope"),
            archive: true,
            preflight: true,
            service_account_dir: PathBuf::from(DEFAULT_SERVICE_ACCOUNT_DIR),
            host_namespace: false,
            collectors: BuiltinCollector::all().to_vec(),
            log_files: vec![
                PathBuf::from("/var/log/messages"),
                PathBuf::from("/var/log/syslog"),
                PathBuf::from("/var/log/azure/cluster-provision.log"),
            ],
            network_config: true,
            network: NetworkConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    /// Reject configurations that cannot work. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(CoreError::InvalidConfig("node name is empty".into()));
        }
        if self.node_name.contains('/') {
            return Err(CoreError::InvalidConfig(format!(
                "node name {:?} must not contain '/'",
                self.node_name
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(CoreError::InvalidConfig("poll interval must be > 0".into()));
        }
        if self.unit_timeout_secs == 0 {
            return Err(CoreError::InvalidConfig("unit timeout must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for collector in &self.collectors {
            if !seen.insert(collector) {
                return Err(CoreError::DuplicateUnit(collector.name().to_string()));
            }
        }

        let net = &self.network;
        if net.enabled {
            if net.rounds == 0 {
                return Err(CoreError::InvalidConfig("probe rounds must be > 0".into()));
            }
            if net.probe_interval_secs == 0 || net.connect_timeout_secs == 0 {
                return Err(CoreError::InvalidConfig(
                    "probe interval and connect timeout must be > 0".into(),
                ));
            }
            let mut labels = HashSet::new();
            for target in &net.targets {
                target.validate()?;
                if !labels.insert(target.label.as_str()) || target.label == TUNNEL_TARGET {
                    return Err(CoreError::InvalidConfig(format!(
                        "duplicate probe target label {}",
                        target.label
                    )));
                }
            }
        }
        Ok(())
    }
}
