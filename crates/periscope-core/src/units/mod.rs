//! Concrete diagnosis units.

pub mod command;
pub mod file;
pub mod netconfig;
pub mod network;

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::scheduler::DiagnosisUnit;

pub use command::{BuiltinCollector, CommandCollector, CommandSpec};
pub use file::FileCollector;
pub use netconfig::{NetworkConfigDiagnoser, NodeNetworkConfig};
pub use network::{
    parse_server_host, ApiServerLocator, Connector, KubeconfigLocator, LocateError,
    NetworkOutboundDiagnoser, ProbeSampler, TcpConnector,
};

/// Name of the unit that copies node log files.
pub const NODE_LOGS_UNIT: &str = "nodelogs";

/// Build the static unit list for `config`, in registration order.
pub fn from_config(config: &AgentConfig) -> Vec<Arc<dyn DiagnosisUnit>> {
    let mut units: Vec<Arc<dyn DiagnosisUnit>> = config
        .collectors
        .iter()
        .map(|collector| {
            Arc::new(
                CommandCollector::from_builtin(*collector)
                    .with_host_namespace(config.host_namespace),
            ) as Arc<dyn DiagnosisUnit>
        })
        .collect();

    if !config.log_files.is_empty() {
        units.push(Arc::new(FileCollector::new(
            NODE_LOGS_UNIT,
            config.log_files.clone(),
        )));
    }

    if config.network_config {
        units.push(Arc::new(
            NetworkConfigDiagnoser::new().with_host_namespace(config.host_namespace),
        ));
    }

    let net = &config.network;
    if net.enabled {
        let mut diagnoser = NetworkOutboundDiagnoser::new(net, Arc::new(TcpConnector));
        if net.tunnel_enabled {
            let locator = KubeconfigLocator::new(net.kubeconfig_paths.clone());
            diagnoser = diagnoser.with_tunnel(Arc::new(locator), net.tunnel_port);
        }
        units.push(Arc::new(diagnoser));
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_unit_set() {
        let units = from_config(&AgentConfig::default());
        let names: Vec<_> = units.iter().map(|u| u.name().to_string()).collect();
        assert_eq!(
            names,
            vec![
                "dns",
                "iptables",
                "kubeletcmd",
                "systemlogs",
                "nodelogs",
                "networkconfig",
                "networkoutbound",
            ]
        );
    }

    #[test]
    fn test_disabled_units_are_left_out() {
        let mut config = AgentConfig {
            collectors: vec![BuiltinCollector::Dns],
            log_files: Vec::new(),
            network_config: false,
            ..Default::default()
        };
        config.network.enabled = false;

        let units = from_config(&config);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name(), "dns");
    }
}
