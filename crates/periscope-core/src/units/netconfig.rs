//! Node network configuration summary.
//!
//! [`NetworkConfigDiagnoser`] reads the host resolver configuration and the
//! kubelet command line, and condenses them into one `networkconfig.json`
//! artifact: which DNS servers the node uses, which DNS the cluster hands to
//! pods, the network plugin and the pod density limit. It runs its own
//! commands, so it does not depend on the output of any other unit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::command::{exit_detail, host_argv, run_command, CommandSpec};
use crate::domain::{UnitError, UnitResult};
use crate::scheduler::{DiagnosisUnit, UnitContext};

/// Condensed network settings of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeNetworkConfig {
    /// `nameserver` entries of the host's resolv.conf.
    pub host_dns: Vec<String>,
    /// kubelet `--cluster-dns`.
    pub kubernetes_dns: Vec<String>,
    /// kubelet `--network-plugin`.
    pub network_plugin: Option<String>,
    /// kubelet `--max-pods`.
    pub max_pods: Option<u32>,
}

/// Nameservers listed in a resolv.conf, in file order.
pub fn parse_nameservers(resolv_conf: &str) -> Vec<String> {
    resolv_conf
        .lines()
        .filter_map(|line| {
            let line = line.split(['#', ';']).next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(server)) => Some(server.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Value of `--<flag>` on a command line, in `--flag=value` or
/// `--flag value` form. The last occurrence wins, as with the kubelet.
pub fn flag_value<'a>(cmdline: &'a str, flag: &str) -> Option<&'a str> {
    let long = format!("--{flag}");
    let mut found = None;
    let mut tokens = cmdline.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == long {
            found = tokens.next().filter(|v| !v.starts_with("--")).or(found);
        } else if let Some(value) = token
            .strip_prefix(long.as_str())
            .and_then(|rest| rest.strip_prefix('='))
        {
            found = Some(value);
        }
    }
    found
}

/// Fill the kubelet-derived fields of `config` from its command line.
fn apply_kubelet_flags(config: &mut NodeNetworkConfig, cmdline: &str) {
    config.network_plugin = flag_value(cmdline, "network-plugin")
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    config.kubernetes_dns = flag_value(cmdline, "cluster-dns")
        .map(|v| {
            v.split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    config.max_pods = flag_value(cmdline, "max-pods").and_then(|v| v.parse().ok());
}

/// Derives [`NodeNetworkConfig`] from the host.
#[derive(Debug, Clone)]
pub struct NetworkConfigDiagnoser {
    resolv_conf: CommandSpec,
    kubelet_cmdline: CommandSpec,
    host_namespace: bool,
}

impl Default for NetworkConfigDiagnoser {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkConfigDiagnoser {
    pub const NAME: &'static str = "networkconfig";
    pub const ARTIFACT: &'static str = "networkconfig.json";

    pub fn new() -> Self {
        Self::with_commands(
            CommandSpec::new("resolv.conf", &["cat", "/etc/resolv.conf"]),
            CommandSpec::new("kubelet", &["ps", "-o", "cmd=", "-C", "kubelet"]),
        )
    }

    /// Use other commands to obtain the resolver file and kubelet command line.
    pub fn with_commands(resolv_conf: CommandSpec, kubelet_cmdline: CommandSpec) -> Self {
        Self {
            resolv_conf,
            kubelet_cmdline,
            host_namespace: false,
        }
    }

    pub fn with_host_namespace(mut self, enabled: bool) -> Self {
        self.host_namespace = enabled;
        self
    }

    /// Stdout of `spec`, or the failure text.
    async fn capture(&self, ctx: &UnitContext, spec: &CommandSpec) -> UnitResult<String> {
        let argv = host_argv(spec, self.host_namespace);
        let output = run_command(ctx, spec, &argv).await?;
        if !output.status.success() {
            return Err(UnitError::Command {
                command: spec.display(),
                detail: exit_detail(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DiagnosisUnit for NetworkConfigDiagnoser {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &UnitContext) -> UnitResult<()> {
        let mut config = NodeNetworkConfig::default();
        let mut failures = Vec::new();

        match self.capture(ctx, &self.resolv_conf).await {
            Ok(resolv) => config.host_dns = parse_nameservers(&resolv),
            Err(UnitError::Cancelled) => return Err(UnitError::Cancelled),
            Err(e) => failures.push(e.to_string()),
        }
        match self.capture(ctx, &self.kubelet_cmdline).await {
            Ok(cmdline) => apply_kubelet_flags(&mut config, &cmdline),
            Err(UnitError::Cancelled) => return Err(UnitError::Cancelled),
            Err(e) => failures.push(e.to_string()),
        }

        debug!(
            host_dns = config.host_dns.len(),
            plugin = config.network_plugin.as_deref().unwrap_or("-"),
            "network configuration derived"
        );
        ctx.emit(Self::ARTIFACT, serde_json::to_vec_pretty(&config)?);

        match UnitError::from_failures(&failures, 2) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
