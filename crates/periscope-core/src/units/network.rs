//! Outbound connectivity diagnosis.
//!
//! [`ProbeSampler`] dials every target once per round and keeps the failures
//! as [`ProbeSample`]s. [`NetworkOutboundDiagnoser`] runs a fixed number of
//! rounds on a fixed cadence, stores the raw samples per target as JSON lines
//! and the coalesced incidents as `incidents.json`.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coalesce::coalesce_by_target;
use crate::config::{NetworkConfig, ProbeTarget, API_SERVER_TARGET, TUNNEL_TARGET};
use crate::domain::{ProbeSample, UnitError, UnitResult};
use crate::scheduler::{DiagnosisUnit, UnitContext};

/// Opens a connection to `host:port`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str, timeout: Duration) -> io::Result<()>;
}

/// Plain TCP dial; the connection is closed right away.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str, timeout: Duration) -> io::Result<()> {
        match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial tcp {endpoint}: i/o timeout"),
            )),
        }
    }
}

/// Probes a set of targets and records failures.
#[derive(Clone)]
pub struct ProbeSampler {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
}

impl ProbeSampler {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Dial one target. `Some` only when the connection failed.
    ///
    /// The sample is stamped with the time the dial started, so samples of
    /// one round share a timestamp however long each dial took.
    pub async fn sample(&self, target: &ProbeTarget) -> Option<ProbeSample> {
        let at = Utc::now();
        let result = self
            .connector
            .connect(&target.endpoint, self.connect_timeout)
            .await;
        match result {
            Ok(()) => None,
            Err(e) => Some(ProbeSample::failure(
                &target.label,
                &target.endpoint,
                at,
                e.to_string(),
            )),
        }
    }

    /// Dial every target concurrently. Failures come back in target order.
    pub async fn sample_all(&self, targets: &[ProbeTarget]) -> Vec<ProbeSample> {
        join_all(targets.iter().map(|t| self.sample(t)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// API server location
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("no readable kubeconfig ({0})")]
    NoKubeconfig(String),

    #[error("no server entry in {0}")]
    NoServer(String),
}

/// Finds the host name of the cluster's API server.
#[async_trait]
pub trait ApiServerLocator: Send + Sync {
    async fn api_server_host(&self) -> Result<String, LocateError>;
}

/// Reads the kubelet's kubeconfig; the first readable path wins.
#[derive(Debug, Clone)]
pub struct KubeconfigLocator {
    paths: Vec<PathBuf>,
}

impl KubeconfigLocator {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl ApiServerLocator for KubeconfigLocator {
    async fn api_server_host(&self) -> Result<String, LocateError> {
        let mut errors = Vec::new();
        for path in &self.paths {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    return parse_server_host(&contents)
                        .ok_or_else(|| LocateError::NoServer(path.display().to_string()));
                }
                Err(e) => errors.push(format!("{}: {e}", path.display())),
            }
        }
        Err(LocateError::NoKubeconfig(errors.join("; ")))
    }
}

/// Host part of the first `server:` entry of a kubeconfig.
///
/// `server: https://my-cluster.hcp.eastus.azmk8s.io:443` yields
/// `my-cluster.hcp.eastus.azmk8s.io`.
pub fn parse_server_host(kubeconfig: &str) -> Option<String> {
    let url = kubeconfig.lines().find_map(|line| {
        let (_, rest) = line.split_once("server:")?;
        Some(rest.trim().trim_matches(|c| c == '"' || c == '\''))
    })?;

    let authority = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = authority.split('/').next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split_once(']').map(|(host, _)| host)?
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => authority,
        }
    };

    (!host.is_empty()).then(|| host.to_string())
}

// ---------------------------------------------------------------------------
// Diagnoser
// ---------------------------------------------------------------------------

/// Periodic outbound connectivity check for the node.
pub struct NetworkOutboundDiagnoser {
    sampler: ProbeSampler,
    targets: Vec<ProbeTarget>,
    tunnel: Option<(Arc<dyn ApiServerLocator>, u16)>,
    rounds: u32,
    probe_interval: Duration,
}

impl NetworkOutboundDiagnoser {
    pub const NAME: &'static str = "networkoutbound";

    pub fn new(config: &NetworkConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            sampler: ProbeSampler::new(connector, config.connect_timeout()),
            targets: config.targets.clone(),
            tunnel: None,
            rounds: config.rounds,
            probe_interval: config.probe_interval(),
        }
    }

    /// Largest spacing between two samples of one target that still belongs
    /// to the same incident.
    ///
    /// Rounds start every `probe_interval`, or later when a round's dials
    /// outlast it; timestamps are truncated to whole seconds.
    pub fn incident_gap(&self) -> Duration {
        self.probe_interval.max(self.sampler.connect_timeout()) + Duration::from_secs(1)
    }

    /// Also probe `<api server host>:<port>` as `TunnelConnectivity`.
    pub fn with_tunnel(mut self, locator: Arc<dyn ApiServerLocator>, port: u16) -> Self {
        self.tunnel = Some((locator, port));
        self
    }

    async fn resolve_targets(&self) -> (Vec<ProbeTarget>, Option<UnitError>) {
        let mut targets = self.targets.clone();
        let Some((locator, port)) = &self.tunnel else {
            return (targets, None);
        };

        match locator.api_server_host().await {
            Ok(host) => {
                let tunnel = ProbeTarget::new(TUNNEL_TARGET, format!("{host}:{port}"));
                // Right after the API server target; last when there is none.
                let at = targets
                    .iter()
                    .position(|t| t.label == API_SERVER_TARGET)
                    .map_or(targets.len(), |i| i + 1);
                targets.insert(at, tunnel);
                (targets, None)
            }
            Err(e) => {
                warn!(
                    target_label = TUNNEL_TARGET,
                    error = %e,
                    "tunnel endpoint unresolved; probing the rest"
                );
                let err = UnitError::UnresolvedTarget {
                    target: TUNNEL_TARGET.to_string(),
                    reason: e.to_string(),
                };
                (targets, Some(err))
            }
        }
    }

    fn emit_results(
        &self,
        ctx: &UnitContext,
        targets: &[ProbeTarget],
        samples: &[ProbeSample],
    ) -> UnitResult<()> {
        for target in targets {
            let mut lines = Vec::new();
            for sample in samples.iter().filter(|s| s.target == target.label) {
                serde_json::to_writer(&mut lines, sample)?;
                lines.push(b'\n');
            }
            ctx.emit(&format!("{}.jsonl", target.label), lines);
        }

        let incidents = coalesce_by_target(samples, self.incident_gap())?;
        info!(
            samples = samples.len(),
            incidents = incidents.len(),
            "connectivity incidents coalesced"
        );
        ctx.emit("incidents.json", serde_json::to_vec_pretty(&incidents)?);
        Ok(())
    }
}

#[async_trait]
impl DiagnosisUnit for NetworkOutboundDiagnoser {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &UnitContext) -> UnitResult<()> {
        let (targets, unresolved) = self.resolve_targets().await;
        let mut samples = Vec::new();
        let mut cancelled = false;

        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for round in 0..self.rounds {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = ticker.tick() => {}
            }
            // Results are only emitted at the end; keep room for them.
            if ctx.remaining() <= self.sampler.connect_timeout() {
                warn!(
                    completed_rounds = round,
                    rounds = self.rounds,
                    "unit deadline too close for another probe round"
                );
                break;
            }
            let failures = self.sampler.sample_all(&targets).await;
            debug!(round = round, failures = failures.len(), "probe round done");
            samples.extend(failures);
        }

        self.emit_results(ctx, &targets, &samples)?;

        if cancelled {
            return Err(UnitError::Cancelled);
        }
        match unresolved {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FixedLocator;

    #[test]
    fn test_parse_server_host() {
        let kubeconfig = r#"
apiVersion: v1
clusters:
- cluster:
    certificate-authority: /etc/kubernetes/certs/ca.crt
    server: https://demo-dns-1234.hcp.eastus.azmk8s.io:443
  name: localcluster
"#;
        assert_eq!(
            parse_server_host(kubeconfig).as_deref(),
            Some("demo-dns-1234.hcp.eastus.azmk8s.io")
        );
    }

    #[test]
    fn test_parse_server_host_variants() {
        assert_eq!(
            parse_server_host("server: https://10.0.0.1").as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(
            parse_server_host("    server: \"https://api.example:6443/prefix\"").as_deref(),
            Some("api.example")
        );
        assert_eq!(
            parse_server_host("server: https://[fd00::1]:443").as_deref(),
            Some("fd00::1")
        );
        assert_eq!(parse_server_host("clusters: []"), None);
        assert_eq!(parse_server_host("server: https://:443"), None);
    }

    fn labels(targets: &[ProbeTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.label.as_str()).collect()
    }

    #[tokio::test]
    async fn test_tunnel_follows_api_server_target() {
        let locator = Arc::new(FixedLocator::host("api.internal"));
        let unit = NetworkOutboundDiagnoser::new(&NetworkConfig::default(), Arc::new(TcpConnector))
            .with_tunnel(locator.clone(), 9000);
        let (targets, unresolved) = unit.resolve_targets().await;
        assert!(unresolved.is_none());
        assert_eq!(
            labels(&targets),
            vec![
                "InternetConnectivity",
                API_SERVER_TARGET,
                TUNNEL_TARGET,
                "ACRConnectivity",
                "MCRConnectivity"
            ]
        );
        assert_eq!(targets[2].endpoint, "api.internal:9000");

        let config = NetworkConfig {
            targets: vec![
                ProbeTarget::new("ACRConnectivity", "azurecr.io:80"),
                ProbeTarget::new("MCRConnectivity", "mcr.microsoft.com:80"),
                ProbeTarget::new(API_SERVER_TARGET, "api.internal:443"),
            ],
            ..NetworkConfig::default()
        };
        let unit = NetworkOutboundDiagnoser::new(&config, Arc::new(TcpConnector))
            .with_tunnel(locator.clone(), 9000);
        let (targets, _) = unit.resolve_targets().await;
        assert_eq!(targets.last().unwrap().label, TUNNEL_TARGET);

        let config = NetworkConfig {
            targets: vec![ProbeTarget::new("InternetConnectivity", "google.com:80")],
            ..NetworkConfig::default()
        };
        let unit = NetworkOutboundDiagnoser::new(&config, Arc::new(TcpConnector))
            .with_tunnel(locator, 9000);
        let (targets, _) = unit.resolve_targets().await;
        assert_eq!(labels(&targets), vec!["InternetConnectivity", TUNNEL_TARGET]);
    }

    #[test]
    fn test_incident_gap_covers_slow_rounds() {
        let unit = NetworkOutboundDiagnoser::new(&NetworkConfig::default(), Arc::new(TcpConnector));
        assert_eq!(unit.incident_gap(), Duration::from_secs(6));

        let config = NetworkConfig {
            probe_interval_secs: 2,
            connect_timeout_secs: 10,
            ..NetworkConfig::default()
        };
        let unit = NetworkOutboundDiagnoser::new(&config, Arc::new(TcpConnector));
        assert_eq!(unit.incident_gap(), Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_kubeconfig_locator_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("kubelet.conf");
        std::fs::write(&fallback, "    server: https://api.internal:443\n").unwrap();

        let locator = KubeconfigLocator::new(vec![dir.path().join("kubeconfig"), fallback]);
        assert_eq!(locator.api_server_host().await.unwrap(), "api.internal");

        let none = KubeconfigLocator::new(vec![dir.path().join("nope")]);
        assert!(matches!(
            none.api_server_host().await,
            Err(LocateError::NoKubeconfig(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_connector_reports_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        TcpConnector
            .connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        drop(listener);
        assert!(TcpConnector
            .connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .is_err());
    }
}
