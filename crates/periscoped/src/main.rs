//! Periscope node agent daemon.
//!
//! Watches the run-id control file and executes one diagnosis run per
//! observed change. Runs are serialized; a fatal run (failed preflight,
//! no exporter accepted the bundle) ends the process with a non-zero status
//! so the supervisor restarts it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use periscope_core::config::DEFAULT_SERVICE_ACCOUNT_DIR;
use periscope_core::units::{self, BuiltinCollector};
use periscope_core::{
    handoff, init_tracing, AgentConfig, FileControlSource, LocalDirExporter, LogFormat,
    NoPreflight, Orchestrator, Preflight, ProbeTarget, RunId, RunWatcher, SchedulerConfig,
    ServiceAccountPreflight, TriggerReceiver,
};

#[derive(Parser, Debug)]
#[command(name = "periscoped")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Node-resident diagnostic agent", long_about = None)]
struct Cli {
    /// File holding the run identifier; a change starts a run
    #[arg(long, env = "PERISCOPE_RUN_ID_FILE", default_value = "/etc/periscope/RUN_ID")]
    run_id_file: PathBuf,

    /// Seconds between two reads of the run-id file
    #[arg(long, env = "PERISCOPE_POLL_INTERVAL_SECS", default_value_t = 10)]
    poll_interval_secs: u64,

    /// Root directory for exported artifacts and archives
    #[arg(long, env = "PERISCOPE_OUTPUT_DIR", default_value = "/var/log/periscope")]
    output_dir: PathBuf,

    /// Node name (default: contents of /etc/hostname)
    #[arg(long, env = "PERISCOPE_NODE_NAME")]
    node_name: Option<String>,

    /// Deadline for a single diagnosis unit, in seconds
    #[arg(long, env = "PERISCOPE_UNIT_TIMEOUT_SECS", default_value_t = 600)]
    unit_timeout_secs: u64,

    /// Command collectors to run
    #[arg(
        long,
        env = "PERISCOPE_COLLECTORS",
        value_delimiter = ',',
        default_value = "dns,iptables,kubeletcmd,systemlogs"
    )]
    collectors: Vec<BuiltinCollector>,

    /// Log files copied by the nodelogs unit (default: syslog, messages, provisioning log)
    #[arg(long, env = "PERISCOPE_LOG_FILES", value_delimiter = ',')]
    log_files: Option<Vec<PathBuf>>,

    /// Probe rounds per run
    #[arg(long, env = "PERISCOPE_PROBE_ROUNDS", default_value_t = 6)]
    probe_rounds: u32,

    /// Seconds between probe rounds; also the incident gap threshold
    #[arg(long, env = "PERISCOPE_PROBE_INTERVAL_SECS", default_value_t = 5)]
    probe_interval_secs: u64,

    /// Connect timeout per probe, in seconds
    #[arg(long, env = "PERISCOPE_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    connect_timeout_secs: u64,

    /// Probe targets as LABEL=host:port (replaces the defaults)
    #[arg(
        long,
        env = "PERISCOPE_PROBE_TARGETS",
        value_delimiter = ',',
        value_parser = parse_target
    )]
    probe_targets: Option<Vec<ProbeTarget>>,

    /// Disable the network-outbound diagnoser
    #[arg(long, env = "PERISCOPE_NO_NETWORK")]
    no_network: bool,

    /// Disable the network-config diagnoser
    #[arg(long, env = "PERISCOPE_NO_NETWORK_CONFIG")]
    no_network_config: bool,

    /// Skip the API server tunnel probe
    #[arg(long, env = "PERISCOPE_NO_TUNNEL")]
    no_tunnel: bool,

    /// Do not build the compressed archive
    #[arg(long, env = "PERISCOPE_NO_ARCHIVE")]
    no_archive: bool,

    /// Skip the service-account credential check
    #[arg(long, env = "PERISCOPE_NO_PREFLIGHT")]
    no_preflight: bool,

    /// Directory holding the service-account token and CA bundle
    #[arg(long, env = "PERISCOPE_SERVICE_ACCOUNT_DIR", default_value = DEFAULT_SERVICE_ACCOUNT_DIR)]
    service_account_dir: PathBuf,

    /// Run host commands in PID 1's namespaces via nsenter
    #[arg(long, env = "PERISCOPE_HOST_NAMESPACE")]
    host_namespace: bool,

    /// Log line format: text or json
    #[arg(long, env = "PERISCOPE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Execute a single run with this id and exit instead of watching
    #[arg(long)]
    once: Option<String>,
}

fn parse_target(raw: &str) -> std::result::Result<ProbeTarget, String> {
    let (label, endpoint) = raw
        .split_once('=')
        .ok_or_else(|| format!("probe target {raw:?} is not LABEL=host:port"))?;
    Ok(ProbeTarget::new(label.trim(), endpoint.trim()))
}

fn node_name(cli: &Cli) -> String {
    cli.node_name
        .clone()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn build_config(cli: &Cli) -> AgentConfig {
    let mut config = AgentConfig {
        node_name: node_name(cli),
        run_id_file: cli.run_id_file.clone(),
        poll_interval_secs: cli.poll_interval_secs,
        unit_timeout_secs: cli.unit_timeout_secs,
        output_dir: cli.output_dir.clone(),
        archive: !cli.no_archive,
        preflight: !cli.no_preflight,
        service_account_dir: cli.service_account_dir.clone(),
        host_namespace: cli.host_namespace,
        collectors: cli.collectors.clone(),
        network_config: !cli.no_network_config,
        ..AgentConfig::default()
    };
    if let Some(files) = &cli.log_files {
        config.log_files = files.clone();
    }

    let net = &mut config.network;
    net.enabled = !cli.no_network;
    net.tunnel_enabled = !cli.no_tunnel;
    net.rounds = cli.probe_rounds;
    net.probe_interval_secs = cli.probe_interval_secs;
    net.connect_timeout_secs = cli.connect_timeout_secs;
    if let Some(targets) = &cli.probe_targets {
        net.targets = targets.clone();
    }
    config
}

fn build_orchestrator(config: &AgentConfig, cancel: CancellationToken) -> Result<Orchestrator> {
    let preflight: Arc<dyn Preflight> = if config.preflight {
        Arc::new(ServiceAccountPreflight::new(&config.service_account_dir))
    } else {
        Arc::new(NoPreflight)
    };

    let orchestrator = Orchestrator::builder(&config.node_name)
        .units(units::from_config(config))
        .exporter(Arc::new(LocalDirExporter::new(&config.output_dir)))
        .preflight(preflight)
        .scheduler(SchedulerConfig {
            unit_timeout: config.unit_timeout(),
        })
        .archive(config.archive)
        .cancellation(cancel)
        .build()?;
    Ok(orchestrator)
}

/// Execute runs as triggers arrive, one at a time.
///
/// Returns the number of completed runs when the watcher stops or `cancel`
/// fires; returns an error on the first fatal run.
async fn consume(
    orchestrator: &Orchestrator,
    mut triggers: TriggerReceiver,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut completed = 0;
    loop {
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            next = triggers.next() => match next {
                Some(trigger) => trigger,
                None => break,
            },
        };

        let (run_id, _busy) = trigger.accept();
        let report = orchestrator
            .run_once(&run_id)
            .await
            .with_context(|| format!("run {run_id} aborted"))?;
        info!(
            run_id = %report.run_id,
            artifacts = report.artifact_count,
            failed_units = report.failed_units(),
            archive = report.archive.as_deref().unwrap_or("-"),
            "run completed"
        );
        completed += 1;
    }
    Ok(completed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.log_format, level);

    let config = build_config(&cli);
    config.validate().context("invalid configuration")?;
    info!(
        version = periscope_core::VERSION,
        config = %serde_json::to_string(&config)?,
        "periscoped starting"
    );

    let cancel = CancellationToken::new();
    let orchestrator = build_orchestrator(&config, cancel.clone())?;
    info!(units = ?orchestrator.unit_names(), "diagnosis units registered");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested");
            shutdown.cancel();
        }
    });

    if let Some(raw) = &cli.once {
        let run_id = RunId::parse(raw).context("--once needs a non-empty run id")?;
        orchestrator
            .run_once(&run_id)
            .await
            .with_context(|| format!("run {run_id} aborted"))?;
        return Ok(());
    }

    let (sender, receiver) = handoff();
    let watcher = RunWatcher::new(
        Arc::new(FileControlSource::new(&config.run_id_file)),
        Duration::from_secs(config.poll_interval_secs),
    );
    let watcher_task = tokio::spawn(watcher.run(sender, cancel.clone()));

    let result = consume(&orchestrator, receiver, &cancel).await;
    cancel.cancel();
    // The watcher only stops on cancellation, which was just requested.
    let _ = watcher_task.await;

    let completed = result?;
    info!(completed_runs = completed, "periscoped stopped");
    Ok(())
}
