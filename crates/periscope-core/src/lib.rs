//! Periscope core library
//!
//! Node-resident diagnostics: a watcher turns control-value changes into
//! runs, the orchestrator fans each run out over the configured diagnosis
//! units and hands the collected artifacts to the exporters.

pub mod coalesce;
pub mod config;
pub mod domain;
pub mod export;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod scheduler;
pub mod telemetry;
pub mod units;
pub mod watcher;

pub use coalesce::{coalesce, coalesce_by_target, CoalesceError};
pub use config::{AgentConfig, NetworkConfig, ProbeTarget};
pub use domain::{
    Artifact, ArtifactBundle, CoreError, Incident, ProbeSample, Result, RunId, RunPhase,
    RunReport, UnitError, UnitResult, UnitSummary,
};
pub use export::{ExportError, Exporter, LocalDirExporter};
pub use orchestrator::{
    NoPreflight, Orchestrator, OrchestratorBuilder, Preflight, ServiceAccountPreflight,
};
pub use scheduler::{
    DiagnosisUnit, OutcomeStatus, RunOutcome, SchedulerConfig, TaskScheduler, UnitContext,
};
pub use telemetry::{init_tracing, LogFormat};
pub use watcher::{
    handoff, BusyGuard, ControlError, ControlSource, FileControlSource, RunWatcher, Trigger,
    TriggerReceiver, TriggerSender,
};

/// Crate version, logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
