//! One run, end to end.
//!
//! [`Orchestrator::run_once`] walks a run through its phases:
//! preflight, unit execution, artifact collection and export. Unit failures
//! are absorbed into the report; only a failed preflight or a bundle that no
//! exporter accepted abort the run.

pub mod preflight;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::domain::{
    ArtifactBundle, CoreError, Result, RunId, RunPhase, RunReport, NAMESPACE_SEPARATOR,
};
use crate::export::{archive, Exporter};
use crate::metrics::METRICS;
use crate::obs;
use crate::scheduler::{DiagnosisUnit, SchedulerConfig, TaskScheduler};

pub use preflight::{NoPreflight, Preflight, ServiceAccountPreflight};

/// Builder for [`Orchestrator`]; validates the static wiring.
pub struct OrchestratorBuilder {
    node: String,
    units: Vec<Arc<dyn DiagnosisUnit>>,
    exporters: Vec<Arc<dyn Exporter>>,
    preflight: Arc<dyn Preflight>,
    scheduler: SchedulerConfig,
    archive: bool,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn unit(mut self, unit: Arc<dyn DiagnosisUnit>) -> Self {
        self.units.push(unit);
        self
    }

    pub fn units(mut self, units: impl IntoIterator<Item = Arc<dyn DiagnosisUnit>>) -> Self {
        self.units.extend(units);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn preflight(mut self, preflight: Arc<dyn Preflight>) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Build and export `<node>.json.gz` after the bundle. On by default.
    pub fn archive(mut self, enabled: bool) -> Self {
        self.archive = enabled;
        self
    }

    /// Token whose cancellation reaches every running unit.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        if self.exporters.is_empty() {
            return Err(CoreError::NoExporters);
        }

        let mut seen = HashSet::new();
        for unit in &self.units {
            let name = unit.name();
            if name.trim().is_empty() || name.contains(NAMESPACE_SEPARATOR) {
                return Err(CoreError::InvalidUnitName(name.to_string()));
            }
            if !seen.insert(name.to_string()) {
                return Err(CoreError::DuplicateUnit(name.to_string()));
            }
        }

        Ok(Orchestrator {
            node: self.node,
            units: self.units,
            exporters: self.exporters,
            preflight: self.preflight,
            scheduler: TaskScheduler::new(self.scheduler),
            archive: self.archive,
            cancel: self.cancel,
        })
    }
}

/// Owns the fixed unit list and the export destinations.
pub struct Orchestrator {
    node: String,
    units: Vec<Arc<dyn DiagnosisUnit>>,
    exporters: Vec<Arc<dyn Exporter>>,
    preflight: Arc<dyn Preflight>,
    scheduler: TaskScheduler,
    archive: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn builder(node: impl Into<String>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            node: node.into(),
            units: Vec::new(),
            exporters: Vec::new(),
            preflight: Arc::new(NoPreflight),
            scheduler: SchedulerConfig::default(),
            archive: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name()).collect()
    }

    /// Execute one full run for `run_id`.
    pub async fn run_once(&self, run_id: &RunId) -> Result<RunReport> {
        let span = obs::run_span(run_id);
        self.run_instrumented(run_id).instrument(span).await
    }

    async fn run_instrumented(&self, run_id: &RunId) -> Result<RunReport> {
        METRICS.inc_runs_started();
        obs::emit_run_started(run_id, self.units.len());

        let mut phase = RunPhase::Triggered;
        let result = self.drive(run_id, &mut phase).await;
        match &result {
            Ok(report) => {
                METRICS.inc_runs_completed();
                obs::emit_run_finished(
                    run_id,
                    report.duration_ms,
                    report.artifact_count,
                    report.failed_units(),
                );
            }
            Err(e) => {
                METRICS.inc_runs_aborted();
                let failed_in = phase;
                advance(&mut phase, RunPhase::FatalAborted);
                obs::emit_run_aborted(run_id, failed_in, e);
            }
        }
        METRICS.flush();
        result
    }

    async fn drive(&self, run_id: &RunId, phase: &mut RunPhase) -> Result<RunReport> {
        let started = Instant::now();

        self.preflight.check().await?;

        advance(phase, RunPhase::Executing);
        let outcomes = self.scheduler.run_all(&self.units, &self.cancel).await;

        advance(phase, RunPhase::Collecting);
        let mut units = Vec::with_capacity(outcomes.len());
        let mut artifacts = Vec::new();
        for outcome in outcomes {
            units.push(outcome.summary());
            artifacts.extend(outcome.artifacts);
        }
        let bundle = ArtifactBundle::new(run_id.clone(), self.node.clone(), artifacts);

        advance(phase, RunPhase::Exporting);
        let mut accepted = Vec::new();
        let mut export_failures = Vec::new();
        for exporter in &self.exporters {
            match exporter.export_bundle(&bundle).await {
                Ok(()) => {
                    obs::emit_export_succeeded(exporter.name(), "bundle");
                    accepted.push(exporter);
                }
                Err(e) => {
                    obs::emit_export_failed(exporter.name(), "bundle", &e);
                    export_failures.push((exporter.name().to_string(), e.to_string()));
                }
            }
        }
        if accepted.is_empty() {
            let detail = export_failures
                .iter()
                .map(|(name, err)| format!("{name}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CoreError::Export(detail));
        }

        let archive = if self.archive {
            self.export_archive(&bundle, &accepted).await
        } else {
            None
        };

        advance(phase, RunPhase::Completed);
        Ok(RunReport {
            run_id: run_id.clone(),
            units,
            artifact_count: bundle.len(),
            exported_to: accepted.iter().map(|e| e.name().to_string()).collect(),
            export_failures,
            archive,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Returns the archive name if at least one destination stored it.
    async fn export_archive(
        &self,
        bundle: &ArtifactBundle,
        destinations: &[&Arc<dyn Exporter>],
    ) -> Option<String> {
        let name = archive::archive_name(&self.node);
        let bytes = match archive::pack(bundle) {
            Ok(bytes) => bytes,
            Err(e) => {
                obs::emit_export_failed("archive", &name, &e);
                return None;
            }
        };

        let mut stored = false;
        for exporter in destinations {
            match exporter.export_archive(&name, &bytes).await {
                Ok(()) => {
                    obs::emit_export_succeeded(exporter.name(), &name);
                    stored = true;
                }
                Err(e) => obs::emit_export_failed(exporter.name(), &name, &e),
            }
        }
        stored.then_some(name)
    }
}

fn advance(phase: &mut RunPhase, next: RunPhase) {
    debug_assert!(phase.can_advance_to(next), "{phase} -> {next}");
    *phase = next;
    obs::emit_run_phase(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryExporter, ScriptedUnit};
    use tracing_test::traced_test;

    #[test]
    fn test_build_requires_exporter() {
        let err = Orchestrator::builder("n").build().err().unwrap();
        assert!(matches!(err, CoreError::NoExporters));
    }

    #[test]
    fn test_build_rejects_bad_unit_names() {
        let dup = Orchestrator::builder("n")
            .exporter(Arc::new(MemoryExporter::new("mem")))
            .unit(Arc::new(ScriptedUnit::ok("dns", 1)))
            .unit(Arc::new(ScriptedUnit::ok("dns", 1)))
            .build();
        assert!(matches!(dup, Err(CoreError::DuplicateUnit(n)) if n == "dns"));

        for bad in ["", "  ", "a/b"] {
            let res = Orchestrator::builder("n")
                .exporter(Arc::new(MemoryExporter::new("mem")))
                .unit(Arc::new(ScriptedUnit::ok(bad, 1)))
                .build();
            assert!(matches!(res, Err(CoreError::InvalidUnitName(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_advance_walks_phases() {
        let mut phase = RunPhase::Triggered;
        for next in [
            RunPhase::Executing,
            RunPhase::Collecting,
            RunPhase::Exporting,
            RunPhase::Completed,
        ] {
            advance(&mut phase, next);
        }
        assert_eq!(phase, RunPhase::Completed);

        let mut phase = RunPhase::Triggered;
        advance(&mut phase, RunPhase::FatalAborted);
        assert!(phase.is_terminal());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fatal_run_ends_in_fatal_aborted() {
        let orchestrator = Orchestrator::builder("n")
            .unit(Arc::new(ScriptedUnit::ok("u", 1)))
            .exporter(Arc::new(MemoryExporter::failing("mem")))
            .build()
            .unwrap();

        let err = orchestrator
            .run_once(&RunId::parse("r").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Export(_)));
        assert!(logs_contain("failed_in=exporting"));
        assert!(logs_contain("phase=fatal_aborted"));
    }

    #[tokio::test]
    async fn test_run_once_without_units_exports_empty_bundle() {
        let exporter = Arc::new(MemoryExporter::new("mem"));
        let orchestrator = Orchestrator::builder("node-0")
            .exporter(exporter.clone())
            .archive(false)
            .build()
            .unwrap();

        let report = orchestrator
            .run_once(&RunId::parse("r").unwrap())
            .await
            .unwrap();
        assert_eq!(report.artifact_count, 0);
        assert_eq!(report.archive, None);
        assert_eq!(exporter.bundles().len(), 1);
    }
}
