//! Structured lifecycle events for runs, units and exports.
//!
//! Every event carries an `event` field so log pipelines can filter on it
//! (`run.started`, `unit.finished`, `export.failed`, ...). Run-scoped fields
//! come from the span returned by [`run_span`].

use tracing::{error, info, warn, Span};

use crate::domain::{RunId, RunPhase};
use crate::scheduler::{OutcomeStatus, RunOutcome};

/// Span that tags everything inside one run with its `run_id`.
pub fn run_span(run_id: &RunId) -> Span {
    tracing::info_span!("periscope.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &RunId, units: usize) {
    info!(event = "run.started", run_id = %run_id, units = units);
}

pub fn emit_run_phase(phase: RunPhase) {
    tracing::debug!(event = "run.phase", phase = %phase);
}

pub fn emit_run_finished(run_id: &RunId, duration_ms: u64, artifacts: usize, failed_units: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        artifacts = artifacts,
        failed_units = failed_units,
    );
}

/// `failed_in` is the phase that was running when the error surfaced.
pub fn emit_run_aborted(run_id: &RunId, failed_in: RunPhase, error: &dyn std::fmt::Display) {
    error!(event = "run.aborted", run_id = %run_id, failed_in = %failed_in, error = %error);
}

pub fn emit_unit_started(unit: &str) {
    info!(event = "unit.started", unit = %unit);
}

pub fn emit_unit_finished(outcome: &RunOutcome) {
    match &outcome.status {
        OutcomeStatus::Succeeded => info!(
            event = "unit.finished",
            unit = %outcome.unit,
            status = outcome.status.as_str(),
            artifacts = outcome.artifacts.len(),
            duration_ms = outcome.duration_ms,
        ),
        OutcomeStatus::Failed { reason } => warn!(
            event = "unit.failed",
            unit = %outcome.unit,
            reason = %reason,
            artifacts = outcome.artifacts.len(),
            duration_ms = outcome.duration_ms,
        ),
        OutcomeStatus::TimedOut { limit_ms } => warn!(
            event = "unit.timed_out",
            unit = %outcome.unit,
            limit_ms = limit_ms,
            artifacts = outcome.artifacts.len(),
        ),
        OutcomeStatus::Panicked { reason } => error!(
            event = "unit.panicked",
            unit = %outcome.unit,
            reason = %reason,
            artifacts = outcome.artifacts.len(),
        ),
    }
}

pub fn emit_export_succeeded(exporter: &str, what: &str) {
    info!(event = "export.succeeded", exporter = %exporter, what = %what);
}

pub fn emit_export_failed(exporter: &str, what: &str, error: &dyn std::fmt::Display) {
    warn!(event = "export.failed", exporter = %exporter, what = %what, error = %error);
}

pub fn emit_trigger_observed(run_id: &RunId, consumer_busy: bool) {
    info!(event = "trigger.observed", run_id = %run_id, consumer_busy = consumer_busy);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let id = RunId::parse("test-run").unwrap();
        let span = run_span(&id);
        let _entered = span.enter();
        emit_run_phase(RunPhase::Executing);
    }
}
