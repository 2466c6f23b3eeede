//! Fan-out/fan-in execution of diagnosis units.
//!
//! Every unit runs in its own tokio task with its own artifact sink and a
//! child cancellation token. A unit that returns an error, panics or overruns
//! its deadline only affects its own [`RunOutcome`]; `run_all` never fails.
//! The caller blocks until every unit has an outcome.

pub mod outcome;
pub mod unit;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::domain::UnitResult;
use crate::metrics::METRICS;
use crate::obs;

pub use outcome::{OutcomeStatus, RunOutcome};
use unit::ArtifactSink;
pub use unit::{DiagnosisUnit, EmittedArtifacts, UnitContext};

/// Default per-unit deadline.
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wall-clock budget for one unit invocation.
    pub unit_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
        }
    }
}

/// Runs a set of units concurrently and joins on all of them.
#[derive(Debug, Clone, Default)]
pub struct TaskScheduler {
    config: SchedulerConfig,
}

struct InFlight {
    unit: String,
    sink: ArtifactSink,
    token: CancellationToken,
    started: Instant,
    deadline: Instant,
    handle: JoinHandle<UnitResult<()>>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Execute every unit once and return one outcome per unit, in the order
    /// the units were given.
    ///
    /// Cancelling `cancel` propagates to every unit's context.
    #[instrument(skip_all, fields(units = units.len()))]
    pub async fn run_all(
        &self,
        units: &[Arc<dyn DiagnosisUnit>],
        cancel: &CancellationToken,
    ) -> Vec<RunOutcome> {
        let mut in_flight = Vec::with_capacity(units.len());

        for unit in units {
            let name = unit.name().to_string();
            let sink = ArtifactSink::new(&name);
            let token = cancel.child_token();
            let started = Instant::now();
            let deadline = started + self.config.unit_timeout;
            let ctx = UnitContext::new(sink.clone(), token.clone(), deadline);

            obs::emit_unit_started(&name);

            let unit = Arc::clone(unit);
            let span = tracing::info_span!("unit", unit = %name);
            let handle = tokio::spawn(async move { unit.execute(&ctx).await }.instrument(span));

            in_flight.push(InFlight {
                unit: name,
                sink,
                token,
                started,
                deadline,
                handle,
            });
        }

        let mut outcomes = Vec::with_capacity(in_flight.len());
        for task in in_flight {
            outcomes.push(self.join(task).await);
        }
        outcomes
    }

    async fn join(&self, mut task: InFlight) -> RunOutcome {
        let joined = tokio::time::timeout_at(task.deadline, &mut task.handle).await;
        let status = match joined {
            Ok(Ok(Ok(()))) => OutcomeStatus::Succeeded,
            Ok(Ok(Err(e))) => OutcomeStatus::Failed {
                reason: e.to_string(),
            },
            Ok(Err(join_err)) => status_from_join_error(join_err),
            Err(_elapsed) => {
                // Ask politely, then stop polling it so the barrier can move on.
                task.token.cancel();
                task.handle.abort();
                OutcomeStatus::TimedOut {
                    limit_ms: self.config.unit_timeout.as_millis() as u64,
                }
            }
        };

        let outcome = RunOutcome {
            unit: task.unit,
            status,
            artifacts: task.sink.drain(),
            duration_ms: task.started.elapsed().as_millis() as u64,
        };

        match &outcome.status {
            OutcomeStatus::Succeeded => {}
            OutcomeStatus::TimedOut { .. } => METRICS.inc_units_timed_out(),
            _ => METRICS.inc_units_failed(),
        }
        obs::emit_unit_finished(&outcome);
        outcome
    }
}

fn status_from_join_error(err: JoinError) -> OutcomeStatus {
    if err.is_panic() {
        let payload = err.into_panic();
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        OutcomeStatus::Panicked { reason }
    } else {
        OutcomeStatus::Failed {
            reason: "unit task was cancelled".to_string(),
        }
    }
}
