//! Per-unit results surfaced by the scheduler.

use serde::{Deserialize, Serialize};

use crate::domain::{Artifact, UnitSummary};

/// How a unit's invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed { reason: String },
    TimedOut { limit_ms: u64 },
    Panicked { reason: String },
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Failed { .. } => "failed",
            OutcomeStatus::TimedOut { .. } => "timed_out",
            OutcomeStatus::Panicked { .. } => "panicked",
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            OutcomeStatus::Succeeded => None,
            OutcomeStatus::Failed { reason } | OutcomeStatus::Panicked { reason } => {
                Some(reason.clone())
            }
            OutcomeStatus::TimedOut { limit_ms } => {
                Some(format!("deadline of {limit_ms}ms exceeded"))
            }
        }
    }
}

/// Result of one unit in one run.
///
/// Failed, timed-out and panicked outcomes still carry whatever the unit
/// emitted before it stopped.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub unit: String,
    pub status: OutcomeStatus,
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }

    pub fn summary(&self) -> UnitSummary {
        UnitSummary {
            unit: self.unit.clone(),
            status: self.status.as_str().to_string(),
            reason: self.status.reason(),
            artifact_count: self.artifacts.len(),
            duration_ms: self.duration_ms,
        }
    }
}
