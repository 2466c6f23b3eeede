//! Run identity, lifecycle phases and the per-run report.

use serde::{Deserialize, Serialize};

/// Identifier of one orchestration cycle.
///
/// Sourced verbatim (minus surrounding whitespace) from the control value.
/// Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Build a `RunId` from a raw control value.
    ///
    /// Returns `None` when the value is empty after trimming; an empty control
    /// value means "unset", not a run.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(RunId(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a single run.
///
/// `Triggered -> Executing -> Collecting -> Exporting -> {Completed | FatalAborted}`.
/// Unit failures are absorbed in `Executing`/`Collecting`; only wiring and
/// export failures reach `FatalAborted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Triggered,
    Executing,
    Collecting,
    Exporting,
    Completed,
    FatalAborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Triggered => "triggered",
            RunPhase::Executing => "executing",
            RunPhase::Collecting => "collecting",
            RunPhase::Exporting => "exporting",
            RunPhase::Completed => "completed",
            RunPhase::FatalAborted => "fatal_aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::FatalAborted)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (_, FatalAborted) => !self.is_terminal(),
            (Triggered, Executing)
            | (Executing, Collecting)
            | (Collecting, Exporting)
            | (Exporting, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload-free view of one unit's outcome, kept in the [`RunReport`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitSummary {
    pub unit: String,
    /// `succeeded`, `failed`, `timed_out` or `panicked`.
    pub status: String,
    pub reason: Option<String>,
    pub artifact_count: usize,
    pub duration_ms: u64,
}

/// Result of a run that reached `Completed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub units: Vec<UnitSummary>,
    /// Number of artifacts in the exported bundle.
    pub artifact_count: usize,
    /// Exporters that accepted the bundle.
    pub exported_to: Vec<String>,
    /// Exporters that rejected the bundle, with their error text.
    pub export_failures: Vec<(String, String)>,
    /// Name of the archive handed to exporters, if one was built.
    pub archive: Option<String>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn failed_units(&self) -> usize {
        self.units.iter().filter(|u| u.status != "succeeded").count()
    }
}
