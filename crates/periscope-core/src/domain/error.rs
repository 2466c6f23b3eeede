//! Error taxonomy for the agent.
//!
//! [`UnitError`] stays inside one diagnosis unit and becomes that unit's
//! outcome. [`CoreError`] is what `run_once` and the wiring code escalate to
//! the process.

use crate::coalesce::CoalesceError;

/// Failure of a single diagnosis unit. Never crosses into sibling units.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("{failed} of {total} collection steps failed (first: {first})")]
    Incomplete {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("could not resolve probe target {target}: {reason}")]
    UnresolvedTarget { target: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("coalescing error: {0}")]
    Coalesce(#[from] CoalesceError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UnitError {
    /// Build an `Incomplete` error from the list of step failures.
    ///
    /// Returns `None` when nothing failed.
    pub fn from_failures(failures: &[String], total: usize) -> Option<Self> {
        let first = failures.first()?;
        Some(UnitError::Incomplete {
            failed: failures.len(),
            total,
            first: first.clone(),
        })
    }
}

/// Errors that abort a run or prevent the agent from starting.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("wiring error: {0}")]
    Wiring(String),

    #[error("export failed on every destination: {0}")]
    Export(String),

    #[error("duplicate diagnosis unit name: {0}")]
    DuplicateUnit(String),

    #[error("invalid diagnosis unit name {0:?}")]
    InvalidUnitName(String),

    #[error("no exporters configured")]
    NoExporters,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("trigger handoff closed")]
    HandoffClosed,
}

/// Result type for agent-level operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Result type for diagnosis unit execution.
pub type UnitResult<T> = std::result::Result<T, UnitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_error_display() {
        let err = UnitError::Command {
            command: "iptables -t nat -L".to_string(),
            detail: "exit code 4".to_string(),
        };
        assert!(err.to_string().contains("iptables -t nat -L"));
        assert!(err.to_string().contains("exit code 4"));
    }

    #[test]
    fn test_from_failures() {
        assert!(UnitError::from_failures(&[], 3).is_none());

        let err = UnitError::from_failures(&["a broke".into(), "b broke".into()], 5).unwrap();
        let msg = err.to_string();
        assert!(msg.contains("2 of 5"));
        assert!(msg.contains("a broke"));
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::Wiring("service account token missing".to_string());
        assert!(err.to_string().contains("wiring error"));

        let err = CoreError::DuplicateUnit("dns".to_string());
        assert!(err.to_string().contains("dns"));
    }
}
