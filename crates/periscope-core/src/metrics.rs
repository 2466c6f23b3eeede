//! Process-wide counters for the agent.
//!
//! Incremented at the call site, emitted together by [`Metrics::flush`] once
//! per run so a single log line carries the running totals.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_aborted: AtomicU64,
    units_failed: AtomicU64,
    units_timed_out: AtomicU64,
    poll_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_aborted: AtomicU64::new(0),
            units_failed: AtomicU64::new(0),
            units_timed_out: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_aborted(&self) {
        self.runs_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts failed and panicked units; timeouts have their own counter.
    pub fn inc_units_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "units_failed", "counter incremented");
    }

    pub fn inc_units_timed_out(&self) {
        self.units_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "units_timed_out", "counter incremented");
    }

    pub fn inc_poll_errors(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all counters as one `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            runs_completed = self.runs_completed(),
            runs_aborted = self.runs_aborted(),
            units_failed = self.units_failed(),
            units_timed_out = self.units_timed_out(),
            poll_errors = self.poll_errors(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn runs_aborted(&self) -> u64 {
        self.runs_aborted.load(Ordering::Relaxed)
    }

    pub fn units_failed(&self) -> u64 {
        self.units_failed.load(Ordering::Relaxed)
    }

    pub fn units_timed_out(&self) -> u64 {
        self.units_timed_out.load(Ordering::Relaxed)
    }

    pub fn poll_errors(&self) -> u64 {
        self.poll_errors.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_started,
            &self.runs_completed,
            &self.runs_aborted,
            &self.units_failed,
            &self.units_timed_out,
            &self.poll_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_runs_started();
        m.inc_runs_started();
        m.inc_runs_completed();
        m.inc_units_failed();
        m.inc_units_timed_out();
        m.inc_units_timed_out();

        assert_eq!(m.runs_started(), 2);
        assert_eq!(m.runs_completed(), 1);
        assert_eq!(m.runs_aborted(), 0);
        assert_eq!(m.units_failed(), 1);
        assert_eq!(m.units_timed_out(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_runs_aborted();
        m.inc_poll_errors();
        m.reset();
        assert_eq!(m.runs_aborted(), 0);
        assert_eq!(m.poll_errors(), 0);
    }
}
