//! Connectivity probe samples and the incidents coalesced from them.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// One connectivity probe observation.
///
/// By convention only failures are recorded: a successful connection is the
/// absence of a sample for that instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeSample {
    /// Target label, e.g. `InternetConnectivity`.
    pub target: String,
    /// `host:port` that was dialed.
    pub endpoint: String,
    /// Observation time, truncated to whole seconds.
    pub timestamp: DateTime<Utc>,
    pub connected: bool,
    pub error: String,
}

impl ProbeSample {
    /// Record a failed connection attempt observed at `at`.
    pub fn failure(
        target: impl Into<String>,
        endpoint: impl Into<String>,
        at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            endpoint: endpoint.into(),
            timestamp: truncate_to_second(at),
            connected: false,
            error: error.into(),
        }
    }
}

/// A maximal span during which one target kept failing with the same error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Incident {
    pub target: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub error: String,
}

impl Incident {
    pub(crate) fn open(sample: &ProbeSample) -> Self {
        Self {
            target: sample.target.clone(),
            start: sample.timestamp,
            end: sample.timestamp,
            error: sample.error.clone(),
        }
    }

    /// `end - start`; zero for single-sample incidents.
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Whether `at` falls inside `[start, end]`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

pub(crate) fn truncate_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::seconds(1)).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_failure_sample_is_truncated_to_whole_seconds() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 7).unwrap()
            + TimeDelta::milliseconds(850);
        let sample = ProbeSample::failure("Internet", "google.com:80", at, "timeout");

        assert_eq!(sample.timestamp.second(), 7);
        assert_eq!(sample.timestamp.nanosecond(), 0);
        assert!(!sample.connected);
    }

    #[test]
    fn test_sample_json_shape() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let sample = ProbeSample::failure("ACR", "azurecr.io:80", at, "refused");
        let value = serde_json::to_value(&sample).unwrap();

        assert_eq!(value["target"], "ACR");
        assert_eq!(value["endpoint"], "azurecr.io:80");
        assert_eq!(value["connected"], false);
        assert_eq!(value["timestamp"], "2024-03-01T12:00:00Z");
    }

    #[test]
    fn test_incident_covers_its_bounds() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let incident = Incident {
            target: "MCR".into(),
            start: t0,
            end: t0 + TimeDelta::seconds(4),
            error: "x".into(),
        };
        assert!(incident.covers(t0));
        assert!(incident.covers(t0 + TimeDelta::seconds(4)));
        assert!(!incident.covers(t0 + TimeDelta::seconds(5)));
        assert_eq!(incident.span(), TimeDelta::seconds(4));
    }
}
