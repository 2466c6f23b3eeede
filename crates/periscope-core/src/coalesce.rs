//! Incident coalescing.
//!
//! Compresses a stream of connectivity failure samples into a few bounded
//! incidents. A new incident starts whenever the error text changes, the
//! target changes, or the gap since the previous sample of the open incident
//! exceeds the threshold.
//!
//! Pure: no I/O and no notion of the current time, so every rule is testable
//! with hand-built timestamps.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{Incident, ProbeSample};

/// Errors from coalescing malformed input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoalesceError {
    #[error("sample {index} at {at} precedes previous sample at {previous}")]
    OutOfOrder {
        index: usize,
        at: DateTime<Utc>,
        previous: DateTime<Utc>,
    },
}

/// Coalesce time-ordered samples into incidents.
///
/// Samples must be in ascending timestamp order (equal timestamps are fine).
/// An empty input yields no incidents.
pub fn coalesce(
    samples: &[ProbeSample],
    gap_threshold: Duration,
) -> Result<Vec<Incident>, CoalesceError> {
    let mut incidents = Vec::new();
    let mut open: Option<Incident> = None;
    let mut previous: Option<DateTime<Utc>> = None;

    for (index, sample) in samples.iter().enumerate() {
        if let Some(prev) = previous {
            if sample.timestamp < prev {
                return Err(CoalesceError::OutOfOrder {
                    index,
                    at: sample.timestamp,
                    previous: prev,
                });
            }
        }
        previous = Some(sample.timestamp);

        open = Some(match open.take() {
            None => Incident::open(sample),
            Some(current) if breaks(&current, sample, gap_threshold) => {
                incidents.push(current);
                Incident::open(sample)
            }
            Some(mut current) => {
                current.end = sample.timestamp;
                current
            }
        });
    }

    if let Some(current) = open {
        incidents.push(current);
    }

    Ok(incidents)
}

/// Coalesce a stream that may interleave several targets.
///
/// Samples are partitioned per target, keeping the order in which targets
/// first appear, and each partition is coalesced on its own. Output is
/// grouped by target.
pub fn coalesce_by_target(
    samples: &[ProbeSample],
    gap_threshold: Duration,
) -> Result<Vec<Incident>, CoalesceError> {
    let mut groups: Vec<(&str, Vec<ProbeSample>)> = Vec::new();

    for sample in samples {
        match groups.iter_mut().find(|(target, _)| *target == sample.target) {
            Some((_, group)) => group.push(sample.clone()),
            None => groups.push((sample.target.as_str(), vec![sample.clone()])),
        }
    }

    let mut incidents = Vec::new();
    for (_, group) in &groups {
        incidents.extend(coalesce(group, gap_threshold)?);
    }
    Ok(incidents)
}

fn breaks(open: &Incident, sample: &ProbeSample, gap_threshold: Duration) -> bool {
    if sample.error != open.error || sample.target != open.target {
        return true;
    }
    // Ordering is checked by the caller, so the difference is never negative.
    let gap = (sample.timestamp - open.end).to_std().unwrap_or_default();
    gap > gap_threshold
}
