//! Failure isolation in the task scheduler.

use std::sync::Arc;
use std::time::Duration;

use periscope_core::fakes::{ActivityTracker, ScriptedUnit};
use periscope_core::{DiagnosisUnit, OutcomeStatus, SchedulerConfig, TaskScheduler};
use tokio_util::sync::CancellationToken;

fn scheduler(timeout: Duration) -> TaskScheduler {
    TaskScheduler::new(SchedulerConfig {
        unit_timeout: timeout,
    })
}

fn units_with(n: usize, k: usize, odd_one: ScriptedUnit) -> Vec<Arc<dyn DiagnosisUnit>> {
    let mut odd_one = Some(odd_one);
    (0..n)
        .map(|i| -> Arc<dyn DiagnosisUnit> {
            if i == k {
                Arc::new(odd_one.take().unwrap())
            } else {
                Arc::new(ScriptedUnit::ok(&format!("unit-{i}"), 2))
            }
        })
        .collect()
}

fn assert_siblings_intact(outcomes: &[periscope_core::RunOutcome], k: usize) {
    for (i, outcome) in outcomes.iter().enumerate() {
        if i == k {
            continue;
        }
        assert!(outcome.succeeded(), "unit {i}: {:?}", outcome.status);
        assert_eq!(outcome.artifacts.len(), 2);
        assert!(outcome.artifacts[0].name.starts_with(&format!("unit-{i}/")));
    }
}

#[tokio::test]
async fn test_failing_unit_does_not_affect_siblings() {
    let n = 6;
    for k in 0..n {
        let units = units_with(n, k, ScriptedUnit::failing("broken", 1, "boom"));
        let outcomes = scheduler(Duration::from_secs(30))
            .run_all(&units, &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), n);
        assert_eq!(outcomes.iter().filter(|o| o.succeeded()).count(), n - 1);
        assert!(matches!(
            &outcomes[k].status,
            OutcomeStatus::Failed { reason } if reason.contains("boom")
        ));
        assert_eq!(outcomes[k].artifacts.len(), 1);
        assert_siblings_intact(&outcomes, k);
    }
}

#[tokio::test]
async fn test_panicking_unit_is_contained() {
    let units = units_with(4, 2, ScriptedUnit::panicking("crashy", 3, "index out of range"));
    let outcomes = scheduler(Duration::from_secs(30))
        .run_all(&units, &CancellationToken::new())
        .await;

    assert_eq!(outcomes.len(), 4);
    assert_eq!(
        outcomes[2].status,
        OutcomeStatus::Panicked {
            reason: "index out of range".into()
        }
    );
    assert_eq!(outcomes[2].artifacts.len(), 3);
    assert_siblings_intact(&outcomes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_unit_times_out_and_keeps_artifacts() {
    let units = units_with(3, 0, ScriptedUnit::hanging("stuck", 2));
    let outcomes = scheduler(Duration::from_secs(600))
        .run_all(&units, &CancellationToken::new())
        .await;

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].unit, "stuck");
    assert_eq!(outcomes[0].status, OutcomeStatus::TimedOut { limit_ms: 600_000 });
    assert_eq!(outcomes[0].artifacts.len(), 2);
    assert!(outcomes[0].duration_ms >= 600_000);
    assert_siblings_intact(&outcomes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_units_run_concurrently() {
    let tracker = ActivityTracker::new();
    let units: Vec<Arc<dyn DiagnosisUnit>> = (0..5)
        .map(|i| -> Arc<dyn DiagnosisUnit> {
            Arc::new(
                ScriptedUnit::sleeping(&format!("u{i}"), 0, Duration::from_secs(60))
                    .tracked(tracker.clone()),
            )
        })
        .collect();

    let started = tokio::time::Instant::now();
    let outcomes = scheduler(Duration::from_secs(600))
        .run_all(&units, &CancellationToken::new())
        .await;

    assert!(outcomes.iter().all(|o| o.succeeded()));
    assert_eq!(tracker.invocations(), 5);
    assert_eq!(tracker.peak(), 5);
    assert!(started.elapsed() < Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation_reaches_units() {
    let units: Vec<Arc<dyn DiagnosisUnit>> = vec![
        Arc::new(ScriptedUnit::sleeping("slow", 1, Duration::from_secs(3600))),
        Arc::new(ScriptedUnit::ok("quick", 1)),
    ];
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let outcomes = scheduler(Duration::from_secs(7200)).run_all(&units, &cancel).await;

    assert!(matches!(
        &outcomes[0].status,
        OutcomeStatus::Failed { reason } if reason == "cancelled"
    ));
    assert_eq!(outcomes[0].artifacts.len(), 1);
    assert!(outcomes[1].succeeded());
}

#[tokio::test]
async fn test_outcomes_follow_registration_order() {
    let units: Vec<Arc<dyn DiagnosisUnit>> = vec![
        Arc::new(ScriptedUnit::sleeping("late", 1, Duration::from_millis(50))),
        Arc::new(ScriptedUnit::ok("early", 1)),
    ];
    let outcomes = scheduler(Duration::from_secs(30))
        .run_all(&units, &CancellationToken::new())
        .await;
    let names: Vec<_> = outcomes.iter().map(|o| o.unit.as_str()).collect();
    assert_eq!(names, vec!["late", "early"]);
}
