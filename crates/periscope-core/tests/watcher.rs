//! Trigger detection and run serialization.

use std::sync::Arc;
use std::time::Duration;

use periscope_core::fakes::{ActivityTracker, MemoryControlSource, MemoryExporter, ScriptedUnit};
use periscope_core::{handoff, Orchestrator, RunId, RunWatcher};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn test_rapid_triggers_never_overlap_runs() {
    let source = Arc::new(MemoryControlSource::new("r1"));
    let tracker = ActivityTracker::new();
    let exporter = Arc::new(MemoryExporter::new("mem"));
    let orchestrator = Orchestrator::builder("n")
        .unit(Arc::new(
            ScriptedUnit::sleeping("work", 1, Duration::from_secs(25)).tracked(tracker.clone()),
        ))
        .exporter(exporter.clone())
        .archive(false)
        .build()
        .unwrap();

    let (tx, mut rx) = handoff();
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(RunWatcher::new(source.clone(), POLL).run(tx, cancel.clone()));

    let mutator = source.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        mutator.set("r2");
        sleep(Duration::from_secs(11)).await;
        mutator.set("r3");
    });

    for _ in 0..3 {
        let trigger = rx.next().await.unwrap();
        assert!(!rx.is_busy());
        let (run_id, _busy) = trigger.accept();
        assert!(rx.is_busy());
        orchestrator.run_once(&run_id).await.unwrap();
    }
    assert!(!rx.is_busy());

    cancel.cancel();
    watcher.await.unwrap();

    assert_eq!(tracker.invocations(), 3);
    assert_eq!(tracker.peak(), 1);
    let runs: Vec<_> = exporter
        .bundles()
        .iter()
        .map(|b| b.run_id.to_string())
        .collect();
    assert_eq!(runs, vec!["r1", "r2", "r3"]);
}

#[tokio::test(start_paused = true)]
async fn test_changes_between_polls_collapse() {
    let source = Arc::new(MemoryControlSource::new(""));
    let (tx, mut rx) = handoff();
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(RunWatcher::new(source.clone(), POLL).run(tx, cancel.clone()));

    // First tick fires immediately and sees nothing.
    sleep(Duration::from_secs(1)).await;
    source.set("a");
    source.set("b");
    source.set("c");

    let trigger = rx.next().await.unwrap();
    assert_eq!(trigger.run_id().as_str(), "c");
    drop(trigger.accept());

    // Unchanged value: nothing more within several polls.
    let nothing = tokio::time::timeout(POLL * 5, rx.next()).await;
    assert!(nothing.is_err());

    cancel.cancel();
    watcher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_read_errors_do_not_trigger() {
    let source = Arc::new(MemoryControlSource::new("r1"));
    let (tx, mut rx) = handoff();
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(RunWatcher::new(source.clone(), POLL).run(tx, cancel.clone()));

    let first = rx.next().await.unwrap();
    drop(first.accept());

    source.fail_next("config map not mounted");
    sleep(POLL * 2 + Duration::from_secs(1)).await;
    assert!(source.reads() >= 3);

    source.set("r2");
    let second = rx.next().await.unwrap();
    assert_eq!(second.run_id(), &RunId::parse("r2").unwrap());
    drop(second.accept());

    cancel.cancel();
    watcher.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watcher_stops_when_consumer_is_gone() {
    let source = Arc::new(MemoryControlSource::new("r1"));
    let (tx, rx) = handoff();
    drop(rx);

    let watcher = tokio::spawn(RunWatcher::new(source, POLL).run(tx, CancellationToken::new()));
    tokio::time::timeout(POLL * 3, watcher)
        .await
        .expect("watcher should stop on its own")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pending_trigger_waits_while_busy() {
    let source = Arc::new(MemoryControlSource::new("r1"));
    let (tx, mut rx) = handoff();
    let probe = tx.clone();
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(RunWatcher::new(source.clone(), POLL).run(tx, cancel.clone()));

    let (_, busy) = rx.next().await.unwrap().accept();
    assert!(probe.is_busy());

    source.set("r2");
    sleep(POLL * 3).await;
    // r2 is parked in the slot; the watcher has not moved past it.
    let reads_while_parked = source.reads();
    sleep(POLL * 3).await;
    assert_eq!(source.reads(), reads_while_parked);

    drop(busy);
    assert!(!probe.is_busy());
    let next = rx.next().await.unwrap();
    assert_eq!(next.run_id().as_str(), "r2");
    drop(next.accept());

    cancel.cancel();
    watcher.await.unwrap();
}
