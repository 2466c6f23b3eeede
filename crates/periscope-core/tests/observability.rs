//! Structured lifecycle events emitted during a run.

use std::sync::Arc;

use periscope_core::fakes::{MemoryExporter, ScriptedUnit};
use periscope_core::obs::{emit_export_failed, emit_trigger_observed, run_span};
use periscope_core::{Orchestrator, RunId};
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_run_emits_unit_and_run_events() {
    let orchestrator = Orchestrator::builder("n")
        .unit(Arc::new(ScriptedUnit::ok("healthy", 1)))
        .unit(Arc::new(ScriptedUnit::failing("broken", 0, "exit code 2")))
        .exporter(Arc::new(MemoryExporter::new("mem")))
        .archive(false)
        .build()
        .unwrap();

    orchestrator
        .run_once(&RunId::parse("obs-run").unwrap())
        .await
        .unwrap();

    assert!(logs_contain("run.started"));
    assert!(logs_contain("unit.started"));
    assert!(logs_contain("unit.finished"));
    assert!(logs_contain("unit.failed"));
    assert!(logs_contain("exit code 2"));
    assert!(logs_contain("export.succeeded"));
    assert!(logs_contain("run.finished"));
    assert!(logs_contain("obs-run"));
}

#[tokio::test]
#[traced_test]
async fn test_fatal_run_emits_abort() {
    let orchestrator = Orchestrator::builder("n")
        .exporter(Arc::new(MemoryExporter::failing("mem")))
        .build()
        .unwrap();

    let _ = orchestrator.run_once(&RunId::parse("doomed").unwrap()).await;

    assert!(logs_contain("export.failed"));
    assert!(logs_contain("run.aborted"));
}

#[test]
#[traced_test]
fn test_helpers_inside_run_span() {
    let id = RunId::parse("span-run").unwrap();
    let _entered = run_span(&id).entered();
    emit_trigger_observed(&id, true);
    emit_export_failed("blob", "bundle", &"403 forbidden");

    assert!(logs_contain("trigger.observed"));
    assert!(logs_contain("403 forbidden"));
}
