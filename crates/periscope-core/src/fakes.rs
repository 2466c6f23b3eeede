//! In-memory fakes for the agent's seams (testing only)
//!
//! Provides `MemoryControlSource`, `MemoryExporter`, `FakeConnector`,
//! `FixedLocator` and `ScriptedUnit`, which satisfy the trait contracts
//! without touching the host.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ArtifactBundle, UnitError, UnitResult};
use crate::export::{ExportError, Exporter};
use crate::scheduler::{DiagnosisUnit, UnitContext};
use crate::units::network::{ApiServerLocator, Connector, LocateError};
use crate::watcher::{ControlError, ControlSource};

// ---------------------------------------------------------------------------
// MemoryControlSource
// ---------------------------------------------------------------------------

/// Control value held in memory; tests mutate it with [`set`](Self::set).
#[derive(Debug, Default)]
pub struct MemoryControlSource {
    value: Mutex<String>,
    fail_next: Mutex<Option<String>>,
    reads: AtomicUsize,
}

impl MemoryControlSource {
    pub fn new(value: &str) -> Self {
        Self {
            value: Mutex::new(value.to_string()),
            ..Default::default()
        }
    }

    pub fn set(&self, value: &str) {
        *self.value.lock().unwrap() = value.to_string();
    }

    /// Make the next read fail with `reason`.
    pub fn fail_next(&self, reason: &str) {
        *self.fail_next.lock().unwrap() = Some(reason.to_string());
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlSource for MemoryControlSource {
    async fn read(&self) -> Result<String, ControlError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(ControlError::Unavailable(reason));
        }
        Ok(self.value.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryExporter
// ---------------------------------------------------------------------------

/// Keeps every exported bundle and archive in memory.
#[derive(Debug, Default)]
pub struct MemoryExporter {
    name: String,
    bundles: Mutex<Vec<ArtifactBundle>>,
    archives: Mutex<Vec<(String, Vec<u8>)>>,
    fail_bundles: AtomicBool,
    fail_archives: AtomicBool,
}

impl MemoryExporter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// An exporter that rejects every bundle.
    pub fn failing(name: &str) -> Self {
        let exporter = Self::new(name);
        exporter.fail_bundles(true);
        exporter
    }

    pub fn fail_bundles(&self, fail: bool) {
        self.fail_bundles.store(fail, Ordering::SeqCst);
    }

    pub fn fail_archives(&self, fail: bool) {
        self.fail_archives.store(fail, Ordering::SeqCst);
    }

    pub fn bundles(&self) -> Vec<ArtifactBundle> {
        self.bundles.lock().unwrap().clone()
    }

    pub fn archives(&self) -> Vec<(String, Vec<u8>)> {
        self.archives.lock().unwrap().clone()
    }
}

#[async_trait]
impl Exporter for MemoryExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export_bundle(&self, bundle: &ArtifactBundle) -> Result<(), ExportError> {
        if self.fail_bundles.load(Ordering::SeqCst) {
            return Err(ExportError::Rejected(format!("{} is failing", self.name)));
        }
        self.bundles.lock().unwrap().push(bundle.clone());
        Ok(())
    }

    async fn export_archive(&self, name: &str, bytes: &[u8]) -> Result<(), ExportError> {
        if self.fail_archives.load(Ordering::SeqCst) {
            return Err(ExportError::Rejected(format!("{} is failing", self.name)));
        }
        self.archives
            .lock()
            .unwrap()
            .push((name.to_string(), bytes.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeConnector / FixedLocator
// ---------------------------------------------------------------------------

/// Scripted dial results per endpoint.
///
/// Each call to an endpoint pops the next scripted result; `None` means the
/// connection succeeded. Unscripted endpoints and exhausted scripts connect.
#[derive(Debug, Default)]
pub struct FakeConnector {
    scripts: Mutex<HashMap<String, VecDeque<Option<String>>>>,
    always_failing: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, endpoint: &str, results: &[Option<&str>]) -> Self {
        self.scripts.lock().unwrap().insert(
            endpoint.to_string(),
            results.iter().map(|r| r.map(str::to_string)).collect(),
        );
        self
    }

    pub fn always_fail(self, endpoint: &str, error: &str) -> Self {
        self.always_failing
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), error.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &str, _timeout: Duration) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.always_failing.lock().unwrap().get(endpoint) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, error.clone()));
        }
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front)
            .flatten();
        match next {
            Some(error) => Err(io::Error::new(io::ErrorKind::ConnectionRefused, error)),
            None => Ok(()),
        }
    }
}

/// Locator with a fixed answer.
#[derive(Debug, Clone)]
pub struct FixedLocator(Option<String>);

impl FixedLocator {
    pub fn host(host: &str) -> Self {
        Self(Some(host.to_string()))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

#[async_trait]
impl ApiServerLocator for FixedLocator {
    async fn api_server_host(&self) -> Result<String, LocateError> {
        self.0
            .clone()
            .ok_or_else(|| LocateError::NoKubeconfig("fake: no kubeconfig".to_string()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedUnit
// ---------------------------------------------------------------------------

/// What a [`ScriptedUnit`] does after emitting its artifacts.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    Panic(String),
    /// Never returns and ignores cancellation.
    Hang,
    /// Sleeps, then succeeds; returns early with `Cancelled` when cancelled.
    Sleep(Duration),
}

/// Tracks how many scripted units run at the same time.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
    invocations: AtomicUsize,
}

impl ActivityTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Activity<'a>(Option<&'a ActivityTracker>);

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        if let Some(tracker) = self.0 {
            tracker.exit();
        }
    }
}

/// Unit that emits `artifacts` numbered artifacts, then follows `behavior`.
#[derive(Debug, Clone)]
pub struct ScriptedUnit {
    name: String,
    artifacts: usize,
    behavior: Behavior,
    tracker: Option<Arc<ActivityTracker>>,
}

impl ScriptedUnit {
    pub fn new(name: &str, artifacts: usize, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            artifacts,
            behavior,
            tracker: None,
        }
    }

    pub fn ok(name: &str, artifacts: usize) -> Self {
        Self::new(name, artifacts, Behavior::Succeed)
    }

    pub fn failing(name: &str, artifacts: usize, reason: &str) -> Self {
        Self::new(name, artifacts, Behavior::Fail(reason.to_string()))
    }

    pub fn panicking(name: &str, artifacts: usize, message: &str) -> Self {
        Self::new(name, artifacts, Behavior::Panic(message.to_string()))
    }

    pub fn hanging(name: &str, artifacts: usize) -> Self {
        Self::new(name, artifacts, Behavior::Hang)
    }

    pub fn sleeping(name: &str, artifacts: usize, delay: Duration) -> Self {
        Self::new(name, artifacts, Behavior::Sleep(delay))
    }

    pub fn tracked(mut self, tracker: Arc<ActivityTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

#[async_trait]
impl DiagnosisUnit for ScriptedUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &UnitContext) -> UnitResult<()> {
        let tracker = self.tracker.as_deref();
        if let Some(tracker) = tracker {
            tracker.enter();
        }
        let _activity = Activity(tracker);

        for i in 0..self.artifacts {
            ctx.emit(&format!("artifact-{i}"), format!("{} #{i}", self.name));
        }

        match &self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(reason) => Err(UnitError::Command {
                command: self.name.clone(),
                detail: reason.clone(),
            }),
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behavior::Sleep(delay) => {
                tokio::select! {
                    _ = ctx.cancelled() => Err(UnitError::Cancelled),
                    _ = tokio::time::sleep(*delay) => Ok(()),
                }
            }
        }
    }
}
