//! The diagnosis unit capability and the context it executes in.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{normalize_local_name, Artifact, UnitResult};

/// An independent producer of diagnostic artifacts.
///
/// Implementations are constructed once at startup from explicit
/// configuration and invoked once per run. They must not keep per-run state
/// in `self`: everything an invocation produces goes through
/// [`UnitContext::emit`].
#[async_trait]
pub trait DiagnosisUnit: Send + Sync {
    /// Unique name; also the namespace of every artifact the unit emits.
    fn name(&self) -> &str;

    /// Run the unit once.
    ///
    /// Artifacts emitted before an `Err` are still exported. Long-running
    /// work should watch [`UnitContext::cancelled`].
    async fn execute(&self, ctx: &UnitContext) -> UnitResult<()>;
}

/// Per-invocation artifact buffer owned by exactly one unit.
///
/// Cloning shares the buffer; the scheduler keeps one clone so artifacts
/// survive a unit that panics or overruns its deadline.
#[derive(Debug, Clone)]
pub(crate) struct ArtifactSink {
    unit: Arc<str>,
    artifacts: Arc<Mutex<Vec<Artifact>>>,
}

impl ArtifactSink {
    pub(crate) fn new(unit: &str) -> Self {
        Self {
            unit: Arc::from(unit),
            artifacts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, local_name: &str, content: Vec<u8>) {
        let local_name = normalize_local_name(local_name);
        let artifact = Artifact::namespaced(&self.unit, &local_name, content);
        let mut artifacts = self.lock();
        match artifacts.iter_mut().find(|a| a.name == artifact.name) {
            Some(existing) => {
                debug!(artifact = %artifact.name, "artifact re-emitted; replacing content");
                existing.content = artifact.content;
            }
            None => artifacts.push(artifact),
        }
    }

    pub(crate) fn drain(&self) -> Vec<Artifact> {
        std::mem::take(&mut *self.lock())
    }

    // A panicking unit may poison the lock; its artifacts are still wanted.
    fn lock(&self) -> MutexGuard<'_, Vec<Artifact>> {
        self.artifacts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a unit gets to see while it runs.
pub struct UnitContext {
    sink: ArtifactSink,
    cancel: CancellationToken,
    deadline: Instant,
}

impl UnitContext {
    pub(crate) fn new(sink: ArtifactSink, cancel: CancellationToken, deadline: Instant) -> Self {
        Self {
            sink,
            cancel,
            deadline,
        }
    }

    /// Build a standalone context, e.g. to drive a unit outside the scheduler.
    ///
    /// Returns the context and a handle to read back what the unit emitted.
    pub fn detached(unit: &str, timeout: Duration) -> (Self, EmittedArtifacts) {
        let sink = ArtifactSink::new(unit);
        let ctx = Self::new(
            sink.clone(),
            CancellationToken::new(),
            Instant::now() + timeout,
        );
        (ctx, EmittedArtifacts(sink))
    }

    pub fn unit(&self) -> &str {
        &self.sink.unit
    }

    /// Record an artifact under this unit's namespace.
    ///
    /// The local name is normalized first (see
    /// [`normalize_local_name`](crate::domain::normalize_local_name)).
    /// Emitting the same local name twice replaces the earlier content.
    pub fn emit(&self, local_name: &str, content: impl Into<Vec<u8>>) {
        self.sink.push(local_name, content.into());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is shutting down or this unit's deadline passed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the scheduler gives up on this unit.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Read side of a detached context's artifact buffer.
#[derive(Debug, Clone)]
pub struct EmittedArtifacts(ArtifactSink);

impl EmittedArtifacts {
    pub fn take(&self) -> Vec<Artifact> {
        self.0.drain()
    }
}
