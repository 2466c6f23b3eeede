//! Run trigger detection.
//!
//! [`RunWatcher`] polls a [`ControlSource`] and turns every observed change of
//! the control value into one [`Trigger`]. Triggers travel through a
//! single-slot handoff: the watcher waits until the consumer accepts a trigger
//! before it looks at the control value again, and the consumer accepts the
//! next trigger only once the previous run is done. Runs are therefore
//! serialized, and several changes between two polls collapse into the value
//! seen at poll time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{CoreError, RunId};
use crate::metrics::METRICS;
use crate::obs;

/// Default interval between two reads of the control value.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Failure to read the control value. Transient: the next tick retries.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("cannot read control file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control source unavailable: {0}")]
    Unavailable(String),
}

/// Where the run identifier comes from.
#[async_trait]
pub trait ControlSource: Send + Sync {
    async fn read(&self) -> Result<String, ControlError>;
}

/// Reads the control value from a file, e.g. a mounted config-map key.
#[derive(Debug, Clone)]
pub struct FileControlSource {
    path: PathBuf,
}

impl FileControlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ControlSource for FileControlSource {
    async fn read(&self) -> Result<String, ControlError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ControlError::Read {
                path: self.path.clone(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Handoff
// ---------------------------------------------------------------------------

/// A run request waiting to be accepted by the consumer.
#[derive(Debug)]
pub struct Trigger {
    run_id: RunId,
    ack: oneshot::Sender<()>,
    busy: Arc<AtomicBool>,
}

impl Trigger {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Accept the trigger: releases the watcher and marks the consumer busy
    /// until the returned guard is dropped.
    pub fn accept(self) -> (RunId, BusyGuard) {
        self.busy.store(true, Ordering::SeqCst);
        // The watcher may have shut down in the meantime; the run still happens.
        let _ = self.ack.send(());
        (
            self.run_id,
            BusyGuard {
                busy: Arc::clone(&self.busy),
            },
        )
    }
}

/// Marks the consumer as busy for as long as it lives.
#[derive(Debug)]
pub struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Producer half of the handoff, owned by the watcher.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    slot: mpsc::Sender<Trigger>,
    busy: Arc<AtomicBool>,
}

/// Consumer half of the handoff, owned by the run loop.
#[derive(Debug)]
pub struct TriggerReceiver {
    slot: mpsc::Receiver<Trigger>,
    busy: Arc<AtomicBool>,
}

/// Create a single-slot trigger handoff.
pub fn handoff() -> (TriggerSender, TriggerReceiver) {
    let (tx, rx) = mpsc::channel(1);
    let busy = Arc::new(AtomicBool::new(false));
    (
        TriggerSender {
            slot: tx,
            busy: Arc::clone(&busy),
        },
        TriggerReceiver { slot: rx, busy },
    )
}

impl TriggerSender {
    /// Hand `run_id` to the consumer and wait until it is accepted.
    ///
    /// Fails with [`CoreError::HandoffClosed`] if the consumer is gone.
    pub async fn deliver(&self, run_id: RunId) -> Result<(), CoreError> {
        let (ack, accepted) = oneshot::channel();
        let trigger = Trigger {
            run_id,
            ack,
            busy: Arc::clone(&self.busy),
        };
        self.slot
            .send(trigger)
            .await
            .map_err(|_| CoreError::HandoffClosed)?;
        accepted.await.map_err(|_| CoreError::HandoffClosed)
    }

    /// Whether the consumer is currently executing a run.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl TriggerReceiver {
    /// Wait for the next trigger. `None` once every sender is dropped.
    pub async fn next(&mut self) -> Option<Trigger> {
        self.slot.recv().await
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Polls a control source and emits one trigger per observed change.
pub struct RunWatcher {
    source: Arc<dyn ControlSource>,
    poll_interval: Duration,
    last_seen: Option<RunId>,
}

impl RunWatcher {
    pub fn new(source: Arc<dyn ControlSource>, poll_interval: Duration) -> Self {
        Self {
            source,
            poll_interval,
            last_seen: None,
        }
    }

    pub fn last_seen(&self) -> Option<&RunId> {
        self.last_seen.as_ref()
    }

    /// Read the control value once.
    ///
    /// Returns the new run id when it differs from the last observed one.
    /// Read errors and empty values count as "no change".
    pub async fn poll_once(&mut self) -> Option<RunId> {
        let raw = match self.source.read().await {
            Ok(raw) => raw,
            Err(e) => {
                METRICS.inc_poll_errors();
                warn!(error = %e, "failed to read control value; retrying next tick");
                return None;
            }
        };

        let current = RunId::parse(&raw)?;
        if self.last_seen.as_ref() == Some(&current) {
            return None;
        }
        self.last_seen = Some(current.clone());
        Some(current)
    }

    /// Poll until `cancel` fires or the consumer goes away.
    pub async fn run(mut self, sender: TriggerSender, cancel: CancellationToken) {
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "run watcher started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(run_id) = self.poll_once().await else {
                continue;
            };
            obs::emit_trigger_observed(&run_id, sender.is_busy());

            tokio::select! {
                _ = cancel.cancelled() => break,
                delivered = sender.deliver(run_id) => {
                    if delivered.is_err() {
                        debug!("trigger consumer gone; stopping watcher");
                        break;
                    }
                }
            }
        }
        info!("run watcher stopped");
    }
}
