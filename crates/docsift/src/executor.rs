//! Background ingestion executor.
//!
//! [`IngestExecutor::submit`] returns immediately; the document is indexed
//! on a spawned task. At most `max_concurrent` documents are processed at
//! once (a `tokio::sync::Semaphore`), and at most one task exists per upload
//! id at any time. Each task streams its [`IngestEvent`]s over a bounded
//! channel that closes when the task finishes.

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, warn};

use docsift_core::pipeline::Indexer;
use docsift_core::progress::{IngestEvent, ProgressSink};

const EVENT_BUFFER: usize = 64;

/// Forwards events into a bounded channel without blocking the pipeline.
/// Events are dropped when the receiver lags or is gone.
pub struct ChannelProgress {
    tx: mpsc::Sender<IngestEvent>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::Sender<IngestEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: IngestEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            debug!(?event, "progress receiver lagging; event dropped");
        }
    }
}

/// Removes the upload from the in-flight set when the task ends, however it ends.
struct InFlight {
    upload_id: i64,
    set: Arc<Mutex<HashSet<i64>>>,
    idle: Arc<Notify>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.upload_id);
        }
        self.idle.notify_waiters();
    }
}

pub struct IngestExecutor {
    indexer: Arc<Indexer>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<i64>>>,
    idle: Arc<Notify>,
}

impl IngestExecutor {
    pub fn new(indexer: Arc<Indexer>, max_concurrent: usize) -> Self {
        Self {
            indexer,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// Schedule ingestion of `upload_id`.
    ///
    /// Returns the progress receiver, or `None` when that upload is already
    /// queued or running.
    pub fn submit(&self, upload_id: i64) -> Result<Option<mpsc::Receiver<IngestEvent>>> {
        {
            let mut set = self
                .in_flight
                .lock()
                .map_err(|_| anyhow!("executor state lock poisoned"))?;
            if !set.insert(upload_id) {
                debug!(upload_id, "ingestion already in flight");
                return Ok(None);
            }
        }

        let guard = InFlight {
            upload_id,
            set: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
        };
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let indexer = Arc::clone(&self.indexer);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(upload_id, "executor shut down before ingestion started");
                    return;
                }
            };
            let sink = ChannelProgress::new(tx);
            if let Err(e) = indexer.ingest_upload(upload_id, &sink).await {
                warn!(upload_id, error = %e, "ingest failed");
            }
        });

        Ok(Some(rx))
    }

    /// Whether a task for `upload_id` is queued or running.
    pub fn is_in_flight(&self, upload_id: i64) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(&upload_id))
            .unwrap_or(false)
    }

    /// Wait until no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            let empty = self.in_flight.lock().map(|s| s.is_empty()).unwrap_or(true);
            if empty {
                return;
            }
            notified.await;
        }
    }

    /// Stop starting new work. Tasks still waiting for a permit exit and
    /// leave their uploads `pending`; running tasks finish.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}
