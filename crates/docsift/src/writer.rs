//! Batch-and-flush writer for best-effort side records.
//!
//! A [`BufferedWriter`] owns a background task that collects records from a
//! bounded channel and hands them to a [`BatchSink`] in batches, flushing
//! when `batch_size` records are pending or `flush_interval` elapses,
//! whichever comes first. [`write`](BufferedWriter::write) never blocks; when
//! the channel is full the record is dropped and `false` returned.
//! [`close`](BufferedWriter::close) flushes what is left and waits for it.
//!
//! The process entry point builds one writer per record kind and passes it
//! by reference; there is no global instance.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use docsift_core::store::Store;

use crate::config::WriterConfig;

/// Destination of flushed batches.
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn write_batch(&self, batch: Vec<T>) -> Result<()>;
}

pub struct BufferedWriter<T> {
    tx: mpsc::Sender<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> BufferedWriter<T> {
    /// Spawn the flush task. Must be called inside a tokio runtime.
    pub fn init(config: &WriterConfig, sink: Arc<dyn BatchSink<T>>) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let task = tokio::spawn(run_flusher(
            rx,
            sink,
            config.batch_size.max(1),
            config.flush_interval(),
        ));
        Self { tx, task }
    }

    /// Queue a record. Returns `false` if it was dropped.
    pub fn write(&self, record: T) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "buffered writer dropped a record");
                false
            }
        }
    }

    /// Flush everything queued and wait for the flush task to end.
    pub async fn close(self) -> Result<()> {
        drop(self.tx);
        self.task.await?;
        Ok(())
    }
}

async fn run_flusher<T>(
    mut rx: mpsc::Receiver<T>,
    sink: Arc<dyn BatchSink<T>>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<T> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            record = rx.recv() => match record {
                Some(record) => {
                    buffer.push(record);
                    if buffer.len() >= batch_size {
                        flush(sink.as_ref(), &mut buffer).await;
                    }
                }
                None => {
                    flush(sink.as_ref(), &mut buffer).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(sink.as_ref(), &mut buffer).await;
            }
        }
    }
}

async fn flush<T>(sink: &dyn BatchSink<T>, buffer: &mut Vec<T>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let size = batch.len();
    if let Err(e) = sink.write_batch(batch).await {
        warn!(error = %e, records = size, "buffered writer flush failed; batch dropped");
    }
}

/// Access-counter hits for chunks returned by a search.
pub struct AccessSink {
    store: Arc<dyn Store>,
}

impl AccessSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchSink<i64> for AccessSink {
    async fn write_batch(&self, batch: Vec<i64>) -> Result<()> {
        self.store.increment_access(&batch).await
    }
}

/// Writer of access-counter hits, one record per returned chunk id.
pub type AccessWriter = BufferedWriter<i64>;
