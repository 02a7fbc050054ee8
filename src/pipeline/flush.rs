use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BatchConfig;
use crate::error::PipelineError;
use crate::export::health::HealthMetrics;
use crate::packet::BatchRecord;
use crate::report::ErrorReporter;
use crate::store::RecordStore;

/// Performs one bulk insert of `records`, preserving their order.
pub async fn flush<S: RecordStore>(
    store: &S,
    records: &[BatchRecord],
) -> Result<(), PipelineError> {
    store
        .bulk_insert(records)
        .await
        .map_err(|e| PipelineError::storage_write(store.name(), records.len(), &e))
}

/// Totals reported by the flush worker when it exits.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    /// Successful bulk inserts.
    pub batches: usize,
    /// Records persisted, retries included.
    pub records: usize,
    /// Failed bulk inserts.
    pub failures: usize,
    /// Records still unpersisted after the shutdown retries.
    pub unpersisted: usize,
}

/// Sending side of the flush queue, shared with the capture thread.
///
/// Batches that find the queue full are spilled into a side buffer and go out
/// in front of the next submitted batch, so the capture thread never waits on
/// the store and order is preserved.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::Sender<Vec<BatchRecord>>,
    spill: Arc<Mutex<Vec<BatchRecord>>>,
    reporter: Arc<dyn ErrorReporter>,
    health: Option<Arc<HealthMetrics>>,
}

impl FlushHandle {
    /// Queues a full batch from the capture thread. Never blocks on the store.
    pub fn submit(&self, batch: Vec<BatchRecord>) {
        let mut spill = self.spill.lock();
        let spilling = !spill.is_empty();
        let batch = merge_spill(&mut spill, batch);

        match self.tx.try_send(batch) {
            Ok(()) => {
                if spilling {
                    tracing::info!("flush queue drained, spilled records queued");
                }
            }
            Err(mpsc::error::TrySendError::Full(batch)) => {
                if let Some(health) = &self.health {
                    health.flush_queue_backpressure.inc();
                }
                if !spilling {
                    tracing::warn!(
                        records = batch.len(),
                        queue_depth = self.tx.max_capacity(),
                        "flush queue full, holding records until the store catches up"
                    );
                }
                *spill = batch;
            }
            Err(mpsc::error::TrySendError::Closed(batch)) => self.report_closed(batch.len()),
        }
    }

    /// Queues a batch from async code once capture has stopped, waiting for
    /// queue space. Spilled records go first; an empty batch still sends them.
    pub async fn submit_async(&self, batch: Vec<BatchRecord>) {
        let batch = merge_spill(&mut self.spill.lock(), batch);
        if batch.is_empty() {
            return;
        }

        if let Err(mpsc::error::SendError(batch)) = self.tx.send(batch).await {
            self.report_closed(batch.len());
        }
    }

    /// Records held back because the queue was full.
    pub fn spilled(&self) -> usize {
        self.spill.lock().len()
    }

    fn report_closed(&self, records: usize) {
        self.reporter.report(&PipelineError::StorageWrite {
            store: "flush-queue".to_string(),
            records,
            message: "flush worker is not running".to_string(),
        });
    }
}

fn merge_spill(spill: &mut Vec<BatchRecord>, batch: Vec<BatchRecord>) -> Vec<BatchRecord> {
    if spill.is_empty() {
        return batch;
    }
    let mut merged = std::mem::take(spill);
    merged.extend(batch);
    merged
}

/// Owns the flush worker: a single task that persists queued batches in order
/// and retains failed ones for the next attempt.
pub struct Flusher<S: RecordStore> {
    store: Arc<S>,
    reporter: Arc<dyn ErrorReporter>,
    health: Option<Arc<HealthMetrics>>,
    cfg: BatchConfig,
    cancel: CancellationToken,
    task: Option<JoinHandle<FlushSummary>>,
}

impl<S: RecordStore> Flusher<S> {
    pub fn new(store: Arc<S>, reporter: Arc<dyn ErrorReporter>, cfg: BatchConfig) -> Self {
        Self {
            store,
            reporter,
            health: None,
            cfg,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Spawns the worker and returns the handle used to feed it.
    ///
    /// The worker also stops when `ctx` is cancelled, after draining the queue.
    pub fn start(&mut self, ctx: &CancellationToken) -> FlushHandle {
        let (tx, rx) = mpsc::channel(self.cfg.queue_depth.max(1));
        self.cancel = ctx.child_token();

        let worker = FlushWorker {
            store: Arc::clone(&self.store),
            reporter: Arc::clone(&self.reporter),
            health: self.health.clone(),
            retained: Vec::new(),
            summary: FlushSummary::default(),
            shutdown_retries: self.cfg.shutdown_retries,
            retry_backoff: self.cfg.retry_backoff,
        };

        self.task = Some(tokio::spawn(worker.run(rx, self.cancel.clone())));

        tracing::debug!(
            store = self.store.name(),
            queue_depth = self.cfg.queue_depth,
            "flush worker started"
        );

        FlushHandle {
            tx,
            spill: Arc::new(Mutex::new(Vec::new())),
            reporter: Arc::clone(&self.reporter),
            health: self.health.clone(),
        }
    }

    /// Stops the worker once every queued batch has been attempted.
    ///
    /// Returns an empty summary if the worker was never started or was
    /// already shut down.
    pub async fn shutdown(&mut self) -> FlushSummary {
        self.cancel.cancel();

        let Some(task) = self.task.take() else {
            return FlushSummary::default();
        };

        match task.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "flush worker panicked");
                FlushSummary::default()
            }
        }
    }
}

struct FlushWorker<S: RecordStore> {
    store: Arc<S>,
    reporter: Arc<dyn ErrorReporter>,
    health: Option<Arc<HealthMetrics>>,
    retained: Vec<BatchRecord>,
    summary: FlushSummary,
    shutdown_retries: u32,
    retry_backoff: Duration,
}

impl<S: RecordStore> FlushWorker<S> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Vec<BatchRecord>>,
        cancel: CancellationToken,
    ) -> FlushSummary {
        loop {
            tokio::select! {
                biased;

                batch = rx.recv() => match batch {
                    Some(batch) => self.flush_with_retained(batch).await,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        // Drain whatever was queued before the shutdown.
        rx.close();
        while let Some(batch) = rx.recv().await {
            self.flush_with_retained(batch).await;
        }

        let mut backoff = self.retry_backoff;
        for attempt in 1..=self.shutdown_retries {
            if self.retained.is_empty() {
                break;
            }

            tracing::info!(
                attempt,
                records = self.retained.len(),
                backoff = ?backoff,
                "retrying retained records before exit"
            );

            tokio::time::sleep(backoff).await;
            self.flush_with_retained(Vec::new()).await;
            backoff = backoff.saturating_mul(2);
        }

        if !self.retained.is_empty() {
            self.summary.unpersisted = self.retained.len();
            self.reporter.report(&PipelineError::StorageWrite {
                store: self.store.name().to_string(),
                records: self.retained.len(),
                message: "records left unpersisted at shutdown".to_string(),
            });
        }

        tracing::debug!(
            batches = self.summary.batches,
            records = self.summary.records,
            failures = self.summary.failures,
            unpersisted = self.summary.unpersisted,
            "flush worker stopped"
        );

        self.summary
    }

    /// Flushes `batch` behind any records retained from earlier failures.
    async fn flush_with_retained(&mut self, batch: Vec<BatchRecord>) {
        let records = if self.retained.is_empty() {
            batch
        } else {
            let mut records = std::mem::take(&mut self.retained);
            records.extend(batch);
            records
        };

        if records.is_empty() {
            return;
        }

        match flush(self.store.as_ref(), &records).await {
            Ok(()) => {
                self.summary.batches += 1;
                self.summary.records += records.len();

                if let Some(health) = &self.health {
                    health.records_flushed.inc_by(records.len() as f64);
                    health.flush_batch_size.observe(records.len() as f64);
                }

                tracing::debug!(records = records.len(), "flushed batch");
            }
            Err(e) => {
                self.summary.failures += 1;
                self.reporter.report(&e);
                self.retained = records;
            }
        }

        if let Some(health) = &self.health {
            health.records_retained.set(self.retained.len() as f64);
        }
    }
}
