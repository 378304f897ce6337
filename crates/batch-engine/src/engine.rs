//! Batch worker
//!
//! One background task drains the submission queue into an in-memory batch
//! and flushes it to a [`BatchProcessor`] on whichever trigger fires first:
//! the batch is full, or the idle timer since the last flush elapsed.

use crate::error::{BatchError, EngineResult};
use crate::{FLUSH_TIMEOUT_MS, MAX_BATCH_SIZE, QUEUE_CAPACITY};
use async_trait::async_trait;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

/// Outcome the processor reports for a single item
pub type ItemOutcome = Result<(), String>;

/// Processing function invoked with each flushed batch
///
/// Must return one outcome per item, in submission order.
#[async_trait]
pub trait BatchProcessor<T: Send + 'static>: Send + Sync + 'static {
    async fn process(&self, items: Vec<T>) -> EngineResult<Vec<ItemOutcome>>;
}

/// Batch engine configuration
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Flush as soon as this many items are batched
    pub max_batch_size: usize,
    /// Flush a non-empty batch after this long without a flush
    pub flush_timeout: Duration,
    /// Capacity of the submission queue
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
            flush_timeout: Duration::from_millis(FLUSH_TIMEOUT_MS),
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

/// Result delivered for a single item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub item_id: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl BatchResult {
    fn from_outcome(item_id: u64, outcome: ItemOutcome) -> Self {
        match outcome {
            Ok(()) => Self {
                item_id,
                success: true,
                error: None,
            },
            Err(e) => Self {
                item_id,
                success: false,
                error: Some(e),
            },
        }
    }
}

/// A unit of work
pub struct BatchItem<T> {
    pub id: u64,
    pub payload: T,
    result_tx: Option<Sender<BatchResult>>,
}

impl<T> BatchItem<T> {
    pub fn new(id: u64, payload: T) -> Self {
        Self {
            id,
            payload,
            result_tx: None,
        }
    }

    /// Deliver this item's result on `tx`. Delivery never blocks the worker:
    /// if the channel is full or disconnected the result is dropped.
    pub fn with_result_channel(mut self, tx: Sender<BatchResult>) -> Self {
        self.result_tx = Some(tx);
        self
    }
}

/// Snapshot of engine state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub queue_depth: usize,
    pub running: bool,
    pub batches_flushed: u64,
    pub items_processed: u64,
    pub results_dropped: u64,
}

#[derive(Default)]
struct Counters {
    batches_flushed: AtomicU64,
    items_processed: AtomicU64,
    results_dropped: AtomicU64,
}

/// Size/time bounded batching engine
pub struct BatchEngine<T: Send + 'static> {
    config: BatchConfig,
    queue_tx: mpsc::Sender<BatchItem<T>>,
    queue_rx: Mutex<Option<mpsc::Receiver<BatchItem<T>>>>,
    processor: Option<Arc<dyn BatchProcessor<T>>>,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> BatchEngine<T> {
    /// Create a new engine. With no processor, batches are drained and
    /// no results are produced.
    pub fn new(mut config: BatchConfig, processor: Option<Arc<dyn BatchProcessor<T>>>) -> Self {
        config.max_batch_size = config.max_batch_size.max(1);
        config.queue_capacity = config.queue_capacity.max(1);

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (stop_tx, _) = watch::channel(false);

        Self {
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            processor,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Launch the background worker.
    ///
    /// The worker exits when [`stop`](Self::stop) is called or `shutdown`
    /// flips (or its sender is dropped). Either way the queue is drained
    /// and the final partial batch is flushed.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> EngineResult<JoinHandle<()>> {
        if *self.stop_tx.borrow() {
            return Err(BatchError::Stopped);
        }

        let queue_rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or(BatchError::AlreadyStarted)?;

        self.running.store(true, Ordering::SeqCst);

        let worker = Worker {
            queue_rx,
            running: self.running.clone(),
            flusher: Flusher {
                processor: self.processor.clone(),
                config: self.config.clone(),
                counters: self.counters.clone(),
            },
        };
        let stop_rx = self.stop_tx.subscribe();

        Ok(tokio::spawn(worker.run(stop_rx, shutdown)))
    }

    /// Enqueue an item without blocking
    pub fn submit(&self, item: BatchItem<T>) -> EngineResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BatchError::NotRunning);
        }

        self.queue_tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BatchError::NotRunning,
        })
    }

    /// Signal the worker to flush and exit
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_tx.send_replace(true);
    }

    /// Check if the worker is accepting items
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current stats
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            queue_depth: self.queue_tx.max_capacity() - self.queue_tx.capacity(),
            running: self.is_running(),
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
            items_processed: self.counters.items_processed.load(Ordering::Relaxed),
            results_dropped: self.counters.results_dropped.load(Ordering::Relaxed),
        }
    }
}

struct Worker<T: Send + 'static> {
    queue_rx: mpsc::Receiver<BatchItem<T>>,
    running: Arc<AtomicBool>,
    flusher: Flusher<T>,
}

struct Flusher<T: Send + 'static> {
    processor: Option<Arc<dyn BatchProcessor<T>>>,
    config: BatchConfig,
    counters: Arc<Counters>,
}

impl<T: Send + 'static> Worker<T> {
    async fn run(mut self, mut stop_rx: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let max_batch_size = self.flusher.config.max_batch_size;
        let flush_timeout = self.flusher.config.flush_timeout;
        let mut batch: Vec<BatchItem<T>> = Vec::with_capacity(max_batch_size);
        let mut last_flush = Instant::now();

        tracing::info!(
            "Batch worker started (max {} items, {}ms timeout)",
            max_batch_size,
            flush_timeout.as_millis()
        );

        loop {
            let deadline = last_flush + flush_timeout;

            tokio::select! {
                item = self.queue_rx.recv() => match item {
                    Some(item) => {
                        batch.push(item);
                        if batch.len() >= max_batch_size {
                            self.flusher.flush(&mut batch).await;
                            last_flush = Instant::now();
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if !batch.is_empty() {
                        self.flusher.flush(&mut batch).await;
                    }
                    last_flush = Instant::now();
                }
                _ = stop_rx.changed() => break,
                _ = shutdown.changed() => break,
            }
        }

        // Refuse new items, then drain what was already accepted
        self.running.store(false, Ordering::SeqCst);
        self.queue_rx.close();
        while let Some(item) = self.queue_rx.recv().await {
            batch.push(item);
            if batch.len() >= max_batch_size {
                self.flusher.flush(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flusher.flush(&mut batch).await;
        }

        tracing::info!(
            "Batch worker stopped after {} batches",
            self.flusher.counters.batches_flushed.load(Ordering::Relaxed)
        );
    }
}

impl<T: Send + 'static> Flusher<T> {
    async fn flush(&self, batch: &mut Vec<BatchItem<T>>) {
        let items = std::mem::replace(batch, Vec::with_capacity(self.config.max_batch_size));
        let count = items.len();

        let mut payloads = Vec::with_capacity(count);
        let mut receipts = Vec::with_capacity(count);
        for item in items {
            receipts.push((item.id, item.result_tx));
            payloads.push(item.payload);
        }

        self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .items_processed
            .fetch_add(count as u64, Ordering::Relaxed);

        let Some(processor) = self.processor.clone() else {
            tracing::debug!("Flushed {} items with no processor attached", count);
            return;
        };

        // Run in its own task so a panicking processor cannot take the worker down
        let outcomes = match tokio::spawn(async move { processor.process(payloads).await }).await {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(e)) => {
                tracing::warn!("Batch of {} items failed: {}", count, e);
                return;
            }
            Err(e) => {
                tracing::error!("Batch processor panicked: {}", e);
                return;
            }
        };

        if outcomes.len() != count {
            tracing::warn!(
                "Processor returned {} results for {} items",
                outcomes.len(),
                count
            );
        }

        for ((item_id, result_tx), outcome) in receipts.into_iter().zip(outcomes) {
            let Some(tx) = result_tx else {
                continue;
            };
            match tx.try_send(BatchResult::from_outcome(item_id, outcome)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.counters.results_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        tracing::trace!("Flushed batch of {} items", count);
    }
}
