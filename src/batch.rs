// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch accumulation and the size-or-time flush loop.
//!
//! # Design
//!
//! ```text
//! consume task ──add()──▶ BatchAccumulator ◀──drain_and_reset()── BatchFlusher
//!                         Mutex<Vec<Record>>                        │
//!                         Notify (size reached)                     │ flush lock:
//!                                                                   │ one batch in flight
//!                                                                   ▼
//!                                                        BatchSink::write_batch(Vec)
//! ```
//!
//! The accumulator is the only state shared between the consume and flush
//! tasks. A drain swaps the whole buffer out under the lock, so every record
//! lands in exactly one batch, and a fresh `Vec` is handed to the writer by
//! value.

use crate::config::BatchConfig;
use crate::metrics;
use crate::record::OrderPaymentRecord;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Upper bound on the buffer capacity reserved up front.
const MAX_PREALLOCATED: usize = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// FlushPolicy
// ═══════════════════════════════════════════════════════════════════════════════

/// When the buffered records must be written out.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Flush once this many records are buffered.
    pub max_batch_size: usize,
    /// Flush once this long has passed since the previous flush.
    pub max_batch_delay: Duration,
    /// How often the flush loop re-checks the thresholds.
    pub poll_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl FlushPolicy {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_batch_delay: config.max_batch_delay_duration(),
            poll_interval: config.poll_interval_duration(),
        }
    }

    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    pub fn size_reached(&self, pending: usize) -> bool {
        pending >= self.max_batch_size
    }

    /// Check if a flush is due. Never true for an empty buffer.
    pub fn should_flush(&self, pending: usize, since_last_flush: Duration) -> bool {
        if pending == 0 {
            return false;
        }
        self.size_reached(pending) || since_last_flush >= self.max_batch_delay
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchAccumulator
// ═══════════════════════════════════════════════════════════════════════════════

/// Thread-safe holding area for consumed records awaiting flush.
#[derive(Debug)]
pub struct BatchAccumulator {
    pending: Mutex<Vec<OrderPaymentRecord>>,
    size_reached: Notify,
    threshold: usize,
}

impl BatchAccumulator {
    /// Create an accumulator that signals once `threshold` records are buffered.
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            pending: Mutex::new(Vec::with_capacity(threshold.min(MAX_PREALLOCATED))),
            size_reached: Notify::new(),
            threshold,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OrderPaymentRecord>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record. Once this returns, the record belongs to the next drain.
    ///
    /// Returns the number of buffered records after the append.
    pub fn add(&self, record: OrderPaymentRecord) -> usize {
        let len = {
            let mut pending = self.lock();
            pending.push(record);
            pending.len()
        };
        if len >= self.threshold {
            self.size_reached.notify_one();
        }
        len
    }

    /// Atomically take every buffered record, leaving the accumulator empty.
    pub fn drain_and_reset(&self) -> Vec<OrderPaymentRecord> {
        let mut pending = self.lock();
        std::mem::replace(
            &mut *pending,
            Vec::with_capacity(self.threshold.min(MAX_PREALLOCATED)),
        )
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Resolves after an `add()` reaches the threshold.
    pub async fn threshold_reached(&self) {
        self.size_reached.notified().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchSink + BatchResult
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of writing one batch to every configured store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Number of records in the batch.
    pub total: usize,
    /// Stores that committed the batch.
    pub stores_written: usize,
    /// Stores that failed after retries.
    pub stores_failed: usize,
    /// Stores whose failed batch was persisted to the dead-letter directory.
    pub dead_lettered: usize,
}

impl BatchResult {
    /// Check if every store committed the batch.
    pub fn is_success(&self) -> bool {
        self.stores_failed == 0
    }
}

/// Destination of drained batches.
///
/// Implementations must not panic and report per-store failures in the
/// returned [`BatchResult`] rather than failing the flush loop.
pub trait BatchSink: Send + Sync + 'static {
    fn write_batch(&self, batch: Vec<OrderPaymentRecord>) -> BoxFuture<'_, BatchResult>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatchFlusher
// ═══════════════════════════════════════════════════════════════════════════════

/// What triggered a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Manual,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Interval => "interval",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
struct FlushState {
    last_flush: Instant,
    flushes: u64,
}

/// Drains the accumulator into a [`BatchSink`], one batch at a time.
pub struct BatchFlusher<W: BatchSink> {
    pipeline: String,
    accumulator: Arc<BatchAccumulator>,
    writer: Arc<W>,
    policy: FlushPolicy,
    /// Held for the whole drain + write, so flushes never overlap.
    state: AsyncMutex<FlushState>,
}

impl<W: BatchSink> BatchFlusher<W> {
    pub fn new(
        pipeline: impl Into<String>,
        accumulator: Arc<BatchAccumulator>,
        writer: Arc<W>,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            accumulator,
            writer,
            policy,
            state: AsyncMutex::new(FlushState {
                last_flush: Instant::now(),
                flushes: 0,
            }),
        }
    }

    pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
        &self.accumulator
    }

    /// Number of non-empty batches written so far.
    pub async fn flush_count(&self) -> u64 {
        self.state.lock().await.flushes
    }

    /// Drain and write whatever is buffered.
    ///
    /// Waits for any in-flight flush first. Returns `None` when there was
    /// nothing to write; the writer is not called in that case.
    #[instrument(skip(self), fields(pipeline = %self.pipeline))]
    pub async fn flush(&self, trigger: FlushTrigger) -> Option<BatchResult> {
        let mut state = self.state.lock().await;
        let batch = self.accumulator.drain_and_reset();
        state.last_flush = Instant::now();
        metrics::set_pending_records(&self.pipeline, self.accumulator.len());

        if batch.is_empty() {
            return None;
        }

        let size = batch.len();
        debug!(batch_size = size, "Flushing batch");
        let start = Instant::now();
        let result = self.writer.write_batch(batch).await;
        let elapsed = start.elapsed();
        state.flushes += 1;

        metrics::record_batch_flush(&self.pipeline, trigger.as_str(), size, elapsed);
        if result.is_success() {
            debug!(
                batch_size = size,
                stores_written = result.stores_written,
                duration_ms = elapsed.as_millis() as u64,
                "Batch flushed"
            );
        } else {
            warn!(
                batch_size = size,
                stores_written = result.stores_written,
                stores_failed = result.stores_failed,
                dead_lettered = result.dead_lettered,
                "Batch flush partially failed"
            );
        }
        Some(result)
    }

    /// True if the interval (or size) threshold has passed and no flush is running.
    fn interval_due(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => self
                .policy
                .should_flush(self.accumulator.len(), state.last_flush.elapsed()),
            Err(_) => false,
        }
    }

    /// Run the flush loop until shutdown, then perform one final drain.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("batch_flusher", pipeline = %self.pipeline);
        async move {
            info!(
                max_batch_size = self.policy.max_batch_size,
                max_batch_delay_ms = self.policy.max_batch_delay.as_millis() as u64,
                "Flush loop started"
            );

            let mut ticker = tokio::time::interval(self.policy.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = self.accumulator.threshold_reached() => {
                        // Stale wakeups after an interval flush find a small buffer.
                        if self.policy.size_reached(self.accumulator.len()) {
                            self.flush(FlushTrigger::Size).await;
                        }
                    }

                    _ = ticker.tick() => {
                        if self.interval_due() {
                            let trigger = if self.policy.size_reached(self.accumulator.len()) {
                                FlushTrigger::Size
                            } else {
                                FlushTrigger::Interval
                            };
                            self.flush(trigger).await;
                        }
                    }
                }
            }

            let remaining = self.accumulator.len();
            info!(remaining, "Flush loop stopping, draining remaining records");
            self.flush(FlushTrigger::Shutdown).await;
            let flushes = self.flush_count().await;
            info!(flushes, "Flush loop stopped");
        }
        .instrument(span)
        .await
    }
}
