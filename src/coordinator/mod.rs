// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica pipeline coordinator.
//!
//! Ties one consumer group to one pair of replica stores:
//!
//! ```text
//!   ┌──────────────┐   add()   ┌──────────────────┐  drain   ┌──────────────────┐
//!   │ consume task │ ────────▶ │ BatchAccumulator │ ───────▶ │   flush task     │
//!   │ (group G)    │           └──────────────────┘          │ BatchFlusher<W>  │
//!   └──────────────┘                                         └────────┬─────────┘
//!          ▲ consume_shutdown                       flush_shutdown ▲  │ write_batch
//!          └──────────────────── shutdown() ───────────────────────┘  ▼
//!                                                               DualSinkWriter
//! ```
//!
//! The two tasks share only the accumulator. Shutdown is ordered: the
//! consume task is stopped and joined first, then the flush task is told to
//! stop, so its final drain sees every record that was ever committed.
//! The consume task gets a bounded grace period and is aborted past it; the
//! flush task is always awaited to completion, retries and dead-lettering
//! included.

mod types;

pub use types::{PipelineState, PipelineStatus};

use crate::batch::{BatchAccumulator, BatchFlusher, BatchSink, FlushPolicy};
use crate::config::{KafkaConfig, ReplicationConfig};
use crate::consumer::StreamConsumer;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// How long the consume task gets to exit after being told to stop.
const CONSUME_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// One consumer group replicating into one writer.
pub struct ReplicaPipeline<W: BatchSink> {
    name: String,
    kafka: KafkaConfig,
    policy: FlushPolicy,
    consume_stop_timeout: Duration,
    accumulator: Arc<BatchAccumulator>,
    flusher: Arc<BatchFlusher<W>>,

    state_tx: watch::Sender<PipelineState>,
    state_rx: watch::Receiver<PipelineState>,

    consume_shutdown: watch::Sender<bool>,
    flush_shutdown: watch::Sender<bool>,

    consume_handle: Option<JoinHandle<()>>,
    flush_handle: Option<JoinHandle<()>>,
}

impl<W: BatchSink> ReplicaPipeline<W> {
    /// Create a pipeline. Nothing runs until [`start()`](Self::start).
    pub fn new(
        name: impl Into<String>,
        kafka: KafkaConfig,
        policy: FlushPolicy,
        writer: Arc<W>,
    ) -> Self {
        let name = name.into();
        let accumulator = Arc::new(BatchAccumulator::new(policy.max_batch_size));
        let flusher = Arc::new(BatchFlusher::new(
            name.clone(),
            Arc::clone(&accumulator),
            writer,
            policy.clone(),
        ));
        let (state_tx, state_rx) = watch::channel(PipelineState::Created);
        let (consume_shutdown, _) = watch::channel(false);
        let (flush_shutdown, _) = watch::channel(false);

        Self {
            name,
            kafka,
            policy,
            consume_stop_timeout: CONSUME_STOP_TIMEOUT,
            accumulator,
            flusher,
            state_tx,
            state_rx,
            consume_shutdown,
            flush_shutdown,
            consume_handle: None,
            flush_handle: None,
        }
    }

    /// Build from the full configuration, named after the consumer group.
    pub fn from_config(config: &ReplicationConfig, writer: Arc<W>) -> Self {
        Self::new(
            config.kafka.group_id.clone(),
            config.kafka.clone(),
            FlushPolicy::from_config(&config.batch),
            writer,
        )
    }

    /// Override how long shutdown waits for the consume task before aborting it.
    pub fn with_consume_stop_timeout(mut self, timeout: Duration) -> Self {
        self.consume_stop_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), PipelineState::Running)
    }

    pub fn accumulator(&self) -> &Arc<BatchAccumulator> {
        &self.accumulator
    }

    pub fn flusher(&self) -> &Arc<BatchFlusher<W>> {
        &self.flusher
    }

    pub async fn status(&self) -> PipelineStatus {
        PipelineStatus {
            name: self.name.clone(),
            state: self.state(),
            pending_records: self.accumulator.len(),
            flushes: self.flusher.flush_count().await,
        }
    }

    fn set_state(&self, state: PipelineState) {
        let _ = self.state_tx.send(state);
        metrics::set_pipeline_state(&self.name, state.as_str());
    }

    /// Start consuming from Kafka and flushing.
    pub async fn start(&mut self) -> Result<()> {
        if self.kafka.topic.is_empty() || self.kafka.group_id.is_empty() {
            self.set_state(PipelineState::Failed);
            return Err(ReplicationError::Config(
                "pipeline needs a topic and a consumer group".to_string(),
            ));
        }
        let consumer = StreamConsumer::new(self.kafka.clone(), Arc::clone(&self.accumulator));
        self.start_with_feed(move |_accumulator, shutdown_rx| async move {
            consumer.run(shutdown_rx).await;
        })
        .await
    }

    /// Start with a custom record feed in place of the Kafka consumer.
    ///
    /// `feed` receives the accumulator and the consume-side shutdown signal
    /// and must return once the signal is set.
    pub async fn start_with_feed<F, Fut>(&mut self, feed: F) -> Result<()>
    where
        F: FnOnce(Arc<BatchAccumulator>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.state() != PipelineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: PipelineState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            pipeline = %self.name,
            topic = %self.kafka.topic,
            group_id = %self.kafka.group_id,
            max_batch_size = self.policy.max_batch_size,
            max_batch_delay_ms = self.policy.max_batch_delay.as_millis() as u64,
            "Starting replica pipeline"
        );
        self.set_state(PipelineState::Starting);

        let flusher = Arc::clone(&self.flusher);
        let flush_rx = self.flush_shutdown.subscribe();
        self.flush_handle = Some(tokio::spawn(flusher.run(flush_rx)));

        let consume_rx = self.consume_shutdown.subscribe();
        self.consume_handle = Some(tokio::spawn(feed(Arc::clone(&self.accumulator), consume_rx)));

        self.set_state(PipelineState::Running);
        info!(pipeline = %self.name, "Replica pipeline running");
        Ok(())
    }

    /// Stop consuming, drain the accumulator, and wait for both tasks.
    pub async fn shutdown(&mut self) {
        info!(pipeline = %self.name, "Shutting down replica pipeline");
        self.set_state(PipelineState::ShuttingDown);

        self.consume_shutdown.send_replace(true);
        if let Some(mut handle) = self.consume_handle.take() {
            match tokio::time::timeout(self.consume_stop_timeout, &mut handle).await {
                Ok(joined) => log_join(&self.name, "consume", joined),
                Err(_) => {
                    warn!(
                        pipeline = %self.name,
                        timeout_ms = self.consume_stop_timeout.as_millis() as u64,
                        "Consume task did not stop in time, aborting it"
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        // No timeout here: the final drain must finish before the pipeline
        // reports Stopped.
        self.flush_shutdown.send_replace(true);
        if let Some(handle) = self.flush_handle.take() {
            log_join(&self.name, "flush", handle.await);
        }

        let remaining = self.accumulator.len();
        if remaining > 0 {
            warn!(pipeline = %self.name, remaining, "Records left unflushed at shutdown");
        }

        self.set_state(PipelineState::Stopped);
        info!(pipeline = %self.name, "Replica pipeline stopped");
    }
}

fn log_join(pipeline: &str, task: &str, joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => debug!(pipeline, task, "Task completed gracefully"),
        Err(e) => warn!(pipeline, task, error = %e, "Task failed during shutdown"),
    }
}
