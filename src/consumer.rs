// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer-group loop feeding the batch accumulator.
//!
//! # Delivery Contract
//!
//! Each message goes through two steps in order:
//!
//! 1. **Accumulate**: decode and push onto the [`BatchAccumulator`]. This
//!    cannot fail once the record is decoded.
//! 2. **Commit**: acknowledge the message's offset to the group coordinator.
//!
//! A crash between pull and commit means redelivery (at-least-once). A crash
//! after commit but before the next flush loses the buffered records for
//! this replica: the gap is bounded by the flush policy, not zero.
//!
//! Empty payloads and payloads that fail to decode are logged, counted and
//! committed, so one bad message never stalls the partition.
//!
//! # Reconnection
//!
//! Any broker error from `recv()` tears the consumer down. After a fixed
//! backoff (interruptible by shutdown) a fresh consumer is created and
//! resubscribed; the group protocol hands its partitions back.

use crate::batch::BatchAccumulator;
use crate::config::KafkaConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::record::{Decoded, RecordCodec};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer as KafkaStreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::ClientContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Group membership logging
// ═══════════════════════════════════════════════════════════════════════════════

/// rdkafka context that reports partition assignment changes.
///
/// Partition ownership is left entirely to the group protocol; this only
/// observes it.
pub struct ReplicaContext {
    group_id: String,
}

impl ReplicaContext {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
        }
    }

    fn report(&self, stage: &str, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) | Rebalance::Revoke(tpl) => {
                let (kind, partitions) = describe_rebalance(rebalance);
                let assigned: Vec<String> = tpl
                    .elements()
                    .iter()
                    .map(|e| format!("{}/{}", e.topic(), e.partition()))
                    .collect();
                info!(
                    group_id = %self.group_id,
                    stage,
                    kind,
                    partitions,
                    assignment = ?assigned,
                    "Group membership changed"
                );
                if stage == "post" {
                    metrics::record_rebalance(&self.group_id, kind, partitions);
                }
            }
            Rebalance::Error(e) => {
                warn!(group_id = %self.group_id, stage, error = %e, "Rebalance error");
                metrics::record_error("consumer", "rebalance");
            }
        }
    }
}

/// `(kind, partition count)` for a rebalance event.
pub fn describe_rebalance(rebalance: &Rebalance<'_>) -> (&'static str, usize) {
    match rebalance {
        Rebalance::Assign(tpl) => ("assign", tpl.count()),
        Rebalance::Revoke(tpl) => ("revoke", tpl.count()),
        Rebalance::Error(_) => ("error", 0),
    }
}

impl ClientContext for ReplicaContext {}

impl ConsumerContext for ReplicaContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        self.report("pre", rebalance);
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        self.report("post", rebalance);
    }
}

type GroupConsumer = KafkaStreamConsumer<ReplicaContext>;

// ═══════════════════════════════════════════════════════════════════════════════
// Per-message handling
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a message was committed without being accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Empty,
    DecodeError,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::DecodeError => "decode_error",
        }
    }
}

/// What the consume loop did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Record buffered; `pending` is the accumulator size afterwards.
    Accumulated { pending: usize },
    Skipped(SkipReason),
}

/// Decode `payload` and buffer it. Every outcome is safe to commit.
pub fn handle_payload(
    group_id: &str,
    payload: Option<&[u8]>,
    accumulator: &BatchAccumulator,
) -> MessageOutcome {
    let decoded = match payload {
        None => Ok(Decoded::Skip),
        Some(bytes) => RecordCodec::decode(bytes),
    };

    match decoded {
        Ok(Decoded::Record(record)) => {
            metrics::record_message_consumed(group_id);
            MessageOutcome::Accumulated {
                pending: accumulator.add(record),
            }
        }
        Ok(Decoded::Skip) => {
            debug!(group_id, "Skipping empty payload");
            metrics::record_message_skipped(group_id, SkipReason::Empty.as_str());
            MessageOutcome::Skipped(SkipReason::Empty)
        }
        Err(e) => {
            warn!(group_id, error = %e, "Skipping undecodable payload");
            metrics::record_message_skipped(group_id, SkipReason::DecodeError.as_str());
            MessageOutcome::Skipped(SkipReason::DecodeError)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamConsumer
// ═══════════════════════════════════════════════════════════════════════════════

/// Counts for one [`StreamConsumer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub accumulated: u64,
    pub skipped: u64,
    pub commit_failures: u64,
    pub reconnects: u64,
}

enum SessionEnd {
    Shutdown,
    Broker(KafkaError),
}

/// rdkafka settings for a manually committing group member.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("enable.partition.eof", "false");
    cfg
}

/// Subscribes to one topic under one consumer group.
pub struct StreamConsumer {
    config: KafkaConfig,
    accumulator: Arc<BatchAccumulator>,
}

impl StreamConsumer {
    pub fn new(config: KafkaConfig, accumulator: Arc<BatchAccumulator>) -> Self {
        Self {
            config,
            accumulator,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    fn connect(&self) -> Result<GroupConsumer> {
        let consumer: GroupConsumer = client_config(&self.config)
            .create_with_context(ReplicaContext::new(self.config.group_id.clone()))
            .map_err(|e| ReplicationError::kafka("create_consumer", e))?;
        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| ReplicationError::kafka("subscribe", e))?;
        Ok(consumer)
    }

    /// Consume until shutdown, rebuilding the consumer after broker errors.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> ConsumeSummary {
        let span = info_span!(
            "consumer",
            group_id = %self.config.group_id,
            topic = %self.config.topic
        );

        async move {
            let backoff = self.config.reconnect_backoff_duration();
            let mut summary = ConsumeSummary::default();
            info!("Starting consumer");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let consumer = match self.connect() {
                    Ok(consumer) => consumer,
                    Err(e) => {
                        error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Failed to subscribe");
                        metrics::record_error("consumer", "connect");
                        if !wait_or_shutdown(backoff, &mut shutdown_rx).await {
                            break;
                        }
                        continue;
                    }
                };
                info!("Subscribed");

                match self.consume(&consumer, &mut shutdown_rx, &mut summary).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Broker(e) => {
                        warn!(
                            error = %e,
                            backoff_ms = backoff.as_millis() as u64,
                            "Broker error, reconnecting"
                        );
                        summary.reconnects += 1;
                        metrics::record_consumer_reconnect(&self.config.group_id);
                        drop(consumer);
                        if !wait_or_shutdown(backoff, &mut shutdown_rx).await {
                            break;
                        }
                    }
                }
            }

            info!(
                accumulated = summary.accumulated,
                skipped = summary.skipped,
                reconnects = summary.reconnects,
                "Consumer stopped"
            );
            summary
        }
        .instrument(span)
        .await
    }

    async fn consume(
        &self,
        consumer: &GroupConsumer,
        shutdown_rx: &mut watch::Receiver<bool>,
        summary: &mut ConsumeSummary,
    ) -> SessionEnd {
        let group_id = self.config.group_id.as_str();
        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        return SessionEnd::Shutdown;
                    }
                }

                received = consumer.recv() => {
                    let message = match received {
                        Ok(message) => message,
                        Err(e) => return SessionEnd::Broker(e),
                    };

                    match handle_payload(group_id, message.payload(), &self.accumulator) {
                        MessageOutcome::Accumulated { .. } => summary.accumulated += 1,
                        MessageOutcome::Skipped(reason) => {
                            summary.skipped += 1;
                            debug!(
                                partition = message.partition(),
                                offset = message.offset(),
                                reason = reason.as_str(),
                                "Message skipped"
                            );
                        }
                    }

                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        summary.commit_failures += 1;
                        metrics::record_commit_failure(group_id);
                        warn!(
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Offset commit failed; message may be redelivered"
                        );
                    }
                }
            }
        }
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns `false` on shutdown.
async fn wait_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(delay) => true,
    }
}
