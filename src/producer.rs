// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topic publisher with bounded retry and delivery accounting.
//!
//! Every send waits for the broker's acknowledgment from all in-sync
//! replicas (`acks=all`). Transient failures are retried with a fixed
//! backoff; once the budget is spent the failure is returned to the caller
//! as [`ReplicationError::Publish`] and counted in [`DeliveryStats`].
//!
//! The counters are owned by the producer and handed out by reference
//! (cloning shares them), so several exporters can report through one
//! producer without any process-wide state.

use crate::config::{KafkaConfig, ProducerConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::{retry, RetryConfig};
use crate::sink::SinkFuture;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Seams
// ═══════════════════════════════════════════════════════════════════════════════

/// One acknowledged send. Returns `(partition, offset)`.
///
/// Implemented for rdkafka's [`FutureProducer`]; tests substitute their own.
pub trait MessageTransport: Send + Sync + 'static {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
        timeout: Duration,
    ) -> SinkFuture<'a, (i32, i64)>;
}

impl MessageTransport for FutureProducer {
    fn send<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
        timeout: Duration,
    ) -> SinkFuture<'a, (i32, i64)> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).key(key).payload(payload);
            FutureProducer::send(self, record, timeout)
                .await
                .map_err(|(e, _msg)| ReplicationError::kafka("produce", e))
        })
    }
}

/// Anything the exporter can hand encoded records to.
pub trait Publisher: Send + Sync + 'static {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> SinkFuture<'a, Delivered>;

    fn stats(&self) -> &DeliveryStats;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DeliveryStats
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Running publish counters. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    inner: Arc<Counters>,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn succeeded(&self) -> u64 {
        self.inner.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StreamProducer
// ═══════════════════════════════════════════════════════════════════════════════

/// Where an acknowledged message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub partition: i32,
    pub offset: i64,
    pub attempts: u32,
}

/// rdkafka settings for an `acks=all` producer.
pub fn client_config(kafka: &KafkaConfig, producer: &ProducerConfig) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", &kafka.bootstrap_servers)
        .set("acks", &producer.acks)
        .set(
            "enable.idempotence",
            if producer.enable_idempotence { "true" } else { "false" },
        )
        .set(
            "message.timeout.ms",
            producer.message_timeout_duration().as_millis().to_string(),
        );
    cfg
}

/// Publishes records and tracks delivery outcomes.
pub struct StreamProducer<T: MessageTransport = FutureProducer> {
    transport: T,
    retry: RetryConfig,
    message_timeout: Duration,
    stats: DeliveryStats,
}

impl StreamProducer<FutureProducer> {
    /// Create an rdkafka-backed producer.
    pub fn new(kafka: &KafkaConfig, producer: &ProducerConfig) -> Result<Self> {
        let transport: FutureProducer = client_config(kafka, producer)
            .create()
            .map_err(|e| ReplicationError::kafka("create_producer", e))?;
        info!(
            bootstrap_servers = %kafka.bootstrap_servers,
            acks = %producer.acks,
            max_retries = producer.max_retries,
            "Producer created"
        );
        Ok(Self::with_transport(transport, producer))
    }

    /// Wait for queued messages to be delivered.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.transport
            .flush(timeout)
            .map_err(|e| ReplicationError::kafka("flush", e))
    }
}

impl<T: MessageTransport> StreamProducer<T> {
    pub fn with_transport(transport: T, config: &ProducerConfig) -> Self {
        let max_attempts = config.max_retries as usize + 1;
        Self {
            transport,
            retry: RetryConfig::fixed(max_attempts, config.retry_backoff_duration()),
            message_timeout: config.message_timeout_duration(),
            stats: DeliveryStats::new(),
        }
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send one message, retrying transient failures.
    pub async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivered> {
        let mut attempts_made = 0usize;
        let result = retry(&self.retry, "publish", |attempt| {
            attempts_made = attempt;
            if attempt > 1 {
                self.stats.record_retry();
            }
            self.transport
                .send(topic, key, payload, self.message_timeout)
        })
        .await;

        match result {
            Ok((partition, offset)) => {
                let attempts = attempts_made as u32;
                self.stats.record_success();
                metrics::record_publish(topic, true, attempts);
                debug!(topic, key, partition, offset, attempts, "Message delivered");
                Ok(Delivered {
                    partition,
                    offset,
                    attempts,
                })
            }
            Err(exhausted) => {
                let attempts = exhausted.attempts as u32;
                self.stats.record_failure();
                metrics::record_publish(topic, false, attempts);
                warn!(
                    topic,
                    key,
                    attempts,
                    error = %exhausted.last_error,
                    "Publish failed"
                );
                Err(ReplicationError::Publish {
                    key: key.to_string(),
                    attempts,
                    message: exhausted.last_error.to_string(),
                })
            }
        }
    }
}

impl<T: MessageTransport> Publisher for StreamProducer<T> {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> SinkFuture<'a, Delivered> {
        Box::pin(StreamProducer::publish(self, topic, key, payload))
    }

    fn stats(&self) -> &DeliveryStats {
        &self.stats
    }
}
