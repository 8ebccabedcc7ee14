// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Order Replication
//!
//! Replicates order/payment records from a source database, through a Kafka
//! topic, into pairs of relational replicas, then measures how far each
//! replica has drifted from the source.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  pages   ┌────────────────┐  acks=all  ┌───────────────────┐
//! │ source DB  │────────► │ SourceExporter │──────────► │  order_payment    │
//! │ (Postgres) │          │ + CursorStore  │            │  topic            │
//! └────────────┘          └────────────────┘            └─────────┬─────────┘
//!       │                                                         │ consumer group(s)
//!       │                                              ┌──────────▼──────────┐
//!       │                                              │   ReplicaPipeline   │
//!       │                                              │ StreamConsumer      │
//!       │                                              │  → BatchAccumulator │
//!       │                                              │  → BatchFlusher     │
//!       │                                              └──────────┬──────────┘
//!       │                                                         │ DualSinkWriter
//!       │                                              ┌──────────▼──────────┐
//!       │                                              │ Postgres │  MySQL   │
//!       │                                              └──────────┬──────────┘
//!       │           ┌──────────────────────┐                      │
//!       └─────────► │ ReconciliationEngine │ ◄────────────────────┘
//!                   └──────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! At-least-once end to end: the consumer commits an offset only after the
//! record is buffered, replicas are written with idempotent upserts, and a
//! store that keeps failing gets its batch dead-lettered instead of blocking
//! the other store.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use order_replication::{
//!     DualSinkWriter, MySqlStore, PostgresStore, ReplicaPipeline, ReplicationConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> order_replication::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let pg = PostgresStore::connect("postgres", &config.sinks.postgres_url, 5).await?;
//!     let my = MySqlStore::connect("mysql", &config.sinks.mysql_url, 5).await?;
//!     let writer = DualSinkWriter::new(Arc::new(pg), Arc::new(my), config.sinks.write_retry.retry_config());
//!
//!     let mut pipeline = ReplicaPipeline::from_config(&config, Arc::new(writer));
//!     pipeline.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod cursor;
pub mod dead_letter;
pub mod error;
pub mod exporter;
pub mod metrics;
pub mod producer;
pub mod reconcile;
pub mod record;
pub mod resilience;
pub mod sink;

// Re-exports for convenience
pub use batch::{BatchAccumulator, BatchFlusher, BatchResult, BatchSink, FlushPolicy, FlushTrigger};
pub use config::{
    BatchConfig, ExportConfig, KafkaConfig, ProducerConfig, ReconcileConfig, ReplicationConfig,
    SinkConfig,
};
pub use consumer::StreamConsumer;
pub use coordinator::{PipelineState, PipelineStatus, ReplicaPipeline};
pub use cursor::CursorStore;
pub use dead_letter::DeadLetterQueue;
pub use error::{ReplicationError, Result};
pub use exporter::{ExportSummary, SourceExporter};
pub use producer::{DeliverySnapshot, DeliveryStats, Publisher, StreamProducer};
pub use reconcile::{compare, ComparisonResult, ReconciliationEngine, ReconciliationReport};
pub use record::{Decoded, OrderPaymentRecord, RecordCodec};
pub use sink::{DualSinkWriter, MySqlStore, PostgresStore, RecordStore, ReplicaSink};
