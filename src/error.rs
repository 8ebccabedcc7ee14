// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the order replication pipeline.
//!
//! Errors are categorized by their source (Kafka, replica stores, the source
//! store, the local cursor database) and carry enough context to tell which
//! side of the pipeline failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Kafka` | Yes | Broker connect/produce/consume failures |
//! | `Sink` | Yes | Replica store write failed (transaction rolled back) |
//! | `Source` | Yes | Source store read failed |
//! | `Cursor` | No | Local SQLite errors (needs operator attention) |
//! | `Codec` | No | Payload is not a valid order/payment record |
//! | `Publish` | No | Publish retries already exhausted |
//! | `DeadLetter` | No | Could not persist a failed batch locally |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Pipeline state machine violation |
//! | `Shutdown` | No | Pipeline is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Retryable errors are transient network or
//! availability issues; the rest are bugs, bad configuration or bad data.

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while exporting, replicating or reconciling.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Kafka client error.
    ///
    /// Occurs when creating clients, subscribing, consuming, committing or
    /// producing. Typically transient (broker restart, leader election).
    #[error("Kafka error ({operation}): {message}")]
    Kafka {
        operation: String,
        message: String,
        #[source]
        source: Option<KafkaError>,
    },

    /// Replica store write failure.
    ///
    /// The enclosing transaction has been rolled back, so the store is
    /// unchanged by the failed batch.
    #[error("Sink error ({store}): {message}")]
    Sink {
        store: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Source store read failure (export pages, reconciliation samples).
    #[error("Source store error: {0}")]
    Source(#[source] sqlx::Error),

    /// SQLite error during export cursor persistence.
    #[error("Cursor store error: {0}")]
    Cursor(#[from] sqlx::Error),

    /// Payload could not be encoded or decoded as an order/payment record.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A publish failed after every retry was spent.
    #[error("Publish of key {key} failed after {attempts} attempts: {message}")]
    Publish {
        key: String,
        attempts: u32,
        message: String,
    },

    /// A failed batch could not be written to the dead-letter directory.
    #[error("Dead letter write failed: {0}")]
    DeadLetter(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pipeline state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running pipeline).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Kafka error from a rdkafka error.
    pub fn kafka(operation: impl Into<String>, source: KafkaError) -> Self {
        Self::Kafka {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Kafka error without source.
    pub fn kafka_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kafka {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a sink error for the named store from a sqlx error.
    pub fn sink(store: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Sink {
            store: store.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a sink error without source.
    pub fn sink_msg(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sink {
            store: store.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kafka { .. } => true,
            Self::Sink { .. } => true,
            Self::Source(_) => true,
            Self::Cursor(_) => false,
            Self::Codec(_) => false,
            Self::Publish { .. } => false, // Retries already spent
            Self::DeadLetter(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<KafkaError> for ReplicationError {
    fn from(e: KafkaError) -> Self {
        Self::kafka("unknown", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
