// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Writes each batch to two independent replicas.
//!
//! The two stores are written concurrently and never chained: a failure in
//! one has no effect on the other. Each store gets its own retry budget;
//! a batch that exhausts it goes to the dead-letter directory for that store
//! (or is logged as lost when none is configured).

use super::ReplicaSink;
use crate::batch::{BatchResult, BatchSink};
use crate::dead_letter::DeadLetterQueue;
use crate::metrics;
use crate::record::OrderPaymentRecord;
use crate::resilience::{retry, RetryConfig};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, instrument};

/// What happened to a batch in one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Committed. `rows` is the order rows upserted after in-batch dedup.
    Written { rows: usize, attempts: usize },
    /// Every attempt failed; the batch was saved for replay.
    DeadLettered {
        attempts: usize,
        path: PathBuf,
        error: String,
    },
    /// Every attempt failed and the batch could not be saved.
    Failed { attempts: usize, error: String },
}

impl StoreOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    pub fn attempts(&self) -> usize {
        match self {
            Self::Written { attempts, .. }
            | Self::DeadLettered { attempts, .. }
            | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Per-store outcomes of one [`DualSinkWriter::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualWriteOutcome {
    pub total: usize,
    pub primary: StoreOutcome,
    pub secondary: StoreOutcome,
}

impl DualWriteOutcome {
    pub fn is_success(&self) -> bool {
        self.primary.is_written() && self.secondary.is_written()
    }
}

impl From<DualWriteOutcome> for BatchResult {
    fn from(outcome: DualWriteOutcome) -> Self {
        let mut result = BatchResult {
            total: outcome.total,
            ..Default::default()
        };
        for store in [&outcome.primary, &outcome.secondary] {
            match store {
                StoreOutcome::Written { .. } => result.stores_written += 1,
                StoreOutcome::DeadLettered { .. } => {
                    result.stores_failed += 1;
                    result.dead_lettered += 1;
                }
                StoreOutcome::Failed { .. } => result.stores_failed += 1,
            }
        }
        result
    }
}

/// Applies batches to two replica stores.
pub struct DualSinkWriter<A: ReplicaSink, B: ReplicaSink> {
    primary: Arc<A>,
    secondary: Arc<B>,
    retry: RetryConfig,
    dead_letter: Option<DeadLetterQueue>,
}

impl<A: ReplicaSink, B: ReplicaSink> DualSinkWriter<A, B> {
    pub fn new(primary: Arc<A>, secondary: Arc<B>, retry: RetryConfig) -> Self {
        Self {
            primary,
            secondary,
            retry,
            dead_letter: None,
        }
    }

    /// Save batches that exhaust their retries under `queue`.
    pub fn with_dead_letter(mut self, queue: DeadLetterQueue) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    pub fn primary(&self) -> &Arc<A> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<B> {
        &self.secondary
    }

    /// Write `batch` to both stores concurrently.
    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    pub async fn write(&self, batch: &[OrderPaymentRecord]) -> DualWriteOutcome {
        let (primary, secondary) = tokio::join!(
            self.write_store(self.primary.as_ref(), batch),
            self.write_store(self.secondary.as_ref(), batch),
        );
        DualWriteOutcome {
            total: batch.len(),
            primary,
            secondary,
        }
    }

    async fn write_store<S: ReplicaSink>(
        &self,
        store: &S,
        batch: &[OrderPaymentRecord],
    ) -> StoreOutcome {
        let name = store.name();
        let mut attempts_made = 0;
        let result = retry(&self.retry, name, |attempt| {
            attempts_made = attempt;
            if attempt > 1 {
                metrics::record_sink_retry(name);
            }
            store.write_batch(batch)
        })
        .await;

        let exhausted = match result {
            Ok(rows) => {
                return StoreOutcome::Written {
                    rows,
                    attempts: attempts_made,
                }
            }
            Err(exhausted) => exhausted,
        };
        let attempts = exhausted.attempts;
        let error = exhausted.last_error.to_string();

        let Some(queue) = &self.dead_letter else {
            metrics::record_dropped_records(name, batch.len());
            error!(
                store = name,
                records = batch.len(),
                attempts,
                error = %error,
                "Batch write failed and no dead letter directory is configured; records lost for this store"
            );
            return StoreOutcome::Failed { attempts, error };
        };

        match queue.persist(name, batch).await {
            Ok(path) => {
                error!(
                    store = name,
                    records = batch.len(),
                    attempts,
                    error = %error,
                    path = %path.display(),
                    "Batch write failed, dead-lettered"
                );
                StoreOutcome::DeadLettered {
                    attempts,
                    path,
                    error,
                }
            }
            Err(dlq_err) => {
                metrics::record_dropped_records(name, batch.len());
                error!(
                    store = name,
                    records = batch.len(),
                    attempts,
                    error = %error,
                    dead_letter_error = %dlq_err,
                    "Batch write failed and dead letter write failed; records lost for this store"
                );
                StoreOutcome::Failed {
                    attempts,
                    error: format!("{}; dead letter: {}", error, dlq_err),
                }
            }
        }
    }
}

impl<A: ReplicaSink, B: ReplicaSink> BatchSink for DualSinkWriter<A, B> {
    fn write_batch(&self, batch: Vec<OrderPaymentRecord>) -> BoxFuture<'_, BatchResult> {
        Box::pin(async move { self.write(&batch).await.into() })
    }
}
