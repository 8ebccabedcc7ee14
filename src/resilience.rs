// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry for store writes and publishes, plus a concurrency cap for
//! export fan-out.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), order_replication::resilience::RetriesExhausted> {
//! use order_replication::resilience::{retry, RetryConfig};
//! use std::time::Duration;
//!
//! let policy = RetryConfig::fixed(4, Duration::from_secs(1));
//! let offset = retry(&policy, "produce", |attempt| async move {
//!     println!("attempt {}", attempt);
//!     Ok::<_, order_replication::ReplicationError>(42)
//! })
//! .await?;
//! # let _ = offset;
//! # Ok(())
//! # }
//! ```

use crate::error::ReplicationError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Retry behavior for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry, 1.0 = fixed).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryConfig {
    /// Fixed backoff: the same delay between every attempt.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
        }
    }

    /// Three quick attempts, for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Sleep after the 1-indexed `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let retries_so_far = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(retries_so_far);
        if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_delay
        }
    }
}

/// All attempts of a retried operation failed.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last_error}")]
pub struct RetriesExhausted {
    pub attempts: usize,
    #[source]
    pub last_error: ReplicationError,
}

/// Run `op` until it succeeds, returns a non-retryable error, or the attempt
/// budget is spent. `op` receives the 1-indexed attempt number.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T, RetriesExhausted>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = crate::error::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => {
                return Err(RetriesExhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// The bulkhead's semaphore was closed while waiting.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed ({limit} slots)")]
pub struct BulkheadClosed {
    pub limit: usize,
}

/// Caps how many operations run at once.
///
/// The exporter holds one permit per in-flight publish when
/// `export.max_concurrent_publishes` is set.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    limit: usize,
}

impl Bulkhead {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadClosed> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed { limit: self.limit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.limit - self.slots.available_permits()
    }
}
