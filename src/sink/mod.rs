// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational stores: replica writes and paged reads.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────┐
//!   batch ─────────▶ │  DualSinkWriter  │──── retry ──▶ dead letter
//!                    └───────┬──────────┘
//!                 tokio::join!│
//!             ┌───────────────┴──────────────┐
//!             ▼                              ▼
//!     ┌───────────────┐              ┌───────────────┐
//!     │ PostgresStore │              │  MySqlStore   │
//!     │ ON CONFLICT   │              │ ON DUPLICATE  │
//!     │   DO UPDATE   │              │  KEY UPDATE   │
//!     └───────────────┘              └───────────────┘
//! ```
//!
//! Both stores implement [`ReplicaSink`] (transactional bulk upsert) and
//! [`RecordStore`] (ordered `orders LEFT JOIN payments` pages), so the same
//! types serve as export source, replica and reconciliation input.
//!
//! Logical schema, identical in both stores:
//!
//! ```text
//! orders(order_id PK, customer_id, order_date, total_amount, state)
//! payments(payment_id PK, order_id, payment_date, payment_amount, payment_method, state)
//! ```

mod dual;
mod mysql;
mod postgres;

pub use dual::{DualSinkWriter, DualWriteOutcome, StoreOutcome};
pub use mysql::MySqlStore;
pub use postgres::PostgresStore;

use crate::error::Result;
use crate::record::{OrderPaymentRecord, PaymentFacet};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A replica that accepts batches.
///
/// `write_batch` must be atomic per call: either every order row and every
/// present payment row is upserted, or the store is left unchanged.
pub trait ReplicaSink: Send + Sync + 'static {
    /// Label used in logs, metrics and dead-letter file names.
    fn name(&self) -> &str;

    /// Upsert the batch in one transaction. Returns the order rows written
    /// after in-batch dedup.
    fn write_batch<'a>(&'a self, batch: &'a [OrderPaymentRecord]) -> SinkFuture<'a, usize>;
}

/// A store that can be read page by page in `order_id` order.
pub trait RecordStore: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Rows `offset..offset + limit` of `orders LEFT JOIN payments`.
    fn fetch_page(&self, offset: u64, limit: u64) -> SinkFuture<'_, Vec<OrderPaymentRecord>>;
}

/// Bind parameter ceiling shared by Postgres and MySQL prepared statements.
pub const MAX_BIND_PARAMS: usize = 65_535;

pub(crate) const ORDER_COLUMNS: usize = 5;
pub(crate) const PAYMENT_COLUMNS: usize = 6;

/// Rows that fit in one multi-row statement with `columns` binds per row.
pub fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// Last occurrence of each `order_id`, in stream order.
///
/// A multi-row upsert must not touch the same key twice, and the later
/// record is the one that wins.
pub fn dedup_orders(batch: &[OrderPaymentRecord]) -> Vec<&OrderPaymentRecord> {
    let mut seen = HashSet::with_capacity(batch.len());
    let mut latest: Vec<&OrderPaymentRecord> = batch
        .iter()
        .rev()
        .filter(|r| seen.insert(r.order_id))
        .collect();
    latest.reverse();
    latest
}

/// Last occurrence of each `payment_id` among records that have a payment.
pub fn dedup_payments(batch: &[OrderPaymentRecord]) -> Vec<PaymentFacet<'_>> {
    let mut seen = HashSet::with_capacity(batch.len());
    let mut latest: Vec<PaymentFacet<'_>> = batch
        .iter()
        .rev()
        .filter_map(OrderPaymentRecord::payment)
        .filter(|p| seen.insert(p.payment_id))
        .collect();
    latest.reverse();
    latest
}

/// Convert a row count argument for a `LIMIT`/`OFFSET` bind.
pub(crate) fn as_bind(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
