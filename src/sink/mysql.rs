// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MySQL replica store.

use super::{
    as_bind, dedup_orders, dedup_payments, rows_per_statement, RecordStore, ReplicaSink,
    SinkFuture, ORDER_COLUMNS, PAYMENT_COLUMNS,
};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::record::{OrderPaymentRecord, PaymentFacet};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, MySqlConnection, QueryBuilder};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

const PAGE_QUERY: &str = r#"
SELECT o.order_id, o.customer_id, o.order_date, o.total_amount, o.state AS order_state,
       p.payment_id, p.payment_date, p.payment_amount, p.payment_method, p.state AS payment_state
FROM orders o
LEFT JOIN payments p ON o.order_id = p.order_id
ORDER BY o.order_id, p.payment_id
LIMIT ? OFFSET ?
"#;

// Upserts use the row-alias form, which needs MySQL 8.0.19 or later.
pub(crate) fn orders_upsert<'a>(rows: &[&'a OrderPaymentRecord]) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO orders (order_id, customer_id, order_date, total_amount, state) ",
    );
    qb.push_values(rows.iter().copied(), |mut b, r| {
        b.push_bind(r.order_id)
            .push_bind(r.customer_id)
            .push_bind(r.order_date)
            .push_bind(r.total_amount)
            .push_bind(r.order_state.as_str());
    });
    qb.push(
        " AS incoming ON DUPLICATE KEY UPDATE \
         customer_id = incoming.customer_id, \
         order_date = incoming.order_date, \
         total_amount = incoming.total_amount, \
         state = incoming.state",
    );
    qb
}

pub(crate) fn payments_upsert<'a>(rows: &[PaymentFacet<'a>]) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO payments (payment_id, order_id, payment_date, payment_amount, payment_method, state) ",
    );
    qb.push_values(rows.iter().copied(), |mut b, p| {
        b.push_bind(p.payment_id)
            .push_bind(p.order_id)
            .push_bind(p.payment_date)
            .push_bind(p.payment_amount)
            .push_bind(p.payment_method)
            .push_bind(p.payment_state);
    });
    qb.push(
        " AS incoming ON DUPLICATE KEY UPDATE \
         order_id = incoming.order_id, \
         payment_date = incoming.payment_date, \
         payment_amount = incoming.payment_amount, \
         payment_method = incoming.payment_method, \
         state = incoming.state",
    );
    qb
}

/// MySQL-backed order/payment store.
#[derive(Debug, Clone)]
pub struct MySqlStore {
    name: String,
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(name: impl Into<String>, url: &str, max_connections: u32) -> Result<Self> {
        let name = name.into();
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| ReplicationError::sink(name.clone(), e))?;
        debug!(store = %name, "Connected to MySQL");
        Ok(Self { name, pool })
    }

    pub fn from_pool(name: impl Into<String>, pool: MySqlPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn apply(
        conn: &mut MySqlConnection,
        orders: &[&OrderPaymentRecord],
        payments: &[PaymentFacet<'_>],
    ) -> std::result::Result<(), sqlx::Error> {
        for chunk in orders.chunks(rows_per_statement(ORDER_COLUMNS)) {
            orders_upsert(chunk).build().execute(&mut *conn).await?;
        }
        for chunk in payments.chunks(rows_per_statement(PAYMENT_COLUMNS)) {
            payments_upsert(chunk).build().execute(&mut *conn).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, batch), fields(store = %self.name, batch_size = batch.len()))]
    async fn upsert(&self, batch: &[OrderPaymentRecord]) -> Result<usize> {
        let orders = dedup_orders(batch);
        let payments = dedup_payments(batch);
        if orders.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReplicationError::sink(self.name.as_str(), e))?;

        let outcome = match Self::apply(&mut tx, &orders, &payments).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(store = %self.name, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        };

        metrics::record_sink_write(&self.name, outcome.is_ok(), orders.len(), start.elapsed());
        outcome.map_err(|e| ReplicationError::sink(self.name.as_str(), e))?;

        debug!(
            orders = orders.len(),
            payments = payments.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch committed"
        );
        Ok(orders.len())
    }

    async fn page(&self, offset: u64, limit: u64) -> Result<Vec<OrderPaymentRecord>> {
        sqlx::query_as::<_, OrderPaymentRecord>(PAGE_QUERY)
            .bind(as_bind(limit))
            .bind(as_bind(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(ReplicationError::Source)
    }
}

impl ReplicaSink for MySqlStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_batch<'a>(&'a self, batch: &'a [OrderPaymentRecord]) -> SinkFuture<'a, usize> {
        Box::pin(self.upsert(batch))
    }
}

impl RecordStore for MySqlStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_page(&self, offset: u64, limit: u64) -> SinkFuture<'_, Vec<OrderPaymentRecord>> {
        Box::pin(self.page(offset, limit))
    }
}
