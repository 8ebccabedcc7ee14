// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory stand-ins for the relational stores and the topic.
//!
//! [`MemoryStore`] follows the replica contract: a batch is upserted as a
//! whole or not at all, later rows overwrite earlier ones, and pages come
//! back as `orders LEFT JOIN payments` in `order_id` order.

use order_replication::producer::{Delivered, DeliveryStats, Publisher};
use order_replication::sink::{RecordStore, ReplicaSink, SinkFuture};
use order_replication::{OrderPaymentRecord, RecordCodec, ReplicationError};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct PaymentRow {
    order_id: i64,
    payment_date: Option<chrono::NaiveDateTime>,
    payment_amount: Option<rust_decimal::Decimal>,
    payment_method: Option<String>,
    state: Option<String>,
}

#[derive(Default)]
struct Tables {
    orders: BTreeMap<i64, OrderPaymentRecord>,
    payments: BTreeMap<i64, PaymentRow>,
}

/// Replica/source store held in memory.
pub struct MemoryStore {
    name: String,
    tables: Mutex<Tables>,
    fail_remaining: AtomicUsize,
    write_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    write_delay: Duration,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: Mutex::new(Tables::default()),
            fail_remaining: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            write_delay: Duration::ZERO,
        }
    }

    /// A store pre-loaded with `records`, e.g. as an export source.
    pub fn with_records(name: &str, records: &[OrderPaymentRecord]) -> Self {
        let store = Self::new(name);
        store.apply(records);
        store
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Fail the next `n` batch writes.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every batch write until [`recover`](Self::recover).
    pub fn fail_always(&self) {
        self.fail_remaining.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.fail_remaining.store(0, Ordering::SeqCst);
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Sizes of the batches that were committed.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn order_ids(&self) -> Vec<i64> {
        self.tables.lock().unwrap().orders.keys().copied().collect()
    }

    pub fn order_count(&self) -> usize {
        self.tables.lock().unwrap().orders.len()
    }

    pub fn payment_count(&self) -> usize {
        self.tables.lock().unwrap().payments.len()
    }

    pub fn order(&self, order_id: i64) -> Option<OrderPaymentRecord> {
        self.rows().into_iter().find(|r| r.order_id == order_id)
    }

    /// Every joined row, in page order.
    pub fn rows(&self) -> Vec<OrderPaymentRecord> {
        let tables = self.tables.lock().unwrap();
        let mut rows = Vec::new();
        for order in tables.orders.values() {
            let mut payments: Vec<(&i64, &PaymentRow)> = tables
                .payments
                .iter()
                .filter(|(_, p)| p.order_id == order.order_id)
                .collect();
            payments.sort_by_key(|(id, _)| **id);

            if payments.is_empty() {
                rows.push(OrderPaymentRecord {
                    payment_id: None,
                    payment_date: None,
                    payment_amount: None,
                    payment_method: None,
                    payment_state: None,
                    ..order.clone()
                });
            }
            for (payment_id, p) in payments {
                rows.push(OrderPaymentRecord {
                    payment_id: Some(*payment_id),
                    payment_date: p.payment_date,
                    payment_amount: p.payment_amount,
                    payment_method: p.payment_method.clone(),
                    payment_state: p.state.clone(),
                    ..order.clone()
                });
            }
        }
        rows
    }

    fn apply(&self, batch: &[OrderPaymentRecord]) {
        let mut tables = self.tables.lock().unwrap();
        for record in batch {
            tables.orders.insert(record.order_id, record.clone());
            if let Some(payment_id) = record.payment_id {
                tables.payments.insert(
                    payment_id,
                    PaymentRow {
                        order_id: record.order_id,
                        payment_date: record.payment_date,
                        payment_amount: record.payment_amount,
                        payment_method: record.payment_method.clone(),
                        state: record.payment_state.clone(),
                    },
                );
            }
        }
    }
}

impl ReplicaSink for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_batch<'a>(&'a self, batch: &'a [OrderPaymentRecord]) -> SinkFuture<'a, usize> {
        Box::pin(async move {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }

            let failing = self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                })
                .is_ok();
            if failing {
                return Err(ReplicationError::sink_msg(self.name.as_str(), "injected failure"));
            }

            self.apply(batch);
            self.batch_sizes.lock().unwrap().push(batch.len());
            let distinct: HashSet<i64> = batch.iter().map(|r| r.order_id).collect();
            Ok(distinct.len())
        })
    }
}

impl RecordStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_page(&self, offset: u64, limit: u64) -> SinkFuture<'_, Vec<OrderPaymentRecord>> {
        Box::pin(async move {
            Ok(self
                .rows()
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect())
        })
    }
}

/// Topic held in memory: every accepted publish is appended in arrival order.
#[derive(Default)]
pub struct MemoryTopic {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    fail_keys: Mutex<HashSet<String>>,
    stats: DeliveryStats,
}

impl MemoryTopic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish for `key`.
    pub fn fail_key(&self, key: &str) {
        self.fail_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Append raw payloads, as an upstream producer might.
    pub fn push_raw(&self, key: &str, payload: &[u8]) {
        self.messages
            .lock()
            .unwrap()
            .push((key.to_string(), payload.to_vec()));
    }
}

impl Publisher for MemoryTopic {
    fn publish<'a>(
        &'a self,
        _topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> SinkFuture<'a, Delivered> {
        Box::pin(async move {
            if self.fail_keys.lock().unwrap().contains(key) {
                self.stats.record_failure();
                return Err(ReplicationError::Publish {
                    key: key.to_string(),
                    attempts: 1,
                    message: "broker rejected".to_string(),
                });
            }
            let offset = {
                let mut messages = self.messages.lock().unwrap();
                messages.push((key.to_string(), payload.to_vec()));
                messages.len() as i64 - 1
            };
            self.stats.record_success();
            Ok(Delivered {
                partition: 0,
                offset,
                attempts: 1,
            })
        })
    }

    fn stats(&self) -> &DeliveryStats {
        &self.stats
    }
}

/// Records `1..=n`, alternating paid and unpaid orders.
pub fn sample_records(n: i64) -> Vec<OrderPaymentRecord> {
    (1..=n)
        .map(|id| {
            if id % 3 == 0 {
                OrderPaymentRecord::for_testing_unpaid(id)
            } else {
                OrderPaymentRecord::for_testing(id)
            }
        })
        .collect()
}

pub fn encode_all(records: &[OrderPaymentRecord]) -> Vec<Vec<u8>> {
    records
        .iter()
        .map(|r| RecordCodec::encode(r).unwrap())
        .collect()
}
