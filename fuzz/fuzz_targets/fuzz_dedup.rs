// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fuzz target for in-batch deduplication.
//!
//! Each output key is unique, every input key survives, and the surviving
//! row is the last one for its key.

#![no_main]

use libfuzzer_sys::fuzz_target;
use order_replication::sink::{dedup_orders, dedup_payments};
use order_replication::OrderPaymentRecord;
use std::collections::{HashMap, HashSet};

fuzz_target!(|data: &[u8]| {
    // Two bytes per record: order id, then payment id (0 means unpaid).
    // Small key spaces force collisions.
    let batch: Vec<OrderPaymentRecord> = data
        .chunks_exact(2)
        .enumerate()
        .map(|(position, pair)| {
            let order_id = i64::from(pair[0] % 16);
            let mut record = OrderPaymentRecord::for_testing(order_id);
            record.order_state = position.to_string();
            match pair[1] % 8 {
                0 => {
                    record.payment_id = None;
                    record.payment_date = None;
                    record.payment_amount = None;
                    record.payment_method = None;
                    record.payment_state = None;
                }
                p => {
                    record.payment_id = Some(i64::from(p));
                    record.payment_state = Some(position.to_string());
                }
            }
            record
        })
        .collect();

    let mut last_order = HashMap::new();
    let mut last_payment = HashMap::new();
    for (position, record) in batch.iter().enumerate() {
        last_order.insert(record.order_id, position.to_string());
        if let Some(payment_id) = record.payment_id {
            last_payment.insert(payment_id, position.to_string());
        }
    }

    let orders = dedup_orders(&batch);
    let order_ids: HashSet<i64> = orders.iter().map(|r| r.order_id).collect();
    assert_eq!(order_ids.len(), orders.len());
    assert_eq!(orders.len(), last_order.len());
    for record in &orders {
        assert_eq!(Some(&record.order_state), last_order.get(&record.order_id));
    }

    let payments = dedup_payments(&batch);
    let payment_ids: HashSet<i64> = payments.iter().map(|p| p.payment_id).collect();
    assert_eq!(payment_ids.len(), payments.len());
    assert_eq!(payments.len(), last_payment.len());
    for payment in &payments {
        assert_eq!(
            payment.payment_state.map(str::to_string).as_ref(),
            last_payment.get(&payment.payment_id)
        );
    }
});
