// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use order_replication::sink::{dedup_orders, dedup_payments, rows_per_statement, MAX_BIND_PARAMS};
use order_replication::{compare, BatchAccumulator, FlushPolicy, OrderPaymentRecord, RecordCodec};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

const ORDER_STATES: &[&str] = &["PENDING", "PAID", "SHIPPED", "CANCELLED"];
const PAYMENT_STATES: &[&str] = &["AUTHORIZED", "SETTLED", "REFUNDED"];

prop_compose! {
    fn arb_record()(
        order_id in 1i64..200,
        paid in any::<bool>(),
        order_state in prop::sample::select(ORDER_STATES),
        payment_state in prop::sample::select(PAYMENT_STATES),
        payment_offset in 0i64..3,
    ) -> OrderPaymentRecord {
        let mut record = if paid {
            OrderPaymentRecord::for_testing(order_id)
        } else {
            OrderPaymentRecord::for_testing_unpaid(order_id)
        };
        record.order_state = order_state.to_string();
        if paid {
            record.payment_id = Some(order_id * 10 + payment_offset);
            record.payment_state = Some(payment_state.to_string());
        }
        record
    }
}

fn arb_records(max: usize) -> impl Strategy<Value = Vec<OrderPaymentRecord>> {
    prop::collection::vec(arb_record(), 0..max)
}

// =============================================================================
// Comparison Properties
// =============================================================================

proptest! {
    /// Match percentage is always within [0, 100]
    #[test]
    fn match_percentage_bounded(reference in arb_records(60), candidate in arb_records(60)) {
        let result = compare(&reference, &candidate);
        prop_assert!(result.match_percentage >= 0.0);
        prop_assert!(result.match_percentage <= 100.0);
    }

    /// A non-empty set compared with itself matches fully with nothing missing
    #[test]
    fn identical_sets_match_fully(reference in prop::collection::vec(arb_record(), 1..60)) {
        let result = compare(&reference, &reference);
        prop_assert_eq!(result.match_percentage, 100.0);
        prop_assert!(result.missing_records.is_empty());
    }

    /// Missing records come from the reference and have no candidate order
    #[test]
    fn missing_records_are_reference_orders_absent_from_candidate(
        reference in arb_records(60),
        candidate in arb_records(60),
    ) {
        let result = compare(&reference, &candidate);
        let candidate_orders: HashSet<i64> = candidate.iter().map(|r| r.order_id).collect();

        prop_assert!(result.missing_records.len() <= reference.len());
        for missing in &result.missing_records {
            prop_assert!(reference.contains(missing));
            prop_assert!(!candidate_orders.contains(&missing.order_id));
        }
    }

    /// Every missing record lowers the match percentage
    #[test]
    fn missing_records_cap_match_percentage(
        reference in prop::collection::vec(arb_record(), 1..60),
        candidate in arb_records(60),
    ) {
        let result = compare(&reference, &candidate);
        let present = reference.len() - result.missing_records.len();
        let ceiling = 100.0 * present as f64 / reference.len() as f64;
        prop_assert!(result.match_percentage <= ceiling + 1e-9);
    }

    /// An empty reference always reports 0% and no missing records
    #[test]
    fn empty_reference_reports_zero(candidate in arb_records(60)) {
        let result = compare(&[], &candidate);
        prop_assert_eq!(result.match_percentage, 0.0);
        prop_assert!(result.missing_records.is_empty());
    }

    /// Candidate order does not affect the result
    #[test]
    fn comparison_ignores_candidate_order(
        reference in arb_records(40),
        candidate in arb_records(40),
    ) {
        let forward = compare(&reference, &candidate);
        let mut candidate = candidate;
        candidate.reverse();
        let backward = compare(&reference, &candidate);
        prop_assert_eq!(forward, backward);
    }
}

// =============================================================================
// In-Batch Dedup Properties
// =============================================================================

proptest! {
    /// Deduped orders have unique keys and cover every order in the batch
    #[test]
    fn dedup_orders_unique_and_complete(batch in arb_records(100)) {
        let deduped = dedup_orders(&batch);
        let ids: Vec<i64> = deduped.iter().map(|r| r.order_id).collect();
        let unique: HashSet<i64> = ids.iter().copied().collect();
        let expected: HashSet<i64> = batch.iter().map(|r| r.order_id).collect();

        prop_assert_eq!(ids.len(), unique.len());
        prop_assert_eq!(unique, expected);
    }

    /// The last record for each order wins
    #[test]
    fn dedup_orders_latest_wins(batch in arb_records(100)) {
        for kept in dedup_orders(&batch) {
            let last = batch.iter().rev().find(|r| r.order_id == kept.order_id).unwrap();
            prop_assert_eq!(kept, last);
        }
    }

    /// Deduped payments are unique, only come from paid records, and the last one wins
    #[test]
    fn dedup_payments_unique_and_latest(batch in arb_records(100)) {
        let payments = dedup_payments(&batch);
        let ids: HashSet<i64> = payments.iter().map(|p| p.payment_id).collect();
        let expected: HashSet<i64> = batch.iter().filter_map(|r| r.payment_id).collect();

        prop_assert_eq!(ids.len(), payments.len());
        prop_assert_eq!(ids, expected);
        for payment in payments {
            let last = batch
                .iter()
                .rev()
                .find(|r| r.payment_id == Some(payment.payment_id))
                .unwrap();
            prop_assert_eq!(payment.order_id, last.order_id);
            prop_assert_eq!(payment.payment_state, last.payment_state.as_deref());
        }
    }

    /// Statement chunks never exceed the bind parameter ceiling
    #[test]
    fn statement_chunks_fit_bind_limit(columns in 1usize..64) {
        let rows = rows_per_statement(columns);
        prop_assert!(rows >= 1);
        prop_assert!(rows * columns <= MAX_BIND_PARAMS);
    }
}

// =============================================================================
// Accumulator and Flush Policy Properties
// =============================================================================

proptest! {
    /// Drain returns everything added, in order, and leaves the buffer empty
    #[test]
    fn drain_returns_all_in_order(batch in arb_records(200), threshold in 1usize..64) {
        let accumulator = BatchAccumulator::new(threshold);
        for (i, record) in batch.iter().enumerate() {
            prop_assert_eq!(accumulator.add(record.clone()), i + 1);
        }
        let drained = accumulator.drain_and_reset();
        prop_assert_eq!(drained, batch);
        prop_assert!(accumulator.is_empty());
    }

    /// An empty buffer never triggers a flush; a full one always does
    #[test]
    fn flush_policy_thresholds(
        max_batch_size in 1usize..5000,
        pending in 0usize..10_000,
        elapsed_ms in 0u64..10_000,
    ) {
        let policy = FlushPolicy {
            max_batch_size,
            max_batch_delay: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
        };
        let due = policy.should_flush(pending, Duration::from_millis(elapsed_ms));
        if pending == 0 {
            prop_assert!(!due);
        } else if pending >= max_batch_size || elapsed_ms >= 5000 {
            prop_assert!(due);
        } else {
            prop_assert!(!due);
        }
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    /// Decoding arbitrary bytes never panics
    #[test]
    fn decode_arbitrary_bytes_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = RecordCodec::decode(&data);
    }

    /// Whitespace-only payloads are always skipped
    #[test]
    fn whitespace_payload_skipped(ws in "[ \t\r\n]{0,32}") {
        let decoded = RecordCodec::decode(ws.as_bytes()).unwrap();
        prop_assert_eq!(decoded, order_replication::Decoded::Skip);
    }

    /// Message key is the decimal order id
    #[test]
    fn key_is_order_id(record in arb_record()) {
        prop_assert_eq!(RecordCodec::key(&record), record.order_id.to_string());
    }
}
