// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica reconciliation.
//!
//! Two measures are reported per replica, on purpose with different keys:
//!
//! - **match percentage**: share of reference records whose
//!   `(order_id, payment_id, order_state, payment_state)` tuple appears in
//!   the replica. A record that exists but lags behind counts as a mismatch.
//! - **missing records**: reference records whose `order_id` does not appear
//!   in the replica at all.
//!
//! A replica can therefore score below 100% with nothing missing ("present
//! but differs"), which is the distinction the report exists to surface.

use crate::config::{ReconcileConfig, ReferenceRange};
use crate::error::Result;
use crate::metrics;
use crate::record::OrderPaymentRecord;
use crate::sink::RecordStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

/// Fields two records must share to count as a match.
type MatchKey<'a> = (i64, Option<i64>, &'a str, Option<&'a str>);

fn match_key(record: &OrderPaymentRecord) -> MatchKey<'_> {
    (
        record.order_id,
        record.payment_id,
        record.order_state.as_str(),
        record.payment_state.as_deref(),
    )
}

/// Result of comparing one candidate set against the reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    /// `100 * matching / reference`, or 0 for an empty reference.
    pub match_percentage: f64,
    /// Reference records with no candidate row for their `order_id`.
    pub missing_records: Vec<OrderPaymentRecord>,
}

/// Compare `candidate` against `reference`.
pub fn compare(
    reference: &[OrderPaymentRecord],
    candidate: &[OrderPaymentRecord],
) -> ComparisonResult {
    if reference.is_empty() {
        return ComparisonResult {
            match_percentage: 0.0,
            missing_records: Vec::new(),
        };
    }

    let candidate_keys: HashSet<MatchKey<'_>> = candidate.iter().map(match_key).collect();
    let candidate_orders: HashSet<i64> = candidate.iter().map(|r| r.order_id).collect();

    let matching = reference
        .iter()
        .filter(|r| candidate_keys.contains(&match_key(r)))
        .count();
    let missing_records = reference
        .iter()
        .filter(|r| !candidate_orders.contains(&r.order_id))
        .cloned()
        .collect();

    ComparisonResult {
        match_percentage: 100.0 * matching as f64 / reference.len() as f64,
        missing_records,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Comparison of one replica topology.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaReport {
    pub name: String,
    pub candidate_count: usize,
    pub match_percentage: f64,
    pub missing_records: Vec<OrderPaymentRecord>,
}

/// Body returned at the reconciliation boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub generated_at: DateTime<Utc>,
    pub reference_count: usize,
    pub replicas: Vec<ReplicaReport>,
}

impl ReconciliationReport {
    pub fn replica(&self, name: &str) -> Option<&ReplicaReport> {
        self.replicas.iter().find(|r| r.name == name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetches the reference set and every replica, then compares them.
pub struct ReconciliationEngine {
    source: Arc<dyn RecordStore>,
    replicas: Vec<Arc<dyn RecordStore>>,
    reference_ranges: Vec<ReferenceRange>,
    replica_sample_size: u64,
}

impl ReconciliationEngine {
    pub fn new(
        source: Arc<dyn RecordStore>,
        replicas: Vec<Arc<dyn RecordStore>>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            source,
            replicas,
            reference_ranges: config.reference_ranges.clone(),
            replica_sample_size: config.replica_sample_size,
        }
    }

    /// Source rows from every configured range, concatenated.
    pub async fn fetch_reference(&self) -> Result<Vec<OrderPaymentRecord>> {
        let mut reference = Vec::new();
        for range in &self.reference_ranges {
            let page = self.source.fetch_page(range.offset, range.limit).await?;
            reference.extend(page);
        }
        Ok(reference)
    }

    /// Build the full report. Any store read failure fails the whole report.
    #[instrument(skip(self), fields(replicas = self.replicas.len()))]
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let reference = self.fetch_reference().await?;

        let fetched = join_all(
            self.replicas
                .iter()
                .map(|replica| replica.fetch_page(0, self.replica_sample_size)),
        )
        .await;

        let mut replicas = Vec::with_capacity(self.replicas.len());
        for (replica, candidate) in self.replicas.iter().zip(fetched) {
            let candidate = candidate?;
            let result = compare(&reference, &candidate);

            metrics::set_match_percentage(replica.name(), result.match_percentage);
            metrics::set_missing_records(replica.name(), result.missing_records.len());
            info!(
                replica = replica.name(),
                reference = reference.len(),
                candidate = candidate.len(),
                match_percentage = result.match_percentage,
                missing = result.missing_records.len(),
                "Replica compared"
            );

            replicas.push(ReplicaReport {
                name: replica.name().to_string(),
                candidate_count: candidate.len(),
                match_percentage: result.match_percentage,
                missing_records: result.missing_records,
            });
        }

        Ok(ReconciliationReport {
            generated_at: Utc::now(),
            reference_count: reference.len(),
            replicas,
        })
    }
}
