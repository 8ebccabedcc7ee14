// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pages the source store onto the topic.
//!
//! ```text
//!   offset ──▶ fetch_page(offset, limit) ──▶ [r1, r2, ... rN]
//!                                              │ join_all (one publish each,
//!                                              │ optionally capped by a Bulkhead)
//!                                              ▼
//!                                      page barrier: every publish resolved
//!                                              │
//!                      cursor.set(offset + N) ◀┘ ──▶ next page
//! ```
//!
//! The run ends on an empty page or once `max_records` rows have been read.
//! Because the cursor only moves past fully attempted pages, an interrupted
//! export resumes at the first page that was not finished. A non-zero
//! `offset_start` overrides the stored cursor for partial re-exports.

use crate::config::ExportConfig;
use crate::cursor::{source_key, CursorStore};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::producer::Publisher;
use crate::record::{OrderPaymentRecord, RecordCodec};
use crate::resilience::Bulkhead;
use crate::sink::RecordStore;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Totals for one [`SourceExporter::export_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub start_offset: u64,
    pub pages: u64,
    pub records_read: u64,
    pub published: u64,
    pub failed: u64,
    /// First row not yet attempted.
    pub next_offset: u64,
}

/// Publish results for one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub published: u64,
    pub failed: u64,
}

/// Reads the source in pages and publishes every row.
pub struct SourceExporter<S: RecordStore, P: Publisher> {
    source: Arc<S>,
    publisher: Arc<P>,
    config: ExportConfig,
    source_key: String,
    cursor: Option<Arc<CursorStore>>,
    bulkhead: Option<Bulkhead>,
}

impl<S: RecordStore, P: Publisher> SourceExporter<S, P> {
    pub fn new(source: Arc<S>, publisher: Arc<P>, config: ExportConfig) -> Self {
        let bulkhead = config
            .max_concurrent_publishes
            .filter(|n| *n > 0)
            .map(Bulkhead::new);
        Self {
            source,
            publisher,
            source_key: source_key(&config.source_url),
            config,
            cursor: None,
            bulkhead,
        }
    }

    /// Resume from and record progress in `cursor`.
    pub fn with_cursor(mut self, cursor: Arc<CursorStore>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Arc<P> {
        &self.publisher
    }

    /// Where the next pass starts: `offset_start` if set, else the stored
    /// cursor, else zero.
    pub async fn start_offset(&self) -> u64 {
        if let Some(offset) = self.config.offset_start {
            return offset;
        }
        match &self.cursor {
            Some(cursor) => cursor
                .get(&self.source_key, &self.config.topic)
                .await
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Export pages until the source runs dry or `max_records` is reached.
    ///
    /// Publish failures are counted, not fatal; a source read failure ends the
    /// pass with an error, leaving the cursor at the last finished page.
    #[instrument(skip(self), fields(source = %self.source_key, topic = %self.config.topic))]
    pub async fn export_all(&self) -> Result<ExportSummary> {
        let start_offset = self.start_offset().await;
        let page_size = self.config.page_size.max(1) as u64;
        let mut summary = ExportSummary {
            start_offset,
            next_offset: start_offset,
            ..Default::default()
        };

        info!(
            start_offset,
            page_size,
            max_records = self.config.max_records,
            "Starting export"
        );

        loop {
            let remaining = self.config.max_records.saturating_sub(summary.records_read);
            if remaining == 0 {
                info!(max_records = self.config.max_records, "Record cap reached");
                break;
            }

            let page_start = Instant::now();
            let limit = page_size.min(remaining);
            let records = self.source.fetch_page(summary.next_offset, limit).await?;
            if records.is_empty() {
                debug!(offset = summary.next_offset, "Empty page, source exhausted");
                break;
            }

            let outcome = self.export_page(&records).await;
            let read = records.len() as u64;
            summary.pages += 1;
            summary.records_read += read;
            summary.published += outcome.published;
            summary.failed += outcome.failed;
            summary.next_offset += read;

            metrics::record_export_page(&self.config.topic, records.len(), page_start.elapsed());
            debug!(
                offset = summary.next_offset - read,
                records = read,
                published = outcome.published,
                failed = outcome.failed,
                "Page exported"
            );

            self.persist_cursor(summary.next_offset).await;
        }

        let stats = self.publisher.stats().snapshot();
        info!(
            pages = summary.pages,
            records_read = summary.records_read,
            published = summary.published,
            failed = summary.failed,
            next_offset = summary.next_offset,
            total_succeeded = stats.succeeded,
            total_failed = stats.failed,
            "Export finished"
        );
        Ok(summary)
    }

    /// Publish every record of one page concurrently and wait for all of them.
    pub async fn export_page(&self, records: &[OrderPaymentRecord]) -> PageOutcome {
        let mut outcome = PageOutcome::default();
        let mut encoded = Vec::with_capacity(records.len());
        for record in records {
            match RecordCodec::encode(record) {
                Ok(payload) => encoded.push((RecordCodec::key(record), payload)),
                Err(e) => {
                    warn!(order_id = record.order_id, error = %e, "Failed to encode record");
                    outcome.failed += 1;
                }
            }
        }

        let results = join_all(
            encoded
                .iter()
                .map(|(key, payload)| self.publish_one(key, payload)),
        )
        .await;

        for result in results {
            match result {
                Ok(()) => outcome.published += 1,
                Err(_) => outcome.failed += 1,
            }
        }
        outcome
    }

    async fn publish_one(&self, key: &str, payload: &[u8]) -> Result<()> {
        let _permit = match &self.bulkhead {
            Some(bulkhead) => Some(
                bulkhead
                    .acquire()
                    .await
                    .map_err(|e| ReplicationError::Internal(e.to_string()))?,
            ),
            None => None,
        };
        self.publisher
            .publish(&self.config.topic, key, payload)
            .await
            .map(|_| ())
    }

    async fn persist_cursor(&self, next_offset: u64) {
        let Some(cursor) = &self.cursor else {
            return;
        };
        if let Err(e) = cursor
            .set(&self.source_key, &self.config.topic, next_offset)
            .await
        {
            warn!(next_offset, error = %e, "Failed to persist export cursor");
        }
    }
}
