// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end pipeline tests without external services.
//!
//! Source store → SourceExporter → in-memory topic → ReplicaPipeline
//! (message handling, accumulator, flusher) → DualSinkWriter → two
//! in-memory replicas → ReconciliationEngine.
//!
//! Run with: `cargo test --test pipeline_tests`

mod common;

use common::{sample_records, MemoryStore, MemoryTopic};
use order_replication::config::{KafkaConfig, ReconcileConfig, ReferenceRange};
use order_replication::consumer::{handle_payload, MessageOutcome};
use order_replication::resilience::RetryConfig;
use order_replication::{
    BatchAccumulator, DualSinkWriter, ExportConfig, FlushPolicy, PipelineState, RecordStore,
    ReconciliationEngine, ReplicaPipeline, SourceExporter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type Writer = DualSinkWriter<MemoryStore, MemoryStore>;

fn replicas() -> (Arc<MemoryStore>, Arc<MemoryStore>, Arc<Writer>) {
    let pg = Arc::new(MemoryStore::new("postgres"));
    let my = Arc::new(MemoryStore::new("mysql"));
    let writer = Arc::new(DualSinkWriter::new(
        Arc::clone(&pg),
        Arc::clone(&my),
        RetryConfig::testing(),
    ));
    (pg, my, writer)
}

fn size_only_policy(max_batch_size: usize) -> FlushPolicy {
    FlushPolicy {
        max_batch_size,
        max_batch_delay: Duration::from_secs(30),
        poll_interval: Duration::from_millis(5),
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

/// Feed payloads like the consumer does, waiting for each full batch to be
/// drained before continuing, then park until shutdown.
async fn replay_feed(
    payloads: Vec<Vec<u8>>,
    accumulator: Arc<BatchAccumulator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let threshold = accumulator.threshold();
    for payload in payloads {
        if let MessageOutcome::Accumulated { pending } =
            handle_payload("replica-test", Some(&payload), &accumulator)
        {
            if pending >= threshold {
                let acc = Arc::clone(&accumulator);
                wait_until(move || acc.len() < threshold, Duration::from_secs(5)).await;
            }
        }
    }
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}

// =============================================================================
// Export → consume → replicate
// =============================================================================

#[tokio::test]
async fn full_replication_batches_by_size_and_drains_remainder() {
    let source = Arc::new(MemoryStore::with_records("source", &sample_records(2500)));
    let topic = Arc::new(MemoryTopic::new());

    let exporter = SourceExporter::new(
        Arc::clone(&source),
        Arc::clone(&topic),
        ExportConfig {
            page_size: 500,
            max_records: 10_000,
            ..ExportConfig::default()
        },
    );
    let summary = exporter.export_all().await.unwrap();
    assert_eq!(summary.records_read, 2500);
    assert_eq!(summary.published, 2500);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.pages, 5);
    assert_eq!(topic.len(), 2500);

    let (pg, my, writer) = replicas();
    let mut pipeline = ReplicaPipeline::new(
        "replica-test",
        KafkaConfig::for_testing("localhost:9092", "replica-test"),
        size_only_policy(1000),
        writer,
    );
    let payloads = topic.payloads();
    pipeline
        .start_with_feed(move |acc, rx| replay_feed(payloads, acc, rx))
        .await
        .unwrap();
    assert!(pipeline.is_running());

    let pg_watch = Arc::clone(&pg);
    assert!(wait_until(move || pg_watch.batch_sizes().len() == 2, Duration::from_secs(5)).await);

    pipeline.shutdown().await;
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    assert_eq!(pg.batch_sizes(), vec![1000, 1000, 500]);
    assert_eq!(my.batch_sizes(), vec![1000, 1000, 500]);

    let expected: Vec<i64> = (1..=2500).collect();
    assert_eq!(pg.order_ids(), expected);
    assert_eq!(my.order_ids(), expected);
    assert_eq!(pg.rows(), source.rows());
}

#[tokio::test]
async fn replicated_stores_reconcile_at_full_match() {
    let records = sample_records(300);
    let source: Arc<dyn RecordStore> = Arc::new(MemoryStore::with_records("source", &records));
    let topic = Arc::new(MemoryTopic::new());
    let exporter_source = Arc::new(MemoryStore::with_records("source", &records));
    SourceExporter::new(
        exporter_source,
        Arc::clone(&topic),
        ExportConfig {
            page_size: 100,
            ..ExportConfig::default()
        },
    )
    .export_all()
    .await
    .unwrap();

    let (pg, my, writer) = replicas();
    let mut pipeline = ReplicaPipeline::new(
        "replica-test",
        KafkaConfig::for_testing("localhost:9092", "replica-test"),
        size_only_policy(128),
        writer,
    );
    let payloads = topic.payloads();
    pipeline
        .start_with_feed(move |acc, rx| replay_feed(payloads, acc, rx))
        .await
        .unwrap();
    // Two full batches written, the tail still buffered.
    let acc = Arc::clone(pipeline.accumulator());
    let pg_watch = Arc::clone(&pg);
    assert!(
        wait_until(
            move || pg_watch.order_count() == 256 && acc.len() == 44,
            Duration::from_secs(5),
        )
        .await
    );
    pipeline.shutdown().await;

    let engine = ReconciliationEngine::new(
        source,
        vec![pg as Arc<dyn RecordStore>, my as Arc<dyn RecordStore>],
        &ReconcileConfig {
            reference_ranges: vec![
                ReferenceRange { offset: 0, limit: 150 },
                ReferenceRange { offset: 150, limit: 150 },
            ],
            replica_sample_size: 1000,
            ..ReconcileConfig::default()
        },
    );
    let report = engine.reconcile().await.unwrap();

    assert_eq!(report.reference_count, 300);
    for name in ["postgres", "mysql"] {
        let replica = report.replica(name).unwrap();
        assert_eq!(replica.candidate_count, 300);
        assert_eq!(replica.match_percentage, 100.0);
        assert!(replica.missing_records.is_empty());
    }
}

// =============================================================================
// Shutdown semantics
// =============================================================================

#[tokio::test]
async fn shutdown_drains_partial_batch() {
    let (pg, my, writer) = replicas();
    let mut pipeline = ReplicaPipeline::new(
        "replica-test",
        KafkaConfig::for_testing("localhost:9092", "replica-test"),
        size_only_policy(1000),
        writer,
    );
    let payloads = common::encode_all(&sample_records(42));
    pipeline
        .start_with_feed(move |acc, rx| replay_feed(payloads, acc, rx))
        .await
        .unwrap();

    let acc = Arc::clone(pipeline.accumulator());
    assert!(wait_until(move || acc.len() == 42, Duration::from_secs(5)).await);
    assert!(pg.batch_sizes().is_empty());

    pipeline.shutdown().await;

    assert_eq!(pg.batch_sizes(), vec![42]);
    assert_eq!(my.batch_sizes(), vec![42]);
    assert!(pipeline.accumulator().is_empty());
    assert_eq!(pipeline.status().await.flushes, 1);
}

#[tokio::test]
async fn records_added_during_shutdown_are_still_written() {
    let (pg, _my, writer) = replicas();
    let mut pipeline = ReplicaPipeline::new(
        "replica-test",
        KafkaConfig::for_testing("localhost:9092", "replica-test"),
        size_only_policy(1000),
        writer,
    );
    let payloads = common::encode_all(&sample_records(10));
    pipeline
        .start_with_feed(move |accumulator, mut shutdown_rx| async move {
            let _ = shutdown_rx.changed().await;
            // The consumer finishes its in-flight message after the signal.
            for payload in payloads {
                handle_payload("replica-test", Some(&payload), &accumulator);
            }
        })
        .await
        .unwrap();

    pipeline.shutdown().await;
    assert_eq!(pg.order_count(), 10);
}

#[tokio::test]
async fn interval_flush_writes_small_batches() {
    let (pg, _my, writer) = replicas();
    let mut pipeline = ReplicaPipeline::new(
        "replica-test",
        KafkaConfig::for_testing("localhost:9092", "replica-test"),
        FlushPolicy::testing(),
        writer,
    );
    let payloads = common::encode_all(&sample_records(3));
    pipeline
        .start_with_feed(move |acc, rx| replay_feed(payloads, acc, rx))
        .await
        .unwrap();

    let watched = Arc::clone(&pg);
    assert!(wait_until(move || watched.order_count() == 3, Duration::from_secs(2)).await);
    pipeline.shutdown().await;
    assert_eq!(pg.batch_sizes(), vec![3]);
}

#[tokio::test]
async fn flushes_never_overlap() {
    let pg = Arc::new(MemoryStore::new("postgres").with_write_delay(Duration::from_millis(30)));
    let my = Arc::new(MemoryStore::new("mysql"));
    let writer = Arc::new(DualSinkWriter::new(
        Arc::clone(&pg),
        Arc::clone(&my),
        RetryConfig::testing(),
    ));
    let mut pipeline = ReplicaPipeline::new(
        "replica-test",
        KafkaConfig::for_testing("localhost:9092", "replica-test"),
        FlushPolicy {
            max_batch_size: 10,
            max_batch_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
        },
        writer,
    );

    // Unthrottled feed: records keep arriving while slow flushes run.
    let payloads = common::encode_all(&sample_records(200));
    pipeline
        .start_with_feed(move |accumulator, mut shutdown_rx| async move {
            for payload in payloads {
                handle_payload("replica-test", Some(&payload), &accumulator);
                tokio::task::yield_now().await;
            }
            let _ = shutdown_rx.changed().await;
        })
        .await
        .unwrap();

    let watched = Arc::clone(&pg);
    wait_until(move || watched.order_count() > 0, Duration::from_secs(2)).await;
    pipeline.shutdown().await;

    // Every record lands exactly once and the flusher ran batches serially.
    let total: usize = pg.batch_sizes().iter().sum();
    assert_eq!(total, 200);
    assert_eq!(pg.order_count(), 200);
    assert_eq!(my.order_count(), 200);
    assert_eq!(pg.batch_sizes().len() as u64, pipeline.status().await.flushes);
}

#[tokio::test]
async fn pipeline_cannot_start_twice() {
    let (_pg, _my, writer) = replicas();
    let mut pipeline = ReplicaPipeline::new(
        "replica-test",
        KafkaConfig::for_testing("localhost:9092", "replica-test"),
        FlushPolicy::testing(),
        writer,
    );
    pipeline
        .start_with_feed(|_acc, mut rx| async move {
            let _ = rx.changed().await;
        })
        .await
        .unwrap();
    let second = pipeline
        .start_with_feed(|_acc, mut rx| async move {
            let _ = rx.changed().await;
        })
        .await;
    assert!(second.is_err());
    pipeline.shutdown().await;
}
