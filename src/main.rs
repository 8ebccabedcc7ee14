// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `order-replicator` command line.
//!
//! ```text
//! order-replicator --config replication.json consume
//! order-replicator --config replication.json export --offset 10000
//! order-replicator --config replication.json compare
//! ```

use clap::{Parser, Subcommand};
use order_replication::config::StoreKind;
use order_replication::{
    CursorStore, DeadLetterQueue, DualSinkWriter, MySqlStore, PostgresStore, RecordStore,
    ReconciliationEngine, ReplicaPipeline, ReplicationConfig, ReplicationError, Result,
    SourceExporter, StreamProducer,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "order-replicator")]
#[command(about = "Replicate order/payment records through Kafka into Postgres and MySQL")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "ORDER_REPLICATION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the topic into both replicas until Ctrl-C
    Consume,

    /// Export the source table onto the topic
    Export {
        /// Start at this row, ignoring any saved cursor
        #[arg(long)]
        offset: Option<u64>,

        /// Stop after this many rows
        #[arg(long)]
        max_records: Option<u64>,
    },

    /// Compare every configured replica against the source and print the report
    Compare,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<ReplicationConfig> {
    let config = match path {
        Some(path) => ReplicationConfig::from_json_file(path)?,
        None => {
            warn!("No configuration file given, using defaults");
            ReplicationConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let result = match load_config(cli.config.as_ref()) {
        Ok(config) => match cli.command {
            Command::Consume => consume(config).await,
            Command::Export {
                offset,
                max_records,
            } => export(config, offset, max_records).await,
            Command::Compare => compare(config).await,
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "order-replicator failed");
            ExitCode::FAILURE
        }
    }
}

async fn consume(config: ReplicationConfig) -> Result<()> {
    let sinks = &config.sinks;
    let postgres = PostgresStore::connect("postgres", &sinks.postgres_url, sinks.max_connections).await?;
    let mysql = MySqlStore::connect("mysql", &sinks.mysql_url, sinks.max_connections).await?;

    let mut writer = DualSinkWriter::new(
        Arc::new(postgres),
        Arc::new(mysql),
        sinks.write_retry.retry_config(),
    );
    if let Some(dir) = &sinks.dead_letter_dir {
        info!(dir = %dir.display(), "Dead letter directory enabled");
        writer = writer.with_dead_letter(DeadLetterQueue::new(dir));
    }

    let mut pipeline = ReplicaPipeline::from_config(&config, Arc::new(writer));
    pipeline.start().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }
    pipeline.shutdown().await;
    Ok(())
}

async fn export(
    mut config: ReplicationConfig,
    offset: Option<u64>,
    max_records: Option<u64>,
) -> Result<()> {
    if let Some(offset) = offset {
        config.export.offset_start = Some(offset);
    }
    if let Some(max_records) = max_records {
        config.export.max_records = max_records;
    }

    let source = PostgresStore::connect("source", &config.export.source_url, config.sinks.max_connections).await?;
    let producer = Arc::new(StreamProducer::new(&config.kafka, &config.producer)?);

    let mut exporter = SourceExporter::new(Arc::new(source), Arc::clone(&producer), config.export.clone());
    let cursor = match &config.export.cursor_path {
        Some(path) => Some(Arc::new(CursorStore::new(path).await?)),
        None => None,
    };
    if let Some(cursor) = &cursor {
        exporter = exporter.with_cursor(Arc::clone(cursor));
    }

    let outcome = tokio::select! {
        result = exporter.export_all() => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; the cursor holds the last finished page");
            Err(ReplicationError::Shutdown)
        }
    };

    if let Err(e) = producer.flush(Duration::from_secs(10)) {
        warn!(error = %e, "Producer flush incomplete");
    }
    if let Some(cursor) = cursor {
        cursor.close().await;
    }

    let summary = outcome?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", serde_json::to_string_pretty(&producer.stats().snapshot())?);
    Ok(())
}

async fn compare(config: ReplicationConfig) -> Result<()> {
    let reconcile = &config.reconcile;
    let pool_size = config.sinks.max_connections;
    let source: Arc<dyn RecordStore> =
        Arc::new(PostgresStore::connect("source", &reconcile.source_url, pool_size).await?);

    let mut replicas: Vec<Arc<dyn RecordStore>> = Vec::with_capacity(reconcile.replicas.len());
    for target in &reconcile.replicas {
        let store: Arc<dyn RecordStore> = match target.kind {
            StoreKind::Postgres => {
                Arc::new(PostgresStore::connect(target.name.clone(), &target.url, pool_size).await?)
            }
            StoreKind::Mysql => {
                Arc::new(MySqlStore::connect(target.name.clone(), &target.url, pool_size).await?)
            }
        };
        replicas.push(store);
    }
    if replicas.is_empty() {
        warn!("No replicas configured; report will only carry the reference count");
    }

    let engine = ReconciliationEngine::new(source, replicas, reconcile);
    let report = engine.reconcile().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
