// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter persistence for batches a store refused after every retry.
//!
//! Each failed store write becomes one file:
//!
//! ```text
//! <dir>/<store>-<unix_ms>.jsonl     one encoded record per line
//! ```
//!
//! Files use the topic wire format, so replaying one is a matter of reading
//! it back with [`DeadLetterQueue::read`] and handing the records to the
//! store again. Files are never deleted by the pipeline.

use crate::error::Result;
use crate::metrics;
use crate::record::{Decoded, OrderPaymentRecord, RecordCodec};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Directory of dead-lettered batches.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    dir: PathBuf,
}

impl DeadLetterQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `batch` to a new file for `store`. Returns the file path.
    pub async fn persist(&self, store: &str, batch: &[OrderPaymentRecord]) -> Result<PathBuf> {
        let mut body = Vec::with_capacity(batch.len() * 256);
        for record in batch {
            body.extend_from_slice(&RecordCodec::encode(record)?);
            body.push(b'\n');
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let (path, mut file) = self.create_unique(store).await?;
        let written = async {
            file.write_all(&body).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            error!(store, path = %path.display(), error = %e, "Failed to write dead letter file");
            return Err(e.into());
        }

        metrics::record_dead_letter(store, batch.len());
        info!(
            store,
            records = batch.len(),
            path = %path.display(),
            "Batch written to dead letter"
        );
        Ok(path)
    }

    /// Pick `<store>-<unix_ms>.jsonl`, adding a suffix if two batches fail
    /// within the same millisecond.
    async fn create_unique(&self, store: &str) -> std::io::Result<(PathBuf, tokio::fs::File)> {
        let stamp = chrono::Utc::now().timestamp_millis();
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("{}-{}.jsonl", store, stamp)
            } else {
                format!("{}-{}-{}.jsonl", store, stamp, suffix)
            };
            let path = self.dir.join(name);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Dead-letter files currently in the directory, oldest name first.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read a dead-letter file back into records.
    pub async fn read(path: impl AsRef<Path>) -> Result<Vec<OrderPaymentRecord>> {
        let raw = tokio::fs::read(path).await?;
        let mut records = Vec::new();
        for line in raw.split(|b| *b == b'\n') {
            if let Decoded::Record(record) = RecordCodec::decode(line)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
