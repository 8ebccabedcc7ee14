// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipeline state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (tasks spawned)
//!    ↓                              ↓
//! Stopped                        Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(consumer setup failed)──→ Failed
//! ```
//!
//! - **Created**: after `ReplicaPipeline::new()`. Nothing spawned.
//! - **Starting**: `start()` called, tasks being spawned.
//! - **Running**: consume and flush tasks are live.
//! - **ShuttingDown**: consumer stopped first, then the final drain.
//! - **Stopped**: every task joined. Safe to drop.
//! - **Failed**: could not start.

/// Lifecycle state of a replica pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Created => "Created",
            PipelineState::Starting => "Starting",
            PipelineState::Running => "Running",
            PipelineState::ShuttingDown => "ShuttingDown",
            PipelineState::Stopped => "Stopped",
            PipelineState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a pipeline, cheap to collect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStatus {
    pub name: String,
    pub state: PipelineState,
    /// Records buffered and not yet flushed.
    pub pending_records: usize,
    /// Non-empty batches written so far.
    pub flushes: u64,
}

impl PipelineStatus {
    /// Running with no backlog beyond one batch.
    pub fn is_healthy(&self, max_batch_size: usize) -> bool {
        self.state == PipelineState::Running && self.pending_records <= max_batch_size
    }
}
