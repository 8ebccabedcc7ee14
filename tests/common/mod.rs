// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for pipeline, chaos and integration tests.
//!
//! This module provides:
//! - Postgres and MySQL testcontainers with the replica schema
//! - In-memory replica/source store with failure injection
//! - In-memory topic publisher

#![allow(dead_code)]

pub mod containers;
pub mod mock_sink;

pub use containers::*;
pub use mock_sink::*;
