#![deny(missing_docs)]

//! Shared configuration, error types, and observability primitives for
//! FireQuery crates.
//!
//! Architecture role:
//! - defines per-process topology configuration loaded by every node binary
//! - provides common [`FqError`] / [`Result`] contracts
//! - hosts the append-only CSV event sink used for run analysis
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`metrics`]

/// Per-process topology/configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Append-only CSV event sink.
pub mod metrics;

pub use config::{ChunkConfig, DataPartitioning, EdgeConfig, ProcessConfig, Role, Team};
pub use error::{FqError, Result};
