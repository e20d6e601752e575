//! # hive-core
//!
//! Core types, errors, and logging for the hive cluster supervisor.
//!
//! This crate provides:
//! - [`HiveError`] - Error types for all hive operations
//! - [`logging`] - Tracing setup honoring the `NODE_DEBUG` cluster selector
//! - [`types`] - Worker ids, roles, and the worker state machine

pub mod error;
pub mod logging;
pub mod types;

// Re-export main types for convenience
pub use error::{HiveError, Result};
pub use logging::{init_logging, LogGuard};
pub use types::{Role, Timestamp, WorkerId, WorkerState};
