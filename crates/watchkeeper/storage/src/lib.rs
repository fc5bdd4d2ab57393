//! Watchkeeper audit memory.
//!
//! The audit memory exclusively owns four tables:
//! - runs (complete and skipped, one uniform history, append-only)
//! - decisions (append-only, never pruned)
//! - triggers (append-only, never pruned)
//! - context (the only upsert-by-key table)
//!
//! The `AuditMemory` trait is the contract; storage technology is a backend
//! detail. `memory::InMemoryAuditMemory` is the deterministic reference
//! backend, `sqlite::SqliteAuditMemory` (feature `sqlite`) the durable one.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod metrics;
mod model;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryAuditMemory;
pub use metrics::{AuditStatistics, IntelligenceMetrics};
pub use model::{DecisionAppend, QueryWindow, RunAppend, SkipAppend, TriggerAppend};
pub use traits::AuditMemory;
