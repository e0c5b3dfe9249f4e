//! Concurrency layer for the Strata STM engine
//!
//! This crate implements optimistic software transactional memory with:
//! - Direct (in-place, with backups) and deferred (staged copy) updating
//! - Invalidation or validation at commit, early or late conflict detection
//! - Pluggable contention management ([`ContentionManager`])
//! - Irrevocable and isolated transactions
//! - Lock-aware transactional memory ([`TxLock`], [`LatmMode`])
//! - Flattened nesting and epoch-based reclamation of deleted objects
//!
//! Entry points are [`Engine`], [`ThreadHandle`] and [`Transaction`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
mod atomic;
pub mod config;
pub mod contention;
pub mod engine;
mod footprint;
pub mod latm;
mod reclaim;
mod registry;
pub mod state;
pub mod stats;
pub mod thread;
pub mod transaction;
mod write_set;

pub use access::{TxMut, TxRef};
pub use config::{
    AbortPermission, CommitValidation, ConflictDetection, ContentionConfig, ContentionPolicy,
    CopySemantics, EngineConfig, LatmMode, UpdatePolicy,
};
pub use contention::{
    build_contention_manager, BackoffContentionManager, ContentionManager, NoOpContentionManager,
};
pub use engine::{Engine, EngineBuilder};
pub use latm::{LockGuard, TxLock};
pub use state::{TxInfo, TxKind, TxState};
pub use stats::StatsSnapshot;
pub use thread::ThreadHandle;
pub use transaction::Transaction;

// Re-export the core types for convenience
pub use strata_core::{
    transactable, AbortReason, Error, LockId, ObjectId, Result, ThreadId, Timestamp, Transactable,
    TxId, TxObject,
};
