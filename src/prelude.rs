//! Convenient imports for StrataSTM.
//!
//! ```
//! use stratastm::prelude::*;
//!
//! let engine = Engine::new();
//! let thread = engine.initialize_thread();
//! let value = TxObject::new(String::from("a"));
//! thread.atomic(|tx| {
//!     tx.write(&value)?.push('b');
//!     Ok(())
//! })?;
//! assert_eq!(value.load(), "ab");
//! # Ok::<(), stratastm::Error>(())
//! ```

// Main entry points
pub use crate::{Engine, EngineBuilder, ThreadHandle, Transaction};

// Error handling
pub use crate::{AbortReason, Error, Result};

// Objects
pub use crate::{transactable, Transactable, TxMut, TxObject, TxRef};

// Locks
pub use crate::{LockGuard, TxLock};

// Configuration
pub use crate::{
    AbortPermission, CommitValidation, ConflictDetection, ContentionPolicy, CopySemantics,
    EngineConfig, LatmMode, UpdatePolicy,
};

// Contention management and introspection
pub use crate::{ContentionManager, StatsSnapshot, TxInfo, TxKind, TxState};
