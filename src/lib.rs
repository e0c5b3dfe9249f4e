//! # StrataSTM
//!
//! Software transactional memory for shared in-memory objects.
//!
//! Threads group reads and writes of [`TxObject`]s into transactions that
//! either commit atomically or leave no trace. Concurrency control is
//! optimistic; conflicts are resolved by a pluggable
//! [`ContentionManager`], and ordinary locks ([`TxLock`]) coexist with
//! transactions through lock-aware transactional memory.
//!
//! ## Quick Start
//!
//! ```
//! use stratastm::prelude::*;
//!
//! let engine = Engine::new();
//! let counter = TxObject::new(0u64);
//!
//! let thread = engine.initialize_thread();
//! thread.atomic(|tx| {
//!     *tx.write(&counter)? += 1;
//!     Ok(())
//! })?;
//!
//! assert_eq!(counter.load(), 1);
//! # Ok::<(), stratastm::Error>(())
//! ```
//!
//! ## Configuration
//!
//! Update policy, commit validation, conflict detection, LATM mode and the
//! contention manager are engine-wide and can only change while no
//! transaction is in flight:
//!
//! ```
//! use stratastm::prelude::*;
//!
//! let engine = Engine::builder()
//!     .update_policy(UpdatePolicy::Direct)
//!     .commit_validation(CommitValidation::Validation)
//!     .latm_mode(LatmMode::Tm)
//!     .build()?;
//! assert_eq!(engine.config().update_policy, UpdatePolicy::Direct);
//! # Ok::<(), stratastm::Error>(())
//! ```
//!
//! ## Crates
//!
//! - [`strata_core`]: ids, errors, [`Transactable`], [`TxObject`], [`ConflictFilter`]
//! - [`strata_concurrency`]: the engine, transactions, contention management and LATM

#![warn(missing_docs)]

pub mod prelude;

pub use strata_concurrency::*;
pub use strata_core::{AnyObject, ConflictFilter, ObjectHeader};

/// Core types, re-exported for direct access
pub use strata_core;

/// Engine internals, re-exported for direct access
pub use strata_concurrency;
