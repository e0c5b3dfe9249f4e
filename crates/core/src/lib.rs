//! Core types for the Strata software transactional memory engine
//!
//! This crate defines the pieces every other layer builds on:
//! - Identifiers ([`ObjectId`], [`ThreadId`], [`TxId`], [`LockId`]) and the logical clock
//! - The error taxonomy ([`Error`], [`AbortReason`])
//! - The [`Transactable`] capability and the shared [`TxObject`] handle
//! - [`ConflictFilter`], the probabilistic touched-object set

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod filter;
pub mod object;
pub mod types;

pub use error::{AbortReason, Error, Result};
pub use filter::ConflictFilter;
pub use object::{AnyObject, ObjectHeader, Transactable, TxObject};
pub use types::{IdAllocator, LockId, LogicalClock, ObjectId, ThreadId, Timestamp, TxId};
