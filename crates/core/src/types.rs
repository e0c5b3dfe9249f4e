//! Core identifier types for the transactional memory engine
//!
//! This module defines the identifiers shared by every layer:
//! - [`ObjectId`]: Process-unique identity of a transactional object
//! - [`ThreadId`]: Engine-assigned identity of a participating thread
//! - [`TxId`]: Identity of one transaction attempt
//! - [`LockId`]: Identity of a LATM-registered lock
//! - [`Timestamp`]: Logical clock value ordering starts and deletions

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Logical clock value.
///
/// Drawn from the engine clock. Transaction starts and deletion requests
/// share one clock, so any two timestamps are strictly ordered.
pub type Timestamp = u64;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id value
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw id value
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Identity of a transactional object
    ///
    /// Allocated from a process-wide counter so that objects created
    /// before (or outside) any engine still have distinct identities.
    ObjectId,
    "obj#"
);

define_id!(
    /// Identity of a thread registered with an engine
    ///
    /// The raw value `0` is reserved as the "unowned" sentinel stored in
    /// object headers and is never handed out.
    ThreadId,
    "thread#"
);

define_id!(
    /// Identity of a single transaction attempt
    ///
    /// Every `begin()` (including the one inside `restart()`) gets a fresh id.
    TxId,
    "tx#"
);

define_id!(
    /// Identity of a lock known to the LATM registry
    LockId,
    "lock#"
);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl ObjectId {
    /// Allocate the next process-unique object id
    pub fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl ThreadId {
    /// Raw sentinel meaning "no owner"
    pub const UNOWNED: u64 = 0;
}

/// Monotonic id allocator
///
/// Engines keep one per id space. Values start at 1 so that 0 stays
/// available as a sentinel.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator whose first id is 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next raw id
    #[inline]
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Logical clock shared by transaction starts and deletion requests
#[derive(Debug)]
pub struct LogicalClock {
    now: AtomicU64,
}

impl LogicalClock {
    /// Create a clock starting at zero
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Advance the clock and return the new, unique timestamp
    #[inline]
    pub fn tick(&self) -> Timestamp {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current clock value without advancing it
    #[inline]
    pub fn now(&self) -> Timestamp {
        self.now.load(Ordering::Acquire)
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}
