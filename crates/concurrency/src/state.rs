//! Transaction lifecycle types
//!
//! - [`TxState`]: where an attempt is in its lifecycle
//! - [`TxKind`]: how much protection the thread's current transaction has
//! - [`TxInfo`]: the snapshot handed to contention managers

use serde::{Deserialize, Serialize};
use strata_core::{ThreadId, Timestamp, TxId};

/// Lifecycle state of a transaction attempt
///
/// ```text
/// NoState -> InFlight -> Committed
///                     -> Aborted
///                     -> HandOff   (another transaction of the thread is still in flight)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    /// Created but never begun
    NoState,
    /// Registered in flight; reads and writes are allowed
    InFlight,
    /// Outermost end succeeded and all effects are published
    Committed,
    /// Rolled back
    Aborted,
    /// Ended while an enclosing transaction of the same thread is in flight
    HandOff,
}

impl TxState {
    /// Check if the attempt is in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TxState::InFlight)
    }

    /// Check if the attempt has finished in any way
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::Aborted | TxState::HandOff
        )
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::NoState => "NoState",
            TxState::InFlight => "InFlight",
            TxState::Committed => "Committed",
            TxState::Aborted => "Aborted",
            TxState::HandOff => "HandOff",
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Protection level of a thread's current transaction
///
/// Ordered: a promotion never lowers the kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum TxKind {
    /// May be forced to abort by other parties
    #[default]
    Normal = 0,
    /// Cannot be forced to abort; at most one per engine
    Irrevocable = 1,
    /// Irrevocable, and every other thread's transaction has been forced out
    IrrevocableAndIsolated = 2,
}

impl TxKind {
    /// Check if the kind is immune to forced aborts
    pub fn is_irrevocable(&self) -> bool {
        !matches!(self, TxKind::Normal)
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TxKind::Irrevocable,
            2 => TxKind::IrrevocableAndIsolated,
            _ => TxKind::Normal,
        }
    }
}

/// Snapshot of a transaction for contention decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInfo {
    /// Attempt id
    pub id: TxId,
    /// Owning thread
    pub thread: ThreadId,
    /// Current priority
    pub priority: usize,
    /// Objects in the thread's read set
    pub reads: usize,
    /// Objects in the thread's write set
    pub writes: usize,
    /// Transactions the owning thread has committed so far
    pub commits: u64,
    /// Protection level
    pub kind: TxKind,
    /// Start timestamp
    pub start: Timestamp,
}

impl TxInfo {
    /// Check if the transaction cannot be forced to abort
    pub fn is_irrevocable(&self) -> bool {
        self.kind.is_irrevocable()
    }
}
