//! Error types for the transactional memory engine
//!
//! Three families of failure are kept apart:
//!
//! | Family | Variants | Caller action |
//! |--------|----------|---------------|
//! | Recoverable conflict | `Aborted` | restart the transaction |
//! | Timeout | `Timeout` | retry later or give up; no side effects happened |
//! | Usage / invariant violation | everything else | fix the calling code |
//!
//! The retry combinator only swallows recoverable conflicts.

use crate::types::{LockId, ObjectId, ThreadId, TxId};
use std::time::Duration;
use thiserror::Error;

/// Why a transaction attempt was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// Another party (committer, isolated transaction, lock acquirer) forced the abort
    #[error("forced to abort by a conflicting party")]
    Forced,

    /// Lost a read conflict on the object
    #[error("read conflict on {0}")]
    ReadConflict(ObjectId),

    /// Lost a write conflict on the object
    #[error("write conflict on {0}")]
    WriteConflict(ObjectId),

    /// Touched another thread's uncommitted object
    #[error("conflict on uncommitted object {0}")]
    NewObjectConflict(ObjectId),

    /// Lost a conflict while deleting the object
    #[error("delete conflict on {0}")]
    DeleteConflict(ObjectId),

    /// A value this transaction depends on changed since it was observed
    #[error("validation failed on {0}")]
    ValidationFailed(ObjectId),

    /// The contention manager refused permission to abort the conflicting transactions
    #[error("permission to abort conflicting transactions denied")]
    PermissionDenied,

    /// A conflicting transaction is irrevocable and cannot be aborted
    #[error("conflicts with irrevocable transaction {0}")]
    IrrevocableConflict(TxId),

    /// The contention manager vetoed the commit
    #[error("commit vetoed by contention manager")]
    CommitVetoed,

    /// A declared conflicting lock is held by another thread
    #[error("conflicting lock {0} is held by another thread")]
    LockConflict(LockId),

    /// An inner transaction of the same thread aborted
    #[error("nested transaction aborted")]
    NestedAbort,

    /// The transaction asked to abort itself
    #[error("explicitly aborted")]
    Explicit,

    /// The transaction was dropped while in flight
    #[error("dropped while in flight")]
    Dropped,
}

/// All engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Recoverable conflict; the attempt left no trace and may be restarted
    #[error("transaction aborted: {0}")]
    Aborted(AbortReason),

    /// Timed lock acquisition failed without side effects
    #[error("timed out after {waited:?} waiting for {lock}")]
    Timeout {
        /// Lock that could not be acquired
        lock: LockId,
        /// How long the caller waited
        waited: Duration,
    },

    /// `restart()` while another transaction of the same thread is in flight
    ///
    /// Closed nesting makes such a restart impossible to complete, so it is
    /// reported instead of retried.
    #[error("cannot restart: {thread} has another transaction in flight")]
    NestedRestart {
        /// Thread that attempted the restart
        thread: ThreadId,
    },

    /// Releasing a lock the caller never obtained
    #[error("{lock} was not obtained by {thread}")]
    LockNotObtained {
        /// Lock being released
        lock: LockId,
        /// Thread attempting the release
        thread: ThreadId,
    },

    /// Operation requires an in-flight transaction
    #[error("{0} is not in flight")]
    NotInFlight(TxId),

    /// `begin()` on a transaction that is already in flight
    #[error("{0} is already in flight")]
    AlreadyInFlight(TxId),

    /// The object was deleted earlier in this transaction
    #[error("{0} was deleted by this transaction")]
    Deleted(ObjectId),

    /// The object was deleted by a commit that precedes this attempt
    ///
    /// Retrying cannot help: every later attempt starts after the delete too.
    #[error("{0} was deleted before this transaction began")]
    Retired(ObjectId),

    /// The object's state has been reclaimed
    #[error("{0} has been reclaimed")]
    Reclaimed(ObjectId),

    /// Engine state does not permit the operation (e.g. reconfiguring while in flight)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Other API misuse
    #[error("usage error: {0}")]
    Usage(String),

    /// Configuration could not be parsed or validated
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Only aborts are retryable; the retry combinator loops on exactly these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Check if this is an abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Check if this is a lock timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if this error reports a programming mistake rather than a runtime condition.
    pub fn is_usage_error(&self) -> bool {
        !matches!(
            self,
            Error::Aborted(_) | Error::Timeout { .. } | Error::Config(_)
        )
    }

    /// Abort reason, if this is an abort.
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            Error::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<AbortReason> for Error {
    fn from(reason: AbortReason) -> Self {
        Error::Aborted(reason)
    }
}
