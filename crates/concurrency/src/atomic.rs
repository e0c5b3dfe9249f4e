//! Retry combinator
//!
//! [`ThreadHandle::atomic`] runs a closure inside a transaction and
//! restarts it on retryable aborts until it commits:
//!
//! ```
//! use strata_concurrency::{Engine, TxObject};
//!
//! let engine = Engine::new();
//! let from = TxObject::new(100i64);
//! let to = TxObject::new(0i64);
//! let thread = engine.initialize_thread();
//!
//! let moved = thread.atomic(|tx| {
//!     let amount = *tx.read(&from)? / 2;
//!     *tx.write(&from)? -= amount;
//!     *tx.write(&to)? += amount;
//!     Ok(amount)
//! }).unwrap();
//!
//! assert_eq!(moved, 50);
//! assert_eq!(from.load() + to.load(), 100);
//! ```

use crate::state::TxState;
use crate::thread::ThreadHandle;
use crate::transaction::Transaction;
use strata_core::{AbortReason, Error, Result};
use tracing::trace;

impl ThreadHandle {
    /// Run `body` transactionally, retrying on aborts
    ///
    /// Each iteration runs in one live transaction that is ended after the
    /// body returns, unless the body already ended it. A body that aborts
    /// the transaction and still returns `Ok` is retried like an explicit
    /// abort. Non-retryable errors from the body or the commit are returned
    /// as is.
    ///
    /// Called inside another transaction of this thread, an abort is
    /// returned instead of retried: the enclosing transaction is doomed
    /// and must retry as a whole.
    pub fn atomic<R, F>(&self, mut body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<R>,
    {
        let mut tx = self.unstarted();
        tx.begin()?;
        let mut attempts = 1u64;
        loop {
            let outcome = match body(&mut tx) {
                Ok(value) if tx.is_in_flight() => tx.end().map(|()| value),
                Ok(_) if tx.state() == TxState::Aborted => {
                    Err(Error::Aborted(AbortReason::Explicit))
                }
                other => other,
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };
            let others = self.ctx.depth() - usize::from(tx.is_in_flight());
            if others > 0 {
                return Err(err);
            }
            trace!("{} retrying after attempt {}: {}", tx.id(), attempts, err);
            attempts += 1;
            tx.restart()?;
        }
    }
}
