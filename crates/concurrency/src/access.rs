//! Guards returned by transactional reads and writes
//!
//! A guard either borrows the live value of the object (committed state,
//! an in-place direct-mode write, or the transaction's own new object) or
//! a staged private copy. Either way it derefs to `T`.
//!
//! Guards borrow the transaction, so `end()`, `restart()` and promotions
//! (which take `&mut self`) can only run once every guard is gone.
//!
//! Live guards also hold a [`Borrow`] from the thread's [`BorrowTracker`].
//! Asking for a live guard that conflicts with one the thread already holds
//! fails with a usage error instead of waiting on itself.

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use strata_core::ObjectId;

/// Live guards the owning thread currently holds, per object
///
/// Positive counts are shared guards, `-1` an exclusive one.
#[derive(Debug, Default)]
pub(crate) struct BorrowTracker {
    counts: RefCell<FxHashMap<ObjectId, isize>>,
}

impl BorrowTracker {
    pub fn shared(&self, id: ObjectId) -> Option<Borrow<'_>> {
        let mut counts = self.counts.borrow_mut();
        let count = counts.entry(id).or_insert(0);
        if *count < 0 {
            return None;
        }
        *count += 1;
        Some(Borrow { tracker: self, id })
    }

    pub fn exclusive(&self, id: ObjectId) -> Option<Borrow<'_>> {
        let mut counts = self.counts.borrow_mut();
        if counts.contains_key(&id) {
            return None;
        }
        counts.insert(id, -1);
        Some(Borrow { tracker: self, id })
    }

    pub fn is_borrowed(&self, id: ObjectId) -> bool {
        self.counts.borrow().contains_key(&id)
    }

    /// Objects with at least one live guard outstanding
    pub fn live_count(&self) -> usize {
        self.counts.borrow().len()
    }
}

/// Registration of one live guard; released on drop
pub(crate) struct Borrow<'a> {
    tracker: &'a BorrowTracker,
    id: ObjectId,
}

impl Drop for Borrow<'_> {
    fn drop(&mut self) {
        let mut counts = self.tracker.counts.borrow_mut();
        if let Some(count) = counts.get_mut(&self.id) {
            if *count > 1 {
                *count -= 1;
            } else {
                counts.remove(&self.id);
            }
        }
    }
}

enum ReadInner<'a, T> {
    // guard before borrow: the lock is released first
    Live(RwLockReadGuard<'a, T>, Borrow<'a>),
    Staged(ArcRwLockReadGuard<RawRwLock, T>),
}

/// Shared access to a transactional value
pub struct TxRef<'a, T> {
    inner: ReadInner<'a, T>,
}

impl<'a, T> TxRef<'a, T> {
    pub(crate) fn live(guard: RwLockReadGuard<'a, T>, borrow: Borrow<'a>) -> Self {
        Self {
            inner: ReadInner::Live(guard, borrow),
        }
    }

    pub(crate) fn staged(guard: ArcRwLockReadGuard<RawRwLock, T>) -> Self {
        Self {
            inner: ReadInner::Staged(guard),
        }
    }

    /// Whether the guard points at a private staged copy
    pub fn is_staged(&self) -> bool {
        matches!(self.inner, ReadInner::Staged(_))
    }
}

impl<T> Deref for TxRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            ReadInner::Live(guard, _) => guard,
            ReadInner::Staged(guard) => guard,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for TxRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}

enum WriteInner<'a, T> {
    Live(RwLockWriteGuard<'a, T>, Borrow<'a>),
    Staged(ArcRwLockWriteGuard<RawRwLock, T>),
}

/// Exclusive access to a transactional value
pub struct TxMut<'a, T> {
    inner: WriteInner<'a, T>,
}

impl<'a, T> TxMut<'a, T> {
    pub(crate) fn live(guard: RwLockWriteGuard<'a, T>, borrow: Borrow<'a>) -> Self {
        Self {
            inner: WriteInner::Live(guard, borrow),
        }
    }

    pub(crate) fn staged(guard: ArcRwLockWriteGuard<RawRwLock, T>) -> Self {
        Self {
            inner: WriteInner::Staged(guard),
        }
    }

    /// Whether the guard points at a private staged copy
    pub fn is_staged(&self) -> bool {
        matches!(self.inner, WriteInner::Staged(_))
    }
}

impl<T> Deref for TxMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            WriteInner::Live(guard, _) => guard,
            WriteInner::Staged(guard) => guard,
        }
    }
}

impl<T> DerefMut for TxMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            WriteInner::Live(guard, _) => guard,
            WriteInner::Staged(guard) => guard,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for TxMut<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (**self).fmt(f)
    }
}
