//! Transactional objects
//!
//! A [`TxObject`] is a shared handle to a value that participates in
//! transactions. The value itself sits behind a `parking_lot::RwLock`; the
//! [`ObjectHeader`] next to it carries the bookkeeping every update strategy
//! needs:
//!
//! - `owner`: thread holding exclusive direct-write access (or the creator
//!   of an uncommitted new object), `0` when unowned
//! - `is_new`: allocated by a transaction that has not committed yet
//! - `version`: bumped whenever the shared value changes
//! - `retired` / `reclaimed`: deletion bookkeeping for epoch reclamation
//! - `retired_at`: clock value stamped by the deleting commit, `0` until known
//!
//! Values must implement [`Transactable`], which supplies the copy and move
//! operations used for staged copies, rollback backups and reclamation.

use crate::types::{ObjectId, ThreadId, Timestamp};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// State operations required of every value stored in a [`TxObject`].
///
/// # Example
///
/// ```
/// use strata_core::Transactable;
///
/// #[derive(Debug, PartialEq)]
/// struct Account {
///     balance: i64,
/// }
///
/// impl Transactable for Account {
///     fn clone_state(&self) -> Self {
///         Account { balance: self.balance }
///     }
///
///     fn take_state(&mut self) -> Self {
///         Account { balance: std::mem::take(&mut self.balance) }
///     }
/// }
/// ```
pub trait Transactable: Sized + Send + Sync + 'static {
    /// Produce a full copy of the current state
    fn clone_state(&self) -> Self;

    /// Overwrite this instance with a copy of `source`
    fn copy_state(&mut self, source: &Self) {
        *self = source.clone_state();
    }

    /// Move the state out, leaving an empty state behind
    fn take_state(&mut self) -> Self;
}

/// Implement [`Transactable`] for types that are `Clone + Default`.
///
/// ```
/// use strata_core::{transactable, Transactable};
///
/// #[derive(Clone, Default)]
/// struct Node {
///     key: u64,
///     next: Option<u64>,
/// }
///
/// transactable!(Node);
///
/// let mut n = Node { key: 3, next: Some(4) };
/// let moved = n.take_state();
/// assert_eq!(moved.key, 3);
/// assert_eq!(n.key, 0);
/// ```
#[macro_export]
macro_rules! transactable {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::Transactable for $ty {
                #[inline]
                fn clone_state(&self) -> Self {
                    ::std::clone::Clone::clone(self)
                }

                #[inline]
                fn copy_state(&mut self, source: &Self) {
                    ::std::clone::Clone::clone_from(self, source)
                }

                #[inline]
                fn take_state(&mut self) -> Self {
                    ::std::mem::take(self)
                }
            }
        )+
    };
}

transactable!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, String,
    ()
);

impl<T: Clone + Send + Sync + 'static> Transactable for Vec<T> {
    fn clone_state(&self) -> Self {
        self.clone()
    }

    fn copy_state(&mut self, source: &Self) {
        self.clone_from(source)
    }

    fn take_state(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl<T: Clone + Send + Sync + 'static> Transactable for Option<T> {
    fn clone_state(&self) -> Self {
        self.clone()
    }

    fn take_state(&mut self) -> Self {
        self.take()
    }
}

impl<T: Transactable> Transactable for Box<T> {
    fn clone_state(&self) -> Self {
        Box::new((**self).clone_state())
    }

    fn copy_state(&mut self, source: &Self) {
        (**self).copy_state(source)
    }

    fn take_state(&mut self) -> Self {
        Box::new((**self).take_state())
    }
}

impl<A: Transactable, B: Transactable> Transactable for (A, B) {
    fn clone_state(&self) -> Self {
        (self.0.clone_state(), self.1.clone_state())
    }

    fn take_state(&mut self) -> Self {
        (self.0.take_state(), self.1.take_state())
    }
}

/// Bookkeeping shared by every transactional object
#[derive(Debug)]
pub struct ObjectHeader {
    id: ObjectId,
    owner: AtomicU64,
    is_new: AtomicBool,
    version: AtomicU64,
    retired: AtomicBool,
    retired_at: AtomicU64,
    reclaimed: AtomicBool,
}

impl ObjectHeader {
    fn new(owner: Option<ThreadId>, is_new: bool) -> Self {
        Self {
            id: ObjectId::next(),
            owner: AtomicU64::new(owner.map_or(ThreadId::UNOWNED, |t| t.as_u64())),
            is_new: AtomicBool::new(is_new),
            version: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            retired_at: AtomicU64::new(0),
            reclaimed: AtomicBool::new(false),
        }
    }

    /// Object identity
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Current owner, if any
    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            ThreadId::UNOWNED => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    /// Check whether `thread` currently owns the object
    #[inline]
    pub fn is_owned_by(&self, thread: ThreadId) -> bool {
        self.owner.load(Ordering::Acquire) == thread.as_u64()
    }

    /// Try to take exclusive ownership for `thread`
    ///
    /// Succeeds if the object is unowned or already owned by `thread`.
    /// On failure returns the current owner.
    pub fn try_acquire(&self, thread: ThreadId) -> std::result::Result<(), ThreadId> {
        match self.owner.compare_exchange(
            ThreadId::UNOWNED,
            thread.as_u64(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) if current == thread.as_u64() => Ok(()),
            Err(current) => Err(ThreadId::from_raw(current)),
        }
    }

    /// Release ownership held by `thread`
    ///
    /// Returns false if `thread` was not the owner.
    pub fn release(&self, thread: ThreadId) -> bool {
        self.owner
            .compare_exchange(
                thread.as_u64(),
                ThreadId::UNOWNED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether the object was allocated by a transaction that has not committed
    #[inline]
    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    /// Clear the new flag and the creator's ownership (commit of the creator)
    pub fn publish_new(&self, creator: ThreadId) {
        self.is_new.store(false, Ordering::Release);
        self.release(creator);
    }

    /// Current version
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Increment the version and return the new value
    #[inline]
    pub fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Mark as queued for deletion by a committed transaction
    pub fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Whether a committed transaction deleted this object
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Stamp the clock value the deleting commit queued the object under
    pub fn record_retirement(&self, at: Timestamp) {
        self.retired_at.store(at, Ordering::Release);
    }

    /// Clock value of the deleting commit, once stamped
    ///
    /// Transactions that began after it can never observe the object.
    #[inline]
    pub fn retired_at(&self) -> Option<Timestamp> {
        match self.retired_at.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    /// Whether the object's state has been freed
    #[inline]
    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::Acquire)
    }
}

struct ObjectCell<T> {
    header: ObjectHeader,
    value: RwLock<T>,
}

/// Type-erased view of a transactional object.
///
/// Lets read sets, deletion buffers and new-object lists hold objects of
/// different value types.
pub trait AnyObject: Send + Sync {
    /// Object bookkeeping
    fn header(&self) -> &ObjectHeader;

    /// Free the object's state: move it out with `take_state`, drop it and
    /// flag the object as reclaimed. Idempotent.
    fn reclaim(&self);
}

impl<T: Transactable> AnyObject for ObjectCell<T> {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn reclaim(&self) {
        let mut value = self.value.write();
        if self.header.reclaimed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(value.take_state());
        self.header.owner.store(ThreadId::UNOWNED, Ordering::Release);
    }
}

/// Shared handle to a transactional value.
///
/// Cloning the handle is cheap and yields another reference to the same
/// object. Access inside transactions goes through `Transaction::read` and
/// `Transaction::write`; [`load`](TxObject::load) and
/// [`store`](TxObject::store) are for setup and inspection outside of any
/// transaction.
pub struct TxObject<T: Transactable> {
    cell: Arc<ObjectCell<T>>,
}

impl<T: Transactable> TxObject<T> {
    /// Create a committed object holding `value`
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(ObjectCell {
                header: ObjectHeader::new(None, false),
                value: RwLock::new(value),
            }),
        }
    }

    /// Create an uncommitted object owned by its creating thread
    ///
    /// Used by transactional allocation; the creator publishes it with
    /// [`ObjectHeader::publish_new`] when it commits.
    pub fn new_uncommitted(value: T, creator: ThreadId) -> Self {
        Self {
            cell: Arc::new(ObjectCell {
                header: ObjectHeader::new(Some(creator), true),
                value: RwLock::new(value),
            }),
        }
    }

    /// Object identity
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.cell.header.id
    }

    /// Object bookkeeping
    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        &self.cell.header
    }

    /// Copy of the current shared value, outside of any transaction
    pub fn load(&self) -> T {
        self.cell.value.read().clone_state()
    }

    /// Overwrite the shared value outside of any transaction
    ///
    /// Bumps the version so concurrent transactions that observed the old
    /// value fail validation.
    pub fn store(&self, value: T) {
        let mut guard = self.cell.value.write();
        *guard = value;
        self.cell.header.bump_version();
    }

    /// Shared lock on the live value
    ///
    /// Transactions use this for reads of unstaged objects. Bypasses all
    /// transactional bookkeeping. The lock is taken recursively, so a
    /// thread already holding a shared guard never queues behind a waiting
    /// writer.
    #[inline]
    pub fn read_live(&self) -> RwLockReadGuard<'_, T> {
        self.cell.value.read_recursive()
    }

    /// [`read_live`](TxObject::read_live) that gives up after `timeout`
    #[inline]
    pub fn try_read_live_for(&self, timeout: Duration) -> Option<RwLockReadGuard<'_, T>> {
        self.cell.value.try_read_recursive_for(timeout)
    }

    /// Exclusive lock on the live value
    ///
    /// Transactions use this for in-place updates, publication and
    /// rollback. Bypasses all transactional bookkeeping.
    #[inline]
    pub fn write_live(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.value.write()
    }

    /// [`write_live`](TxObject::write_live) that gives up after `timeout`
    #[inline]
    pub fn try_write_live_for(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, T>> {
        self.cell.value.try_write_for(timeout)
    }

    /// Type-erased handle to the same object
    pub fn erased(&self) -> Arc<dyn AnyObject> {
        self.cell.clone()
    }

    /// Whether two handles refer to the same object
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Number of live strong references to the object
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }
}

impl<T: Transactable> Clone for TxObject<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Transactable + Default> Default for TxObject<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Transactable + std::fmt::Debug> std::fmt::Debug for TxObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("TxObject");
        s.field("id", &self.id())
            .field("owner", &self.header().owner())
            .field("version", &self.header().version());
        match self.cell.value.try_read() {
            Some(value) => s.field("value", &*value),
            None => s.field("value", &"<locked>"),
        };
        s.finish()
    }
}
