//! Participating threads
//!
//! Each thread that runs transactions registers with the engine through
//! [`Engine::initialize_thread`](crate::Engine::initialize_thread) and gets a
//! [`ThreadHandle`]. The handle splits per-thread state in two:
//!
//! - [`ThreadContext`] (shared, `Arc`): what other threads need to see or
//!   set. The forced-abort and blocked flags, the transaction kind, the
//!   footprint, the nesting stack and the locks the thread holds.
//! - Thread-private sets (`RefCell` in the handle): staged copies, backups,
//!   new and deleted objects.
//!
//! Nested transactions of one thread share both halves: nesting is
//! flattened and only the outermost `end()` publishes.

use crate::access::BorrowTracker;
use crate::engine::{Engine, EngineInner};
use crate::footprint::Footprint;
use crate::latm::TxLock;
use crate::registry::TxRecord;
use crate::state::TxKind;
use crate::transaction::Transaction;
use crate::write_set::LocalSets;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use strata_core::{AbortReason, Error, LockId, Result, ThreadId, TxId};
use tracing::{debug, warn};

/// Shared per-thread state
pub(crate) struct ThreadContext {
    id: ThreadId,
    forced: AtomicBool,
    blocked: AtomicBool,
    kind: AtomicU8,
    doom: Mutex<Option<AbortReason>>,
    commits: AtomicU64,
    aborts: AtomicU64,
    pub footprint: Mutex<Footprint>,
    nesting: Mutex<SmallVec<[TxId; 4]>>,
    held_locks: Mutex<SmallVec<[TxLock; 2]>>,
    obtained_locks: Mutex<SmallVec<[TxLock; 2]>>,
}

impl ThreadContext {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            forced: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            kind: AtomicU8::new(TxKind::Normal as u8),
            doom: Mutex::new(None),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            footprint: Mutex::new(Footprint::default()),
            nesting: Mutex::new(SmallVec::new()),
            held_locks: Mutex::new(SmallVec::new()),
            obtained_locks: Mutex::new(SmallVec::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Ask the thread's current transaction to abort
    ///
    /// Refused for irrevocable transactions. Returns true if the flag was
    /// newly set. Callers hold the in-flight lock so the check cannot race
    /// a promotion.
    pub fn force_abort(&self) -> bool {
        if self.kind().is_irrevocable() {
            return false;
        }
        !self.forced.swap(true, Ordering::AcqRel)
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    pub fn clear_forced(&self) {
        self.forced.store(false, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    pub fn kind(&self) -> TxKind {
        TxKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub fn set_kind(&self, kind: TxKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    /// Mark the transaction family as doomed; the first reason sticks
    pub fn doom(&self, reason: AbortReason) -> AbortReason {
        *self.doom.lock().get_or_insert(reason)
    }

    pub fn doomed(&self) -> Option<AbortReason> {
        *self.doom.lock()
    }

    pub fn clear_doom(&self) {
        *self.doom.lock() = None;
    }

    /// Reason the current transaction must abort, if any
    pub fn pending_abort(&self) -> Option<AbortReason> {
        if let Some(reason) = self.doomed() {
            return Some(reason);
        }
        (self.is_forced() && !self.kind().is_irrevocable()).then_some(AbortReason::Forced)
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    pub fn push_tx(&self, id: TxId) {
        self.nesting.lock().push(id);
    }

    pub fn pop_tx(&self, id: TxId) {
        let mut nesting = self.nesting.lock();
        if let Some(pos) = nesting.iter().rposition(|t| *t == id) {
            nesting.remove(pos);
        }
    }

    /// Number of in-flight transactions of this thread
    pub fn depth(&self) -> usize {
        self.nesting.lock().len()
    }

    /// Innermost in-flight transaction
    pub fn current_tx(&self) -> Option<TxId> {
        self.nesting.lock().last().copied()
    }

    pub fn add_held(&self, lock: TxLock) {
        self.held_locks.lock().push(lock);
    }

    pub fn add_obtained(&self, lock: TxLock) {
        self.obtained_locks.lock().push(lock);
    }

    /// Forget `lock`; returns false if the thread did not record it
    pub fn forget_lock(&self, lock: LockId) -> bool {
        for list in [&self.held_locks, &self.obtained_locks] {
            let mut list = list.lock();
            if let Some(pos) = list.iter().position(|l| l.id() == lock) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn take_obtained(&self) -> SmallVec<[TxLock; 2]> {
        std::mem::take(&mut *self.obtained_locks.lock())
    }

    pub fn take_held(&self) -> SmallVec<[TxLock; 2]> {
        std::mem::take(&mut *self.held_locks.lock())
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("forced", &self.is_forced())
            .field("blocked", &self.is_blocked())
            .field("depth", &self.depth())
            .finish()
    }
}

/// A thread's registration with an [`Engine`]
///
/// Transactions borrow the handle, so none can outlive it. The handle is
/// `Send` but not `Sync`: it may move to another OS thread between
/// transactions but is only ever used by one at a time.
///
/// Dropping the handle terminates the thread's registration; any plain
/// locks it still holds are released with a warning.
pub struct ThreadHandle {
    pub(crate) engine: Engine,
    pub(crate) ctx: Arc<ThreadContext>,
    pub(crate) local: RefCell<LocalSets>,
    pub(crate) borrows: BorrowTracker,
    terminated: Cell<bool>,
}

impl ThreadHandle {
    pub(crate) fn new(engine: Engine, ctx: Arc<ThreadContext>) -> Self {
        Self {
            engine,
            ctx,
            local: RefCell::new(LocalSets::default()),
            borrows: BorrowTracker::default(),
            terminated: Cell::new(false),
        }
    }

    /// Engine-assigned thread id
    pub fn id(&self) -> ThreadId {
        self.ctx.id()
    }

    /// Engine this thread is registered with
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn inner(&self) -> &EngineInner {
        &self.engine.inner
    }

    /// Begin a new transaction
    ///
    /// Blocks while LATM keeps this thread out. When another transaction
    /// of this thread is in flight the new one nests inside it.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new(self)
    }

    /// Create a transaction without beginning it
    pub fn unstarted(&self) -> Transaction<'_> {
        Transaction::unstarted(self)
    }

    /// Whether a transaction of this thread is in flight
    pub fn in_transaction(&self) -> bool {
        self.ctx.depth() > 0
    }

    /// Whether LATM currently keeps this thread from beginning transactions
    pub fn is_blocked(&self) -> bool {
        self.ctx.is_blocked()
    }

    /// Protection level of the current transaction family
    pub fn kind(&self) -> TxKind {
        self.ctx.kind()
    }

    /// Transactions this thread has committed
    pub fn commits(&self) -> u64 {
        self.ctx.commits()
    }

    /// Transaction attempts of this thread that aborted
    pub fn aborts(&self) -> u64 {
        self.ctx.aborts()
    }

    /// Tear down the thread's registration
    ///
    /// Equivalent to dropping the handle.
    pub fn terminate(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.terminated.replace(true) {
            return;
        }
        let me = self.id();
        for lock in self.ctx.take_held().into_iter().chain(self.ctx.take_obtained()) {
            warn!("{} terminated while holding {}; releasing it", me, lock.id());
            self.release_registered(&lock);
        }
        self.inner().threads.remove(&me);
        debug!("{} terminated", me);
    }

    /// Record of the innermost in-flight transaction of this thread
    pub(crate) fn current_record(&self) -> Option<Arc<TxRecord>> {
        let id = self.ctx.current_tx()?;
        self.inner().in_flight.lock().get(id).cloned()
    }

    /// Doom the current transaction family and build the error to return
    pub(crate) fn doom(&self, reason: AbortReason) -> Error {
        let effective = self.ctx.doom(reason);
        debug!("{} doomed: {}", self.id(), effective);
        Error::Aborted(effective)
    }

    /// Fail with the pending abort, if any
    pub(crate) fn check_pending(&self) -> Result<()> {
        match self.ctx.pending_abort() {
            Some(reason) => Err(self.doom(reason)),
            None => Ok(()),
        }
    }

    /// Force the in-flight transaction of `thread`, if it has one
    pub(crate) fn force_thread(&self, thread: ThreadId) -> bool {
        let inner = self.inner();
        let inflight = inner.in_flight.lock();
        match inflight.outermost_of(thread) {
            Some(victim) => inner.force(victim),
            None => false,
        }
    }

    /// Promote the current transaction family to `target`
    ///
    /// Waits until no other thread runs an irrevocable transaction; an
    /// isolated promotion also forces every other thread's transaction out
    /// on each attempt. The read set is validated under the commit lock
    /// so an irrevocable transaction never starts from a stale view.
    ///
    /// Returns `Ok(false)` if `deadline` passes first; nothing changed then.
    /// Refused while this thread holds live guards: a committer may be
    /// waiting on one of them with the commit lock held.
    pub(crate) fn promote(
        &self,
        record: &TxRecord,
        target: TxKind,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        let inner = self.inner();
        let ctx = &self.ctx;
        let me = ctx.id();
        if ctx.kind() >= target {
            return Ok(true);
        }
        let live = self.borrows.live_count();
        if live > 0 {
            return Err(Error::Usage(format!(
                "{} cannot become {:?} while holding {} live guards",
                record.id, target, live
            )));
        }
        let cm = inner.contention();
        let wait = inner.wait_interval();
        loop {
            self.check_pending()?;
            if let Some(_general) = inner.general.try_lock_for(wait) {
                let inflight = inner.in_flight.lock();
                if let Some(reason) = ctx.pending_abort() {
                    return Err(self.doom(reason));
                }
                let others = inflight.other_threads(me);
                if target == TxKind::IrrevocableAndIsolated {
                    for other in &others {
                        inner.force(other);
                    }
                }
                if others.iter().all(|r| !r.kind().is_irrevocable()) {
                    if let Some(id) = ctx.footprint.lock().stale_read(me) {
                        return Err(self.doom(AbortReason::ValidationFailed(id)));
                    }
                    if let Some(id) = self.local.borrow().stale_write() {
                        return Err(self.doom(AbortReason::ValidationFailed(id)));
                    }
                    if !ctx.kind().is_irrevocable() {
                        inner.irrevocable.fetch_add(1, Ordering::AcqRel);
                    }
                    ctx.set_kind(target);
                    debug!("{} promoted to {:?}", record.id, target);
                    return Ok(true);
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!("{} gave up promotion to {:?}", record.id, target);
                return Ok(false);
            }
            let info = record.info();
            let priority = match target {
                TxKind::IrrevocableAndIsolated => {
                    cm.perform_isolated_tx_wait_priority_promotion(&info)
                }
                _ => cm.perform_irrevocable_tx_wait_priority_promotion(&info),
            };
            record.set_priority(priority);
            std::thread::sleep(wait);
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("ctx", &self.ctx)
            .finish()
    }
}
