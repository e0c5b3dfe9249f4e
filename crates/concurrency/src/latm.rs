//! Lock-aware transactional memory
//!
//! [`TxLock`]s are plain mutual-exclusion locks the engine knows about, so
//! lock-based code and transactions can touch the same data safely. Which
//! transactions a lock excludes depends on the [`LatmMode`]:
//!
//! | Mode | Conflicting transactions |
//! |------|--------------------------|
//! | `Full` | every transaction of another thread |
//! | `Tm` | every transaction of another thread, if the lock is registered as conflicting |
//! | `Tx` | transactions of other threads that declared the lock |
//!
//! Acquiring a lock aborts the conflicting transactions (subject to the
//! contention manager) and, in `Full` and `Tm` mode, blocks their threads
//! from beginning new transactions until the lock is released. A
//! transaction that acquires a lock is first promoted to irrevocable
//! (isolated in `Full` mode, and in `Tm` mode for conflicting locks).
//!
//! Locks taken outside a transaction are released by [`ThreadHandle::unlock`];
//! locks taken inside one are released at the outermost end, or earlier by
//! an explicit unlock.

use crate::config::LatmMode;
use crate::registry::{InFlightRegistry, TxRecord};
use crate::state::TxKind;
use crate::thread::ThreadHandle;
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_core::{Error, LockId, Result, ThreadId, TxId};
use tracing::{debug, warn};

struct LockCell {
    id: LockId,
    holder: Mutex<Option<ThreadId>>,
    released: Condvar,
}

/// A mutual-exclusion lock registered with an engine
///
/// Created by [`Engine::new_lock`](crate::Engine::new_lock). Cloning yields
/// another handle to the same lock. Acquire and release through a
/// [`ThreadHandle`] or a [`Transaction`](crate::Transaction).
#[derive(Clone)]
pub struct TxLock {
    cell: Arc<LockCell>,
}

impl TxLock {
    pub(crate) fn new(id: LockId) -> Self {
        Self {
            cell: Arc::new(LockCell {
                id,
                holder: Mutex::new(None),
                released: Condvar::new(),
            }),
        }
    }

    /// Lock identity
    pub fn id(&self) -> LockId {
        self.cell.id
    }

    /// Thread currently holding the lock
    pub fn holder(&self) -> Option<ThreadId> {
        *self.cell.holder.lock()
    }

    /// Whether any thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Wait until no thread holds the lock
    ///
    /// Returns false if it was still held at `deadline`. The lock is not
    /// taken; callers race for it with [`try_acquire`](TxLock::try_acquire).
    pub(crate) fn wait_released(&self, deadline: Option<Instant>) -> bool {
        let mut holder = self.cell.holder.lock();
        while holder.is_some() {
            match deadline {
                Some(deadline) => {
                    if self.cell.released.wait_until(&mut holder, deadline).timed_out() {
                        return holder.is_none();
                    }
                }
                None => self.cell.released.wait(&mut holder),
            }
        }
        true
    }

    pub(crate) fn try_acquire(&self, thread: ThreadId) -> bool {
        let mut holder = self.cell.holder.lock();
        if holder.is_some() {
            return false;
        }
        *holder = Some(thread);
        true
    }

    /// Returns false if `thread` did not hold the lock
    pub(crate) fn release(&self, thread: ThreadId) -> bool {
        let mut holder = self.cell.holder.lock();
        if *holder != Some(thread) {
            return false;
        }
        *holder = None;
        // waiters do not take the lock on wake-up, so wake them all
        self.cell.released.notify_all();
        true
    }
}

impl PartialEq for TxLock {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for TxLock {}

impl std::fmt::Debug for TxLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxLock")
            .field("id", &self.id())
            .field("holder", &self.holder())
            .finish()
    }
}

/// Engine-side LATM bookkeeping, guarded by the engine's LATM mutex
#[derive(Debug, Default)]
pub(crate) struct LatmState {
    held: FxHashMap<LockId, ThreadId>,
    tm_conflicting: FxHashSet<LockId>,
    // threads kept from beginning transactions, per lock
    blocked: FxHashMap<LockId, FxHashSet<ThreadId>>,
    declared: FxHashMap<LockId, FxHashSet<TxId>>,
}

impl LatmState {
    pub fn hold(&mut self, lock: LockId, thread: ThreadId) {
        self.held.insert(lock, thread);
    }

    /// Forget `lock`'s holder; returns the threads no lock blocks any more
    pub fn release(&mut self, lock: LockId) -> Vec<ThreadId> {
        self.held.remove(&lock);
        let Some(blocked) = self.blocked.remove(&lock) else {
            return Vec::new();
        };
        blocked
            .into_iter()
            .filter(|t| !self.blocked.values().any(|set| set.contains(t)))
            .collect()
    }

    pub fn holder(&self, lock: LockId) -> Option<ThreadId> {
        self.held.get(&lock).copied()
    }

    pub fn is_tm_conflicting(&self, lock: LockId) -> bool {
        self.tm_conflicting.contains(&lock)
    }

    pub fn add_tm_conflicting(&mut self, lock: LockId) {
        self.tm_conflicting.insert(lock);
    }

    pub fn remove_tm_conflicting(&mut self, lock: LockId) -> bool {
        self.tm_conflicting.remove(&lock)
    }

    pub fn register_tx(&mut self, tx: TxId, locks: &[LockId]) {
        for lock in locks {
            self.declared.entry(*lock).or_default().insert(tx);
        }
    }

    pub fn unregister_tx(&mut self, tx: TxId, locks: &[LockId]) {
        for lock in locks {
            if let Some(txs) = self.declared.get_mut(lock) {
                txs.remove(&tx);
                if txs.is_empty() {
                    self.declared.remove(lock);
                }
            }
        }
    }

    /// A lock held by another thread that keeps `thread` from beginning
    pub fn blocking_lock(
        &self,
        mode: LatmMode,
        thread: ThreadId,
        declared: &[LockId],
    ) -> Option<LockId> {
        let foreign = |holder: &ThreadId| *holder != thread;
        match mode {
            LatmMode::Full => self
                .held
                .iter()
                .find(|(_, holder)| foreign(holder))
                .map(|(lock, _)| *lock),
            LatmMode::Tm => self
                .held
                .iter()
                .find(|(lock, holder)| foreign(holder) && self.tm_conflicting.contains(lock))
                .map(|(lock, _)| *lock),
            LatmMode::Tx => declared
                .iter()
                .copied()
                .find(|lock| self.held.get(lock).is_some_and(foreign)),
        }
    }

    /// In-flight transactions of other threads that `lock` excludes
    ///
    /// One record per thread.
    pub fn conflicting(
        &self,
        lock: LockId,
        mode: LatmMode,
        inflight: &InFlightRegistry,
        thread: ThreadId,
    ) -> Vec<Arc<TxRecord>> {
        match mode {
            LatmMode::Full => inflight.other_threads(thread),
            LatmMode::Tm if self.is_tm_conflicting(lock) => inflight.other_threads(thread),
            LatmMode::Tm => Vec::new(),
            LatmMode::Tx => {
                let Some(txs) = self.declared.get(&lock) else {
                    return Vec::new();
                };
                let mut threads: FxHashSet<ThreadId> = FxHashSet::default();
                txs.iter()
                    .filter_map(|tx| inflight.get(*tx))
                    .filter(|record| record.thread() != thread && threads.insert(record.thread()))
                    .filter_map(|record| inflight.outermost_of(record.thread()).cloned())
                    .collect()
            }
        }
    }

    pub fn block(&mut self, lock: LockId, threads: impl IntoIterator<Item = ThreadId>) {
        self.blocked.entry(lock).or_default().extend(threads);
    }
}

enum Drain {
    Clear,
    Irrevocable,
    TimedOut,
}

/// Releases its lock when dropped
///
/// Returned by [`ThreadHandle::guard`].
#[must_use = "the lock is released when the guard is dropped"]
pub struct LockGuard<'h> {
    handle: &'h ThreadHandle,
    lock: TxLock,
}

impl LockGuard<'_> {
    /// The guarded lock
    pub fn lock(&self) -> &TxLock {
        &self.lock
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.unlock(&self.lock) {
            warn!("failed to release {}: {}", self.lock.id(), e);
        }
    }
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("lock", &self.lock).finish()
    }
}

impl ThreadHandle {
    /// Acquire `lock`, waiting as long as needed
    ///
    /// Outside a transaction this aborts (or waits for) the transactions
    /// the lock conflicts with. Inside one, the transaction is promoted
    /// first and keeps the lock until its outermost end; that promotion is
    /// a usage error while guards from [`Transaction::read`] or
    /// [`Transaction::write`] on live values are still held.
    ///
    /// [`Transaction::read`]: crate::Transaction::read
    /// [`Transaction::write`]: crate::Transaction::write
    pub fn lock(&self, lock: &TxLock) -> Result<()> {
        self.acquire(lock, None)
    }

    /// [`lock`](ThreadHandle::lock) that gives up after `timeout`
    ///
    /// On timeout the lock is not held and no transaction was left
    /// blocked on its account. Inside a transaction the timeout also
    /// bounds the wait for promotion.
    pub fn lock_for(&self, lock: &TxLock, timeout: Duration) -> Result<()> {
        self.acquire(lock, Some(Instant::now() + timeout))
    }

    /// Acquire `lock` only if that needs no waiting
    ///
    /// Returns `Ok(false)` if the lock is held or, outside a transaction,
    /// if conflicting transactions are in flight. Inside a transaction the
    /// promotion happens even when the lock turns out to be taken.
    pub fn try_lock(&self, lock: &TxLock) -> Result<bool> {
        let me = self.id();
        if lock.holder() == Some(me) {
            return Err(already_held(me, lock));
        }
        if let Some(record) = self.current_record() {
            self.promote(&record, self.lock_promotion(lock), None)?;
            if !self.try_take_registered(lock) {
                return Ok(false);
            }
            self.ctx.add_obtained(lock.clone());
            let mut aborted = 0;
            self.drain_conflicts(lock, true, Instant::now(), None, &mut aborted);
            return Ok(true);
        }

        let inner = self.inner();
        let inflight = inner.in_flight.lock();
        let mode = inner.config.read().latm_mode;
        let mut latm = inner.latm.lock();
        if !latm.conflicting(lock.id(), mode, &inflight, me).is_empty() {
            return Ok(false);
        }
        if !lock.try_acquire(me) {
            return Ok(false);
        }
        latm.hold(lock.id(), me);
        self.ctx.add_held(lock.clone());
        debug!("{} try-locked {}", me, lock.id());
        Ok(true)
    }

    /// Release `lock`
    ///
    /// Fails with `LockNotObtained` if this thread does not hold it.
    pub fn unlock(&self, lock: &TxLock) -> Result<()> {
        let me = self.id();
        if lock.holder() != Some(me) || !self.ctx.forget_lock(lock.id()) {
            return Err(Error::LockNotObtained {
                lock: lock.id(),
                thread: me,
            });
        }
        self.release_registered(lock);
        debug!("{} unlocked {}", me, lock.id());
        Ok(())
    }

    /// Acquire `lock` and release it when the guard drops
    pub fn guard(&self, lock: &TxLock) -> Result<LockGuard<'_>> {
        self.lock(lock)?;
        Ok(LockGuard {
            handle: self,
            lock: lock.clone(),
        })
    }

    /// Release every lock obtained inside the finished transaction family
    pub(crate) fn release_obtained_locks(&self) {
        for lock in self.ctx.take_obtained() {
            debug!("{} releasing {} at transaction end", self.id(), lock.id());
            self.release_registered(&lock);
        }
    }

    /// Unregister `lock` and release it physically, in that order
    pub(crate) fn release_registered(&self, lock: &TxLock) {
        let inner = self.inner();
        let unblocked = inner.latm.lock().release(lock.id());
        inner.unblock(&unblocked);
        lock.release(self.id());
    }

    fn acquire(&self, lock: &TxLock, deadline: Option<Instant>) -> Result<()> {
        let me = self.id();
        if lock.holder() == Some(me) {
            return Err(already_held(me, lock));
        }
        match self.current_record() {
            Some(record) => self.acquire_in_tx(&record, lock, deadline),
            None => self.acquire_plain(lock, deadline),
        }
    }

    fn acquire_plain(&self, lock: &TxLock, deadline: Option<Instant>) -> Result<()> {
        let me = self.id();
        let started = Instant::now();
        let wait = self.inner().wait_interval();
        let mut aborted = 0;
        loop {
            if !self.take_registered(lock, deadline) {
                return Err(timeout(lock, started));
            }
            self.ctx.add_held(lock.clone());
            match self.drain_conflicts(lock, false, started, deadline, &mut aborted) {
                Drain::Clear => {
                    debug!("{} locked {} after aborting {} transactions", me, lock.id(), aborted);
                    return Ok(());
                }
                Drain::Irrevocable | Drain::TimedOut => {
                    self.ctx.forget_lock(lock.id());
                    self.release_registered(lock);
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(timeout(lock, started));
            }
            std::thread::sleep(wait);
        }
    }

    fn acquire_in_tx(
        &self,
        record: &TxRecord,
        lock: &TxLock,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let started = Instant::now();
        if !self.promote(record, self.lock_promotion(lock), deadline)? {
            return Err(timeout(lock, started));
        }
        if !self.take_registered(lock, deadline) {
            return Err(timeout(lock, started));
        }
        self.ctx.add_obtained(lock.clone());
        let mut aborted = 0;
        match self.drain_conflicts(lock, true, started, deadline, &mut aborted) {
            Drain::Clear | Drain::Irrevocable => {
                debug!("{} obtained {} inside {}", self.id(), lock.id(), record.id);
                Ok(())
            }
            Drain::TimedOut => {
                self.ctx.forget_lock(lock.id());
                self.release_registered(lock);
                Err(timeout(lock, started))
            }
        }
    }

    /// Take `lock` and register it as held in one LATM critical section
    ///
    /// Admission checks under the same mutex never see the lock taken but
    /// unregistered. Returns false if `deadline` passed first.
    fn take_registered(&self, lock: &TxLock, deadline: Option<Instant>) -> bool {
        loop {
            if self.try_take_registered(lock) {
                return true;
            }
            if !lock.wait_released(deadline) {
                return false;
            }
        }
    }

    fn try_take_registered(&self, lock: &TxLock) -> bool {
        let mut latm = self.inner().latm.lock();
        if !lock.try_acquire(self.id()) {
            return false;
        }
        latm.hold(lock.id(), self.id());
        true
    }

    fn lock_promotion(&self, lock: &TxLock) -> TxKind {
        let inner = self.inner();
        let mode = inner.config.read().latm_mode;
        match mode {
            LatmMode::Full => TxKind::IrrevocableAndIsolated,
            LatmMode::Tm if inner.latm.lock().is_tm_conflicting(lock.id()) => {
                TxKind::IrrevocableAndIsolated
            }
            LatmMode::Tm | LatmMode::Tx => TxKind::Irrevocable,
        }
    }

    /// Wait until no transaction `lock` excludes is in flight
    fn drain_conflicts(
        &self,
        lock: &TxLock,
        requester_irrevocable: bool,
        started: Instant,
        deadline: Option<Instant>,
        aborted: &mut u64,
    ) -> Drain {
        let inner = self.inner();
        let me = self.id();
        let wait = inner.wait_interval();
        loop {
            {
                let inflight = inner.in_flight.lock();
                let mode = inner.config.read().latm_mode;
                let mut latm = inner.latm.lock();
                let victims = latm.conflicting(lock.id(), mode, &inflight, me);
                if victims.is_empty() {
                    return Drain::Clear;
                }
                if !requester_irrevocable && victims.iter().any(|v| v.kind().is_irrevocable()) {
                    debug!("{} backing off {}: irrevocable transaction in flight", me, lock.id());
                    return Drain::Irrevocable;
                }
                if mode != LatmMode::Tx {
                    latm.block(lock.id(), victims.iter().map(|v| v.thread()));
                    for victim in &victims {
                        victim.ctx.set_blocked(true);
                    }
                }
                let cm = inner.contention();
                let waited = started.elapsed().as_millis() as u64;
                for victim in &victims {
                    let info = victim.info();
                    if cm.allow_lock_to_abort_tx(waited, *aborted, requester_irrevocable, &info)
                        && inner.force(victim)
                    {
                        *aborted += 1;
                    }
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Drain::TimedOut;
            }
            std::thread::sleep(wait);
        }
    }
}

fn already_held(thread: ThreadId, lock: &TxLock) -> Error {
    Error::Usage(format!("{} already holds {}", thread, lock.id()))
}

fn timeout(lock: &TxLock, started: Instant) -> Error {
    Error::Timeout {
        lock: lock.id(),
        waited: started.elapsed(),
    }
}
