//! Transactions
//!
//! A [`Transaction`] is one attempt at running a block of reads and writes
//! atomically. Its life cycle:
//!
//! ```text
//! NoState --begin--> InFlight --end--> Committed
//!                       |        \---> HandOff   (nested: outer still in flight)
//!                       \--abort/failure--> Aborted --restart--> InFlight
//! ```
//!
//! # Failures and rollback
//!
//! A conflict detected inside `read`, `write`, `delete_memory` or a
//! promotion does not roll back on the spot: guards handed out earlier may
//! still be alive. The thread is marked doomed and the call returns
//! `Error::Aborted`. Every later operation fails the same way, and the
//! rollback runs in `end()`, `restart()`, `abort()` or on drop, all of which
//! take `&mut self` and therefore run with no guard outstanding.
//!
//! # Nesting
//!
//! Transactions of one thread nest by flattening: they share the thread's
//! read, write, new and deleted sets. Ending an inner transaction hands off
//! to the outer one; aborting it dooms the outer one as well.

use crate::access::{TxMut, TxRef};
use crate::config::{CommitValidation, ConflictDetection, LatmMode, TxPolicy, UpdatePolicy};
use crate::contention::ContentionManager;
use crate::latm::TxLock;
use crate::registry::TxRecord;
use crate::state::{TxInfo, TxKind, TxState};
use crate::thread::ThreadHandle;
use crate::write_set::{Backup, Staged};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    AbortReason, Error, LockId, ObjectHeader, ObjectId, Result, ThreadId, Transactable, TxId,
    TxObject,
};
use tracing::{debug, trace};

#[derive(Clone, Copy)]
enum Access {
    Write,
    Delete,
}

impl Access {
    fn conflict(self, id: ObjectId) -> AbortReason {
        match self {
            Access::Write => AbortReason::WriteConflict(id),
            Access::Delete => AbortReason::DeleteConflict(id),
        }
    }
}

/// What screening found out about an object
enum Target {
    /// Allocated by this thread's current transaction family
    OwnNew,
    /// Committed shared object
    Shared,
}

/// A transaction attempt bound to a [`ThreadHandle`]
///
/// Guards returned by [`read`](Transaction::read) and
/// [`write`](Transaction::write) borrow the transaction; `end`, `restart`,
/// `abort` and promotions need them dropped first.
pub struct Transaction<'h> {
    handle: &'h ThreadHandle,
    id: TxId,
    state: TxState,
    record: Option<Arc<TxRecord>>,
    policy: TxPolicy,
    priority: Cell<usize>,
    declared: RefCell<SmallVec<[LockId; 4]>>,
}

impl<'h> Transaction<'h> {
    /// Create and begin a transaction on `handle`
    pub fn new(handle: &'h ThreadHandle) -> Result<Self> {
        let mut tx = Self::unstarted(handle);
        tx.begin()?;
        Ok(tx)
    }

    /// Create a transaction without beginning it
    pub fn unstarted(handle: &'h ThreadHandle) -> Self {
        let policy = TxPolicy::from(&*handle.inner().config.read());
        Self {
            handle,
            id: TxId::from_raw(0),
            state: TxState::NoState,
            record: None,
            policy,
            priority: Cell::new(0),
            declared: RefCell::new(SmallVec::new()),
        }
    }

    /// Id of the current (or last) attempt
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Thread running the transaction
    pub fn thread(&self) -> ThreadId {
        self.handle.id()
    }

    /// Life-cycle state
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Whether the transaction is in flight
    pub fn is_in_flight(&self) -> bool {
        self.state.is_in_flight()
    }

    /// Protection level of the thread's transaction family
    pub fn kind(&self) -> TxKind {
        self.handle.ctx.kind()
    }

    /// Current priority; persists across restarts
    pub fn priority(&self) -> usize {
        match &self.record {
            Some(record) => record.priority(),
            None => self.priority.get(),
        }
    }

    /// Set the priority seen by the contention manager
    pub fn set_priority(&self, priority: usize) {
        self.priority.set(priority);
        if let Some(record) = &self.record {
            record.set_priority(priority);
        }
    }

    /// Increase the priority by one
    pub fn raise_priority(&self) {
        self.set_priority(self.priority().saturating_add(1));
    }

    /// Snapshot handed to the contention manager
    pub fn info(&self) -> Option<TxInfo> {
        self.record.as_ref().map(|r| r.info())
    }

    /// Begin the transaction
    ///
    /// Waits while LATM keeps this thread out or another thread runs an
    /// isolated transaction. A transaction begun while another of the same
    /// thread is in flight nests inside it and never waits.
    pub fn begin(&mut self) -> Result<()> {
        if self.state.is_in_flight() {
            return Err(Error::AlreadyInFlight(self.id));
        }
        let handle = self.handle;
        let inner = handle.inner();
        let ctx = &handle.ctx;
        let me = ctx.id();
        let nested = ctx.depth() > 0;
        let declared = self.declared.borrow().clone();

        loop {
            if !nested && ctx.is_blocked() {
                std::thread::sleep(inner.wait_interval());
                continue;
            }
            let mut inflight = inner.in_flight.lock();
            let policy = TxPolicy::from(&*inner.config.read());
            let mut latm = inner.latm.lock();
            if !nested {
                let blocked = ctx.is_blocked()
                    || inflight.isolated_other(me)
                    || latm.blocking_lock(policy.latm, me, &declared).is_some();
                if blocked {
                    drop(latm);
                    drop(inflight);
                    std::thread::sleep(policy.wait);
                    continue;
                }
                ctx.clear_forced();
                ctx.clear_doom();
            }

            let id = TxId::from_raw(inner.tx_ids.allocate());
            let start = inner.clock.tick();
            let record = Arc::new(TxRecord::new(id, Arc::clone(ctx), start, self.priority.get()));
            inflight.insert(Arc::clone(&record));
            latm.register_tx(id, &declared);
            ctx.push_tx(id);
            drop(latm);
            drop(inflight);

            self.id = id;
            self.record = Some(record);
            self.policy = policy;
            self.state = TxState::InFlight;
            trace!("{} began on {} (depth {})", id, me, ctx.depth());
            return Ok(());
        }
    }

    /// Commit, or hand off to the enclosing transaction when nested
    ///
    /// On failure the attempt is rolled back and `Error::Aborted` returned.
    pub fn end(&mut self) -> Result<()> {
        let record = self.live_record()?;
        let handle = self.handle;
        let inner = handle.inner();
        let ctx = &handle.ctx;

        if let Some(reason) = ctx.pending_abort() {
            return Err(self.abort_with(reason));
        }
        if ctx.depth() > 1 {
            self.leave(TxState::HandOff);
            inner.stats.record_handoff();
            trace!("{} handed off", record.id);
            return Ok(());
        }

        let cm = inner.contention();
        if cm.abort_before_commit(&record.info()) {
            return Err(self.abort_with(AbortReason::CommitVetoed));
        }
        let irrevocable = ctx.kind().is_irrevocable();
        match self.commit(&record, cm.as_ref()) {
            Ok(read_only) => {
                self.leave(TxState::Committed);
                inner.stats.record_commit(read_only, irrevocable);
                ctx.record_commit();
                debug!("{} committed on {}", record.id, ctx.id());
                inner.reclaim();
                Ok(())
            }
            Err(reason) => Err(self.abort_with(reason)),
        }
    }

    /// Abort the attempt explicitly
    pub fn abort(&mut self) -> Result<()> {
        self.live_record()?;
        self.abort_with(AbortReason::Explicit);
        Ok(())
    }

    /// Abort if in flight, then begin a fresh attempt
    ///
    /// Fails with `NestedRestart` when another transaction of this thread
    /// is still in flight: the enclosing transaction has to retry instead.
    pub fn restart(&mut self) -> Result<()> {
        if self.state.is_in_flight() {
            let reason = self
                .handle
                .ctx
                .pending_abort()
                .unwrap_or(AbortReason::Explicit);
            self.abort_with(reason);
        }
        if self.handle.ctx.depth() > 0 {
            return Err(Error::NestedRestart {
                thread: self.handle.id(),
            });
        }
        self.begin()
    }

    /// Ask this transaction to abort; refused when irrevocable
    pub fn force_to_abort(&self) -> bool {
        if !self.state.is_in_flight() {
            return false;
        }
        let _inflight = self.handle.inner().in_flight.lock();
        self.handle.ctx.force_abort()
    }

    /// Become irrevocable: immune to forced aborts
    ///
    /// Waits until no other thread's transaction is irrevocable. Fails with
    /// an abort if the transaction was forced or its reads went stale.
    /// Idempotent.
    pub fn make_irrevocable(&mut self) -> Result<()> {
        let record = self.checked_record()?;
        self.handle.promote(&record, TxKind::Irrevocable, None).map(drop)
    }

    /// Become irrevocable and force every other thread's transaction out
    ///
    /// Other threads cannot begin transactions until this one ends.
    /// Idempotent.
    pub fn make_isolated(&mut self) -> Result<()> {
        let record = self.checked_record()?;
        self.handle.promote(&record, TxKind::IrrevocableAndIsolated, None).map(drop)
    }

    /// Declare that this transaction conflicts with `lock` (`Tx` LATM mode)
    ///
    /// The declaration persists across restarts. Declaring a lock another
    /// thread holds aborts the attempt; the retry waits for the lock.
    pub fn declare_conflicting_lock(&self, lock: &TxLock) -> Result<()> {
        let id = lock.id();
        {
            let mut declared = self.declared.borrow_mut();
            if declared.contains(&id) {
                return Ok(());
            }
            declared.push(id);
        }
        if !self.state.is_in_flight() {
            return Ok(());
        }
        let inner = self.handle.inner();
        let me = self.handle.id();
        let mut latm = inner.latm.lock();
        latm.register_tx(self.id, &[id]);
        let held_elsewhere = latm.holder(id).is_some_and(|holder| holder != me);
        drop(latm);
        if self.policy.latm == LatmMode::Tx && held_elsewhere {
            return Err(self.handle.doom(AbortReason::LockConflict(id)));
        }
        Ok(())
    }

    /// Acquire `lock` from inside the transaction
    ///
    /// Promotes the transaction first; see [`ThreadHandle::lock`].
    pub fn lock(&mut self, lock: &TxLock) -> Result<()> {
        self.checked_record()?;
        self.handle.lock(lock)
    }

    /// See [`ThreadHandle::lock_for`]
    pub fn lock_for(&mut self, lock: &TxLock, timeout: Duration) -> Result<()> {
        self.checked_record()?;
        self.handle.lock_for(lock, timeout)
    }

    /// See [`ThreadHandle::try_lock`]
    pub fn try_lock(&mut self, lock: &TxLock) -> Result<bool> {
        self.checked_record()?;
        self.handle.try_lock(lock)
    }

    /// Release a lock before the transaction ends
    pub fn unlock(&mut self, lock: &TxLock) -> Result<()> {
        self.handle.unlock(lock)
    }

    /// Shared access to `object`
    ///
    /// Returns this thread's staged copy if it has one, the live value
    /// otherwise.
    pub fn read<'a, T: Transactable>(&'a self, object: &'a TxObject<T>) -> Result<TxRef<'a, T>> {
        let record = self.checked_record()?;
        trace!("{} read {}", self.id, object.id());
        match self.screen(&record, object.header())? {
            Target::OwnNew => self.read_own_new(object),
            Target::Shared => match self.policy.update {
                UpdatePolicy::Deferred => self.read_deferred(object),
                UpdatePolicy::Direct => self.read_direct(&record, object),
            },
        }
    }

    /// Exclusive access to `object`
    ///
    /// Deferred updating hands out a private copy published at commit;
    /// direct updating takes ownership of the object and mutates it in
    /// place.
    pub fn write<'a, T: Transactable>(&'a self, object: &'a TxObject<T>) -> Result<TxMut<'a, T>> {
        let record = self.checked_record()?;
        trace!("{} write {}", self.id, object.id());
        match self.screen(&record, object.header())? {
            Target::OwnNew => self.write_own_new(object),
            Target::Shared => match self.policy.update {
                UpdatePolicy::Deferred => self.write_deferred(object),
                UpdatePolicy::Direct => self.write_direct(&record, object),
            },
        }
    }

    /// Delete `object` when the transaction commits
    ///
    /// Deleting twice is a no-op. Deleting an object this transaction
    /// family allocated discards it.
    pub fn delete_memory<T: Transactable>(&self, object: &TxObject<T>) -> Result<()> {
        let record = self.checked_record()?;
        let id = object.id();
        let handle = self.handle;
        if handle.local.borrow().is_deleted(id) {
            return Ok(());
        }
        if handle.borrows.is_borrowed(id) {
            return Err(already_borrowed(id));
        }
        if let Target::OwnNew = self.screen(&record, object.header())? {
            handle.local.borrow_mut().discard_new(id);
            trace!("{} discarded new {}", self.id, id);
            return Ok(());
        }

        match self.policy.update {
            UpdatePolicy::Direct => {
                self.acquire_ownership(&record, object.header(), Access::Delete)?;
                let mut local = handle.local.borrow_mut();
                match local.backup_mut::<T>(id)? {
                    Some(entry) => entry.mark_deleted(),
                    None => local.insert(id, Box::new(Backup::deletion(object.clone()))),
                }
                local.mark_deleted(id);
            }
            UpdatePolicy::Deferred => {
                let mut local = handle.local.borrow_mut();
                match local.staged_mut::<T>(id)? {
                    Some(entry) => entry.mark_deleted(),
                    None => {
                        let base = object.header().version();
                        local.insert(id, Box::new(Staged::deletion(object.clone(), base)));
                    }
                }
                local.mark_deleted(id);
            }
        }
        handle.ctx.footprint.lock().record_write(id);
        trace!("{} deleted {}", self.id, id);
        Ok(())
    }

    /// Allocate a default-initialized object
    ///
    /// Invisible to other threads until the transaction commits; destroyed
    /// if it aborts.
    pub fn new_memory<T: Transactable + Default>(&self) -> Result<TxObject<T>> {
        self.new_memory_copy(T::default())
    }

    /// Allocate an object holding `value`
    pub fn new_memory_copy<T: Transactable>(&self, value: T) -> Result<TxObject<T>> {
        self.checked_record()?;
        let object = TxObject::new_uncommitted(value, self.handle.id());
        self.handle.local.borrow_mut().add_new(object.erased());
        trace!("{} allocated {}", self.id, object.id());
        Ok(object)
    }

    /// Allocate an object meant to be linked into shared structures
    ///
    /// Same as [`new_memory_copy`](Transaction::new_memory_copy).
    pub fn new_shared_memory<T: Transactable>(&self, value: T) -> Result<TxObject<T>> {
        self.new_memory_copy(value)
    }

    // ========================================================================
    // Life-cycle internals
    // ========================================================================

    fn live_record(&self) -> Result<Arc<TxRecord>> {
        match &self.record {
            Some(record) if self.state.is_in_flight() => Ok(Arc::clone(record)),
            _ => Err(Error::NotInFlight(self.id)),
        }
    }

    /// In-flight record, or the pending abort as an error
    fn checked_record(&self) -> Result<Arc<TxRecord>> {
        let record = self.live_record()?;
        self.handle.check_pending()?;
        Ok(record)
    }

    fn check_live(&self) -> Result<()> {
        self.checked_record().map(drop)
    }

    /// Validate and publish; returns whether the commit was read-only
    fn commit(
        &self,
        record: &TxRecord,
        cm: &dyn ContentionManager,
    ) -> std::result::Result<bool, AbortReason> {
        let handle = self.handle;
        let inner = handle.inner();
        let ctx = &handle.ctx;
        let me = ctx.id();
        let irrevocable = ctx.kind().is_irrevocable();
        let mut local = handle.local.borrow_mut();

        let _general = inner.general.lock();
        if !irrevocable {
            if let Some(reason) = ctx.pending_abort() {
                return Err(reason);
            }
            if let Some(id) = ctx.footprint.lock().stale_read(me) {
                return Err(AbortReason::ValidationFailed(id));
            }
            if let Some(id) = local.stale_write() {
                return Err(AbortReason::ValidationFailed(id));
            }
        }
        if local.is_read_only() {
            return Ok(true);
        }

        let my_info = record.info();
        {
            let inflight = inner.in_flight.lock();
            if let Some(reason) = ctx.pending_abort() {
                return Err(reason);
            }
            let (writes, filter) = ctx.footprint.lock().write_snapshot();
            let mut victims = Vec::new();
            for other in inflight.other_threads(me) {
                let overlaps = other.ctx.footprint.lock().overlaps(&writes, &filter);
                if !overlaps {
                    continue;
                }
                if other.kind().is_irrevocable() {
                    return Err(AbortReason::IrrevocableConflict(other.id));
                }
                victims.push(other);
            }
            if self.policy.validation == CommitValidation::Invalidation && !victims.is_empty() {
                let infos: Vec<TxInfo> = victims.iter().map(|v| v.info()).collect();
                if !irrevocable && !cm.permission_to_abort_all(&my_info, &infos) {
                    return Err(AbortReason::PermissionDenied);
                }
                for victim in &victims {
                    inner.force(victim);
                }
            }
        }

        // outside in_flight: publication may wait for readers' guards
        let retired = local.publish(me, self.policy.copy);
        if !retired.is_empty() {
            let ts = inner.clock.tick();
            for obj in &retired {
                obj.header().record_retirement(ts);
            }
            debug!("{} queued {} objects for reclamation at {}", record.id, retired.len(), ts);
            inner.deletions.lock().push(ts, retired);
        }
        Ok(false)
    }

    /// Roll back (or doom the enclosing transaction) and leave
    fn abort_with(&mut self, reason: AbortReason) -> Error {
        let handle = self.handle;
        let inner = handle.inner();
        let ctx = &handle.ctx;
        let nested = ctx.depth() > 1;
        if nested {
            ctx.doom(AbortReason::NestedAbort);
        } else {
            handle.local.borrow_mut().rollback(ctx.id());
        }
        inner.stats.record_abort();
        ctx.record_abort();
        debug!("{} on {} aborted: {}", self.id, ctx.id(), reason);
        self.leave(TxState::Aborted);
        if !nested {
            inner.reclaim();
        }
        Error::Aborted(reason)
    }

    /// Leave the in-flight registry and settle in `outcome`
    fn leave(&mut self, outcome: TxState) {
        let Some(record) = self.record.take() else {
            self.state = outcome;
            return;
        };
        self.priority.set(record.priority());
        let handle = self.handle;
        let inner = handle.inner();
        let ctx = &handle.ctx;

        let outermost = {
            let mut inflight = inner.in_flight.lock();
            let mut latm = inner.latm.lock();
            inflight.remove(record.id);
            latm.unregister_tx(record.id, &self.declared.borrow());
            ctx.pop_tx(record.id);
            let outermost = ctx.depth() == 0;
            if outermost {
                if ctx.kind().is_irrevocable() {
                    inner
                        .irrevocable
                        .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                }
                ctx.set_kind(TxKind::Normal);
                ctx.clear_forced();
                ctx.clear_doom();
                ctx.footprint.lock().clear();
            }
            outermost
        };
        if outermost {
            handle.release_obtained_locks();
        }
        self.state = outcome;
    }

    // ========================================================================
    // Access internals
    // ========================================================================

    /// Reject unusable objects and wait out other threads' new ones
    fn screen(&self, record: &TxRecord, header: &ObjectHeader) -> Result<Target> {
        let id = header.id();
        {
            let local = self.handle.local.borrow();
            if local.is_deleted(id) {
                return Err(Error::Deleted(id));
            }
            if local.is_own_new(id) {
                return Ok(Target::OwnNew);
            }
        }
        if header.is_new() {
            self.wait_foreign_new(record, header)?;
        }
        if header.is_reclaimed() {
            return Err(Error::Reclaimed(id));
        }
        if header.is_retired() {
            if header.retired_at().is_some_and(|at| record.start > at) {
                // began after the delete: every retry would land here again
                return Err(Error::Retired(id));
            }
            // deleted by a commit this attempt has not serialized after
            return Err(self.handle.doom(AbortReason::ValidationFailed(id)));
        }
        Ok(Target::Shared)
    }

    fn wait_foreign_new(&self, record: &TxRecord, header: &ObjectHeader) -> Result<()> {
        let id = header.id();
        while header.is_new() && !header.is_reclaimed() {
            let info = record.info();
            if self.handle.inner().contention().abort_on_new(&info, id) {
                return Err(self.handle.doom(AbortReason::NewObjectConflict(id)));
            }
            std::thread::sleep(self.policy.wait);
            self.check_live()?;
        }
        Ok(())
    }

    fn record_read<T: Transactable>(&self, object: &TxObject<T>) {
        let version = object.header().version();
        self.handle
            .ctx
            .footprint
            .lock()
            .record_read(object.id(), version, || object.erased());
    }

    fn read_own_new<'a, T: Transactable>(&'a self, object: &'a TxObject<T>) -> Result<TxRef<'a, T>> {
        let id = object.id();
        let borrow = self.handle.borrows.shared(id).ok_or_else(|| already_borrowed(id))?;
        let guard = object
            .try_read_live_for(self.policy.wait)
            .ok_or_else(|| already_borrowed(id))?;
        Ok(TxRef::live(guard, borrow))
    }

    fn write_own_new<'a, T: Transactable>(&'a self, object: &'a TxObject<T>) -> Result<TxMut<'a, T>> {
        let id = object.id();
        let borrow = self.handle.borrows.exclusive(id).ok_or_else(|| already_borrowed(id))?;
        let guard = object
            .try_write_live_for(self.policy.wait)
            .ok_or_else(|| already_borrowed(id))?;
        Ok(TxMut::live(guard, borrow))
    }

    fn read_deferred<'a, T: Transactable>(&'a self, object: &'a TxObject<T>) -> Result<TxRef<'a, T>> {
        let id = object.id();
        let staged = self
            .handle
            .local
            .borrow()
            .staged::<T>(id)?
            .and_then(|entry| entry.cell().cloned());
        match staged {
            Some(cell) => cell
                .try_read_arc()
                .map(TxRef::staged)
                .ok_or_else(|| already_borrowed(id)),
            None => self.read_shared(object, false),
        }
    }

    fn read_direct<'a, T: Transactable>(
        &'a self,
        record: &TxRecord,
        object: &'a TxObject<T>,
    ) -> Result<TxRef<'a, T>> {
        let id = object.id();
        let me = self.handle.id();
        let foreign = object.header().owner().is_some_and(|owner| owner != me);
        if foreign
            && self.policy.detection == ConflictDetection::Early
            && !self.kind().is_irrevocable()
        {
            let info = record.info();
            if self.handle.inner().contention().abort_on_read(&info, id) {
                return Err(self.handle.doom(AbortReason::ReadConflict(id)));
            }
        }
        self.read_shared(object, true)
    }

    /// Live read recorded in the read set
    ///
    /// Irrevocable transactions read under the general lock so no commit
    /// publishes underneath them; in direct mode they first push any owner
    /// out of the way.
    fn read_shared<'a, T: Transactable>(
        &'a self,
        object: &'a TxObject<T>,
        direct: bool,
    ) -> Result<TxRef<'a, T>> {
        let handle = self.handle;
        let inner = handle.inner();
        let me = handle.id();
        let id = object.id();
        let borrow = handle.borrows.shared(id).ok_or_else(|| already_borrowed(id))?;

        loop {
            if handle.ctx.kind().is_irrevocable() {
                let general = inner.general.lock();
                let owner = object.header().owner().filter(|o| direct && *o != me);
                if let Some(owner) = owner {
                    drop(general);
                    handle.force_thread(owner);
                    std::thread::sleep(self.policy.wait);
                    self.check_live()?;
                    continue;
                }
                let guard = object.read_live();
                self.record_read(object);
                drop(general);
                return Ok(TxRef::live(guard, borrow));
            }
            if !direct {
                let guard = object.read_live();
                self.record_read(object);
                return Ok(TxRef::live(guard, borrow));
            }
            match object.try_read_live_for(self.policy.wait) {
                Some(guard) => {
                    self.record_read(object);
                    return Ok(TxRef::live(guard, borrow));
                }
                None => self.check_live()?,
            }
        }
    }

    fn write_deferred<'a, T: Transactable>(&'a self, object: &'a TxObject<T>) -> Result<TxMut<'a, T>> {
        let handle = self.handle;
        let id = object.id();
        let staged = handle
            .local
            .borrow()
            .staged::<T>(id)?
            .and_then(|entry| entry.cell().cloned());
        if let Some(cell) = staged {
            return cell
                .try_write_arc()
                .map(TxMut::staged)
                .ok_or_else(|| already_borrowed(id));
        }

        let (copy, base) = {
            let _general = self
                .kind()
                .is_irrevocable()
                .then(|| handle.inner().general.lock());
            let live = object.read_live();
            (live.clone_state(), object.header().version())
        };
        let cell = Arc::new(RwLock::new(copy));
        let guard = cell.write_arc();
        handle
            .local
            .borrow_mut()
            .insert(id, Box::new(Staged::with_cell(object.clone(), cell, base)));
        handle.ctx.footprint.lock().record_write(id);
        Ok(TxMut::staged(guard))
    }

    fn write_direct<'a, T: Transactable>(
        &'a self,
        record: &TxRecord,
        object: &'a TxObject<T>,
    ) -> Result<TxMut<'a, T>> {
        let handle = self.handle;
        let id = object.id();
        // before ownership: a refused borrow must not leave the object owned
        let borrow = handle.borrows.exclusive(id).ok_or_else(|| already_borrowed(id))?;
        self.acquire_ownership(record, object.header(), Access::Write)?;
        // only dirty readers of other threads can be in the way
        let guard = loop {
            match object.try_write_live_for(self.policy.wait) {
                Some(guard) => break guard,
                None => self.check_live()?,
            }
        };
        {
            let mut local = handle.local.borrow_mut();
            match local.backup_mut::<T>(id)? {
                Some(entry) => {
                    if !entry.has_backup() {
                        entry.set_backup(guard.clone_state());
                    }
                }
                None => local.insert(id, Box::new(Backup::of_value(object.clone(), guard.clone_state()))),
            }
        }
        handle.ctx.footprint.lock().record_write(id);
        Ok(TxMut::live(guard, borrow))
    }

    /// Take exclusive ownership of an object for direct updating
    fn acquire_ownership(&self, record: &TxRecord, header: &ObjectHeader, access: Access) -> Result<()> {
        let handle = self.handle;
        let inner = handle.inner();
        let me = handle.id();
        loop {
            let acquired = {
                let _general = inner.general.lock();
                if let Some(tx) = self.irrevocable_user(header.id()) {
                    return Err(handle.doom(AbortReason::IrrevocableConflict(tx)));
                }
                header.try_acquire(me)
            };
            match acquired {
                Ok(()) => return Ok(()),
                Err(owner) => self.contend_for(record, header.id(), owner, access)?,
            }
        }
    }

    /// Irrevocable transaction of another thread that touched `id`
    ///
    /// Caller holds the general lock.
    fn irrevocable_user(&self, id: ObjectId) -> Option<TxId> {
        let inner = self.handle.inner();
        if self.kind().is_irrevocable()
            || inner.irrevocable.load(std::sync::atomic::Ordering::Acquire) == 0
        {
            return None;
        }
        let inflight = inner.in_flight.lock();
        inflight
            .other_threads(self.handle.id())
            .into_iter()
            .filter(|r| r.kind().is_irrevocable())
            .find(|r| {
                let fp = r.ctx.footprint.lock();
                fp.has_read(id) || fp.has_write(id)
            })
            .map(|r| r.id)
    }

    /// One round of a direct-mode ownership conflict with `owner`
    fn contend_for(&self, record: &TxRecord, id: ObjectId, owner: ThreadId, access: Access) -> Result<()> {
        let handle = self.handle;
        let inner = handle.inner();
        let me = handle.id();

        if handle.ctx.kind().is_irrevocable() {
            handle.force_thread(owner);
        } else {
            // a dirty read already dooms this attempt; do not wait on its writer
            if let Some(stale) = handle.ctx.footprint.lock().stale_read(me) {
                return Err(handle.doom(AbortReason::ValidationFailed(stale)));
            }
            let cm = inner.contention();
            let info = record.info();
            let abort_me = match access {
                Access::Write => cm.abort_on_write(&info, id),
                Access::Delete => cm.abort_on_delete(&info, id),
            };
            if abort_me {
                return Err(handle.doom(access.conflict(id)));
            }
            let inflight = inner.in_flight.lock();
            if let Some(victim) = inflight.outermost_of(owner) {
                if victim.kind().is_irrevocable() {
                    let tx = victim.id;
                    drop(inflight);
                    return Err(handle.doom(AbortReason::IrrevocableConflict(tx)));
                }
                if !cm.permission_to_abort(&info, &victim.info()) {
                    drop(inflight);
                    return Err(handle.doom(access.conflict(id)));
                }
                inner.force(victim);
            }
        }
        std::thread::sleep(self.policy.wait);
        self.check_live()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state.is_in_flight() {
            self.abort_with(AbortReason::Dropped);
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("thread", &self.handle.id())
            .field("state", &self.state)
            .field("kind", &self.kind())
            .field("priority", &self.priority())
            .finish()
    }
}

fn already_borrowed(id: ObjectId) -> Error {
    Error::Usage(format!("{} is already borrowed by this transaction", id))
}
