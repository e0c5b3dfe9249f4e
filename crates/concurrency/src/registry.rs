//! In-flight transaction registry
//!
//! Every live attempt has one [`TxRecord`] here while it is `InFlight`.
//! Committers, lock acquirers and promotions scan the registry to find the
//! transactions they conflict with; the forced-abort flag they set lives in
//! the victim thread's context.
//!
//! # Thread Safety
//!
//! The registry sits behind the engine's in-flight mutex. Forcing a
//! transaction and promoting one to irrevocable both happen under that
//! mutex, so a promotion can never race a force.

use crate::state::{TxInfo, TxKind};
use crate::thread::ThreadContext;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_core::{ThreadId, Timestamp, TxId};

/// Shared view of one in-flight attempt
#[derive(Debug)]
pub(crate) struct TxRecord {
    pub id: TxId,
    pub ctx: Arc<ThreadContext>,
    pub start: Timestamp,
    priority: AtomicUsize,
}

impl TxRecord {
    pub fn new(id: TxId, ctx: Arc<ThreadContext>, start: Timestamp, priority: usize) -> Self {
        Self {
            id,
            ctx,
            start,
            priority: AtomicUsize::new(priority),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.ctx.id()
    }

    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: usize) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn kind(&self) -> TxKind {
        self.ctx.kind()
    }

    /// Snapshot for the contention manager
    ///
    /// Locks the owning thread's footprint; callers must not hold another
    /// footprint lock.
    pub fn info(&self) -> TxInfo {
        let (reads, writes) = {
            let fp = self.ctx.footprint.lock();
            (fp.reads_len(), fp.writes_len())
        };
        TxInfo {
            id: self.id,
            thread: self.thread(),
            priority: self.priority(),
            reads,
            writes,
            commits: self.ctx.commits(),
            kind: self.kind(),
            start: self.start,
        }
    }
}

/// Map of in-flight attempts
#[derive(Debug, Default)]
pub(crate) struct InFlightRegistry {
    txs: FxHashMap<TxId, Arc<TxRecord>>,
}

impl InFlightRegistry {
    pub fn insert(&mut self, record: Arc<TxRecord>) {
        self.txs.insert(record.id, record);
    }

    pub fn remove(&mut self, id: TxId) -> Option<Arc<TxRecord>> {
        self.txs.remove(&id)
    }

    pub fn get(&self, id: TxId) -> Option<&Arc<TxRecord>> {
        self.txs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Earliest start among in-flight attempts
    pub fn oldest_start(&self) -> Option<Timestamp> {
        self.txs.values().map(|r| r.start).min()
    }

    /// Records belonging to threads other than `thread`
    pub fn others(&self, thread: ThreadId) -> impl Iterator<Item = &Arc<TxRecord>> {
        self.txs.values().filter(move |r| r.thread() != thread)
    }

    /// One record per other thread: the thread's outermost attempt
    ///
    /// Nested attempts share their thread's footprint and forced flag, so
    /// conflict decisions are made per thread.
    pub fn other_threads(&self, thread: ThreadId) -> Vec<Arc<TxRecord>> {
        let mut by_thread: FxHashMap<ThreadId, &Arc<TxRecord>> = FxHashMap::default();
        for record in self.others(thread) {
            by_thread
                .entry(record.thread())
                .and_modify(|current| {
                    if record.id < current.id {
                        *current = record;
                    }
                })
                .or_insert(record);
        }
        by_thread.into_values().cloned().collect()
    }

    /// An irrevocable attempt of another thread, if any
    #[cfg(test)]
    pub fn irrevocable_other(&self, thread: ThreadId) -> Option<TxId> {
        self.others(thread)
            .find(|r| r.kind().is_irrevocable())
            .map(|r| r.id)
    }

    /// Whether another thread runs an isolated transaction
    pub fn isolated_other(&self, thread: ThreadId) -> bool {
        self.others(thread)
            .any(|r| r.kind() == TxKind::IrrevocableAndIsolated)
    }

    /// Whether `thread` has an attempt in flight
    #[cfg(test)]
    pub fn has_thread(&self, thread: ThreadId) -> bool {
        self.txs.values().any(|r| r.thread() == thread)
    }

    /// Outermost in-flight attempt of `thread`
    pub fn outermost_of(&self, thread: ThreadId) -> Option<&Arc<TxRecord>> {
        self.txs
            .values()
            .filter(|r| r.thread() == thread)
            .min_by_key(|r| r.id)
    }
}
