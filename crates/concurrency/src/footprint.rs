//! Per-thread footprint
//!
//! The part of a thread's bookkeeping other threads need to see: which
//! objects it has read (with the version observed) and which it is writing,
//! plus a [`ConflictFilter`] over each set. Committers inspect foreign
//! footprints to find the transactions their writes invalidate.
//!
//! A read entry keeps a type-erased handle so commit-time validation can
//! re-check the version and owner without knowing the value type.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use strata_core::{AnyObject, ConflictFilter, ObjectId, ThreadId};

struct ReadEntry {
    object: Arc<dyn AnyObject>,
    version: u64,
}

/// Read and write set of one thread's current transaction family
#[derive(Default)]
pub(crate) struct Footprint {
    reads: FxHashMap<ObjectId, ReadEntry>,
    writes: FxHashSet<ObjectId>,
    read_filter: ConflictFilter,
    write_filter: ConflictFilter,
}

impl Footprint {
    /// Record a read of `id` at `version`
    ///
    /// Only the first observation is kept: validation must compare against
    /// the oldest value the transaction could have acted on.
    pub fn record_read(
        &mut self,
        id: ObjectId,
        version: u64,
        object: impl FnOnce() -> Arc<dyn AnyObject>,
    ) {
        self.reads.entry(id).or_insert_with(|| ReadEntry {
            object: object(),
            version,
        });
        self.read_filter.insert(id);
    }

    /// Record that `id` is being written or deleted
    pub fn record_write(&mut self, id: ObjectId) {
        if self.writes.insert(id) {
            self.write_filter.insert(id);
        }
    }

    pub fn reads_len(&self) -> usize {
        self.reads.len()
    }

    pub fn writes_len(&self) -> usize {
        self.writes.len()
    }

    pub fn has_read(&self, id: ObjectId) -> bool {
        self.read_filter.exists(id) && self.reads.contains_key(&id)
    }

    pub fn has_write(&self, id: ObjectId) -> bool {
        self.write_filter.exists(id) && self.writes.contains(&id)
    }

    /// Whether this footprint touches anything in `writes`
    ///
    /// `filter` must cover `writes`; it rules out disjoint footprints
    /// before the precise walk.
    pub fn overlaps(&self, writes: &FxHashSet<ObjectId>, filter: &ConflictFilter) -> bool {
        if !filter.intersects(&self.read_filter) && !filter.intersects(&self.write_filter) {
            return false;
        }
        writes
            .iter()
            .any(|id| self.reads.contains_key(id) || self.writes.contains(id))
    }

    /// First read that is no longer valid for `thread`
    ///
    /// A read is stale when the object's version moved or another thread
    /// owns the object (its in-place value may be dirty).
    pub fn stale_read(&self, thread: ThreadId) -> Option<ObjectId> {
        self.reads.iter().find_map(|(id, entry)| {
            let header = entry.object.header();
            let foreign_owner = header.owner().is_some_and(|owner| owner != thread);
            (header.version() != entry.version || foreign_owner).then_some(*id)
        })
    }

    /// Copy of the write set and its filter for a commit-time scan
    pub fn write_snapshot(&self) -> (FxHashSet<ObjectId>, ConflictFilter) {
        (self.writes.clone(), self.write_filter.clone())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    pub fn clear(&mut self) {
        self.reads.clear();
        self.writes.clear();
        self.read_filter.clear();
        self.write_filter.clear();
    }
}

impl std::fmt::Debug for Footprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Footprint")
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}
