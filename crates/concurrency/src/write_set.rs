//! Thread-private write set
//!
//! Only the owning thread touches these structures, so they live in the
//! `ThreadHandle` behind a `RefCell` rather than in the shared context.
//!
//! | Entry | Update policy | Holds | Commit | Abort |
//! |-------|---------------|-------|--------|-------|
//! | [`Staged`] | deferred | private copy (or deletion marker) | publish into the original | drop |
//! | [`Backup`] | direct | pre-write value | release ownership | restore, release |
//!
//! Staged copies sit in their own `Arc<RwLock<T>>` so that a transaction can
//! hold guards on several staged objects at once while the set itself is
//! only borrowed for the lookup.

use crate::config::CopySemantics;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::any::Any;
use std::sync::Arc;
use strata_core::{AnyObject, Error, ObjectId, Result, ThreadId, Transactable, TxObject};

/// Type-erased write-set entry
pub(crate) trait WriteEntry: Send {
    /// Type-erased handle to the target
    fn object(&self) -> Arc<dyn AnyObject>;

    /// Whether the entry deletes its target
    fn is_deleted(&self) -> bool;

    /// Whether the target changed since the entry was created
    fn is_stale(&self) -> bool;

    /// Make the entry's effect visible
    fn publish(&mut self, thread: ThreadId, copy: CopySemantics);

    /// Undo the entry's effect
    fn rollback(&mut self, thread: ThreadId);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Deferred-update entry: a private copy published at commit
pub(crate) struct Staged<T: Transactable> {
    target: TxObject<T>,
    // None marks a deletion
    cell: Option<Arc<RwLock<T>>>,
    base_version: u64,
}

impl<T: Transactable> Staged<T> {
    #[cfg(test)]
    pub fn new(target: TxObject<T>, value: T, base_version: u64) -> Self {
        Self::with_cell(target, Arc::new(RwLock::new(value)), base_version)
    }

    pub fn with_cell(target: TxObject<T>, cell: Arc<RwLock<T>>, base_version: u64) -> Self {
        Self {
            target,
            cell: Some(cell),
            base_version,
        }
    }

    pub fn deletion(target: TxObject<T>, base_version: u64) -> Self {
        Self {
            target,
            cell: None,
            base_version,
        }
    }

    pub fn cell(&self) -> Option<&Arc<RwLock<T>>> {
        self.cell.as_ref()
    }

    pub fn mark_deleted(&mut self) {
        self.cell = None;
    }
}

impl<T: Transactable> WriteEntry for Staged<T> {
    fn object(&self) -> Arc<dyn AnyObject> {
        self.target.erased()
    }

    fn is_deleted(&self) -> bool {
        self.cell.is_none()
    }

    fn is_stale(&self) -> bool {
        self.target.header().version() != self.base_version
    }

    fn publish(&mut self, _thread: ThreadId, copy: CopySemantics) {
        let mut live = self.target.write_live();
        match self.cell.take() {
            Some(cell) => match copy {
                CopySemantics::Copy => live.copy_state(&cell.read()),
                CopySemantics::Move => *live = cell.write().take_state(),
            },
            None => self.target.header().mark_retired(),
        }
        self.target.header().bump_version();
    }

    fn rollback(&mut self, _thread: ThreadId) {
        self.cell = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Direct-update entry: the pre-write value kept for rollback
pub(crate) struct Backup<T: Transactable> {
    target: TxObject<T>,
    original: Option<T>,
    deleted: bool,
}

impl<T: Transactable> Backup<T> {
    /// Entry for an object about to be mutated in place
    pub fn of_value(target: TxObject<T>, original: T) -> Self {
        Self {
            target,
            original: Some(original),
            deleted: false,
        }
    }

    /// Entry for an object deleted without being written
    pub fn deletion(target: TxObject<T>) -> Self {
        Self {
            target,
            original: None,
            deleted: true,
        }
    }

    pub fn has_backup(&self) -> bool {
        self.original.is_some()
    }

    pub fn set_backup(&mut self, original: T) {
        self.original = Some(original);
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

impl<T: Transactable> WriteEntry for Backup<T> {
    fn object(&self) -> Arc<dyn AnyObject> {
        self.target.erased()
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn is_stale(&self) -> bool {
        false
    }

    fn publish(&mut self, thread: ThreadId, _copy: CopySemantics) {
        let header = self.target.header();
        let changed = self.original.take().is_some();
        if self.deleted {
            header.mark_retired();
        }
        if changed || self.deleted {
            header.bump_version();
        }
        // version first: a reader must never see the object unowned with its old version
        header.release(thread);
    }

    fn rollback(&mut self, thread: ThreadId) {
        if let Some(original) = self.original.take() {
            let mut live = self.target.write_live();
            *live = original;
            self.target.header().bump_version();
        }
        self.target.header().release(thread);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An object allocated by the current transaction family
pub(crate) struct NewObject {
    pub object: Arc<dyn AnyObject>,
    /// Deleted again before commit
    pub discarded: bool,
}

/// Everything the owning thread buffers for its current transaction family
#[derive(Default)]
pub(crate) struct LocalSets {
    writes: FxHashMap<ObjectId, Box<dyn WriteEntry>>,
    new_objects: FxHashMap<ObjectId, NewObject>,
    deleted: FxHashSet<ObjectId>,
}

fn type_mismatch(id: ObjectId) -> Error {
    Error::InvalidState(format!("write-set entry for {} has an unexpected type", id))
}

impl LocalSets {
    pub fn insert(&mut self, id: ObjectId, entry: Box<dyn WriteEntry>) {
        self.writes.insert(id, entry);
    }

    pub fn staged<T: Transactable>(&self, id: ObjectId) -> Result<Option<&Staged<T>>> {
        match self.writes.get(&id) {
            Some(entry) => entry
                .as_any()
                .downcast_ref::<Staged<T>>()
                .map(Some)
                .ok_or_else(|| type_mismatch(id)),
            None => Ok(None),
        }
    }

    pub fn staged_mut<T: Transactable>(&mut self, id: ObjectId) -> Result<Option<&mut Staged<T>>> {
        match self.writes.get_mut(&id) {
            Some(entry) => entry
                .as_any_mut()
                .downcast_mut::<Staged<T>>()
                .map(Some)
                .ok_or_else(|| type_mismatch(id)),
            None => Ok(None),
        }
    }

    pub fn backup_mut<T: Transactable>(&mut self, id: ObjectId) -> Result<Option<&mut Backup<T>>> {
        match self.writes.get_mut(&id) {
            Some(entry) => entry
                .as_any_mut()
                .downcast_mut::<Backup<T>>()
                .map(Some)
                .ok_or_else(|| type_mismatch(id)),
            None => Ok(None),
        }
    }

    pub fn add_new(&mut self, object: Arc<dyn AnyObject>) {
        let id = object.header().id();
        self.new_objects.insert(
            id,
            NewObject {
                object,
                discarded: false,
            },
        );
    }

    pub fn is_own_new(&self, id: ObjectId) -> bool {
        self.new_objects.contains_key(&id)
    }

    /// Delete an object this family allocated; returns false if it is not one
    pub fn discard_new(&mut self, id: ObjectId) -> bool {
        match self.new_objects.get_mut(&id) {
            Some(entry) => {
                entry.discarded = true;
                self.deleted.insert(id);
                true
            }
            None => false,
        }
    }

    pub fn mark_deleted(&mut self, id: ObjectId) {
        self.deleted.insert(id);
    }

    pub fn is_deleted(&self, id: ObjectId) -> bool {
        self.deleted.contains(&id)
    }

    /// No writes, deletions or allocations
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.new_objects.is_empty()
    }

    /// First entry whose target moved since it was staged
    pub fn stale_write(&self) -> Option<ObjectId> {
        self.writes
            .iter()
            .find_map(|(id, entry)| entry.is_stale().then_some(*id))
    }

    /// Publish every entry; returns the objects to queue for reclamation
    pub fn publish(&mut self, thread: ThreadId, copy: CopySemantics) -> Vec<Arc<dyn AnyObject>> {
        let mut retired = Vec::new();
        for (_, mut entry) in self.writes.drain() {
            entry.publish(thread, copy);
            if entry.is_deleted() {
                retired.push(entry.object());
            }
        }
        for (_, new) in self.new_objects.drain() {
            if new.discarded {
                new.object.reclaim();
            } else {
                new.object.header().publish_new(thread);
            }
        }
        self.deleted.clear();
        retired
    }

    /// Undo every entry and destroy allocations
    pub fn rollback(&mut self, thread: ThreadId) {
        for (_, mut entry) in self.writes.drain() {
            entry.rollback(thread);
        }
        for (_, new) in self.new_objects.drain() {
            new.object.reclaim();
        }
        self.deleted.clear();
    }
}
