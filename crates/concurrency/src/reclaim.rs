//! Epoch-based reclamation
//!
//! Committed deletions are not freed on the spot: a transaction that began
//! before the deletion may still hold a handle it obtained from the old
//! object graph. Deleted objects wait in a [`DeletionBuffer`] keyed by the
//! logical timestamp of the deleting commit and are reclaimed once every
//! in-flight transaction started after that timestamp.

use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::{AnyObject, Timestamp};

/// Timestamp-ordered queue of retired objects
#[derive(Default)]
pub(crate) struct DeletionBuffer {
    pending: BTreeMap<Timestamp, Vec<Arc<dyn AnyObject>>>,
    len: usize,
}

impl DeletionBuffer {
    /// Queue `objects`, deleted by a commit at `ts`
    pub fn push(&mut self, ts: Timestamp, objects: Vec<Arc<dyn AnyObject>>) {
        if objects.is_empty() {
            return;
        }
        self.len += objects.len();
        self.pending.entry(ts).or_default().extend(objects);
    }

    /// Remove everything no in-flight transaction can still reach
    ///
    /// `oldest_start` is the earliest start timestamp among in-flight
    /// transactions, `None` when nothing is in flight.
    pub fn collect(&mut self, oldest_start: Option<Timestamp>) -> Vec<Arc<dyn AnyObject>> {
        let ready = match oldest_start {
            None => std::mem::take(&mut self.pending),
            Some(oldest) => {
                let keep = self.pending.split_off(&oldest);
                std::mem::replace(&mut self.pending, keep)
            }
        };
        let objects: Vec<_> = ready.into_values().flatten().collect();
        self.len -= objects.len();
        objects
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
