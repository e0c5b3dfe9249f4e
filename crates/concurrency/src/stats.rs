//! Engine statistics
//!
//! Relaxed atomic counters updated on the commit and abort paths, plus a
//! serializable snapshot for reporting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    commits: AtomicU64,
    read_only_commits: AtomicU64,
    irrevocable_commits: AtomicU64,
    aborts: AtomicU64,
    handoffs: AtomicU64,
    forced_aborts: AtomicU64,
    reclaimed: AtomicU64,
}

impl EngineStats {
    pub fn record_commit(&self, read_only: bool, irrevocable: bool) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        if read_only {
            self.read_only_commits.fetch_add(1, Ordering::Relaxed);
        }
        if irrevocable {
            self.irrevocable_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handoff(&self) {
        self.handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced(&self, n: u64) {
        self.forced_aborts.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, n: u64) {
        self.reclaimed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            read_only_commits: self.read_only_commits.load(Ordering::Relaxed),
            irrevocable_commits: self.irrevocable_commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            forced_aborts: self.forced_aborts.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Outermost transactions committed
    pub commits: u64,
    /// Commits that wrote, deleted and allocated nothing
    pub read_only_commits: u64,
    /// Commits by irrevocable or isolated transactions
    pub irrevocable_commits: u64,
    /// Attempts aborted (outermost and nested)
    pub aborts: u64,
    /// Nested transactions ended into their enclosing transaction
    pub handoffs: u64,
    /// Other transactions forced to abort by committers, lock acquirers and isolation
    pub forced_aborts: u64,
    /// Deleted objects physically reclaimed
    pub reclaimed: u64,
}

impl StatsSnapshot {
    /// Commits plus aborts
    pub fn attempts(&self) -> u64 {
        self.commits + self.aborts
    }

    /// Fraction of finished attempts that aborted, 0.0 when nothing ran
    pub fn abort_rate(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            n => self.aborts as f64 / n as f64,
        }
    }
}
