//! Contention management
//!
//! A [`ContentionManager`] answers "who may abort whom". The engine asks it
//! at three kinds of decision points:
//!
//! 1. Immediate conflicts (`abort_on_new/read/write/delete`): return `true`
//!    to abort the calling transaction, `false` to let it proceed. For a
//!    direct-mode write conflict, proceeding means contending for the object:
//!    the engine then asks [`permission_to_abort`](ContentionManager::permission_to_abort)
//!    before forcing the current owner.
//! 2. Commit (`abort_before_commit`, `permission_to_abort_all`): a last veto,
//!    and permission to invalidate every conflicting in-flight transaction.
//! 3. LATM and promotion waits (`allow_lock_to_abort_tx`, the priority
//!    promotion hooks).
//!
//! Permission calls made during commit and lock arbitration run while the
//! engine holds internal locks and must not block.

use crate::config::{AbortPermission, ContentionConfig, ContentionPolicy};
use crate::state::TxInfo;
use std::sync::Arc;
use std::time::Duration;
use strata_core::ObjectId;

/// Pluggable conflict arbitration policy
pub trait ContentionManager: Send + Sync + std::fmt::Debug {
    /// `tx` touched another thread's uncommitted object
    fn abort_on_new(&self, tx: &TxInfo, object: ObjectId) -> bool;

    /// `tx` read an object owned by another thread
    fn abort_on_read(&self, tx: &TxInfo, object: ObjectId) -> bool;

    /// `tx` wants to write an object owned by another thread
    fn abort_on_write(&self, tx: &TxInfo, object: ObjectId) -> bool;

    /// `tx` wants to delete an object owned by another thread
    fn abort_on_delete(&self, tx: &TxInfo, object: ObjectId) -> bool;

    /// Last-chance veto before `tx` starts its commit protocol
    fn abort_before_commit(&self, tx: &TxInfo) -> bool;

    /// May `lhs` force `rhs` to abort?
    fn permission_to_abort(&self, lhs: &TxInfo, rhs: &TxInfo) -> bool;

    /// May `lhs` force every transaction in `rhs` to abort?
    fn permission_to_abort_all(&self, lhs: &TxInfo, rhs: &[TxInfo]) -> bool {
        rhs.iter().all(|victim| self.permission_to_abort(lhs, victim))
    }

    /// May a lock acquirer force `victim` to abort?
    ///
    /// `wait_ms` is how long the acquirer has waited so far and
    /// `abort_count` how many transactions it has already aborted.
    fn allow_lock_to_abort_tx(
        &self,
        wait_ms: u64,
        abort_count: u64,
        requester_irrevocable: bool,
        victim: &TxInfo,
    ) -> bool;

    /// Called on each stalled cycle of `make_isolated`; returns the new priority
    fn perform_isolated_tx_wait_priority_promotion(&self, tx: &TxInfo) -> usize;

    /// Called on each stalled cycle of `make_irrevocable`; returns the new priority
    fn perform_irrevocable_tx_wait_priority_promotion(&self, tx: &TxInfo) -> usize;
}

impl AbortPermission {
    /// Decide whether `lhs` may abort every transaction in `rhs`.
    ///
    /// Ties always permit. An empty victim set is always permitted.
    pub fn permits(&self, lhs: &TxInfo, rhs: &[TxInfo]) -> bool {
        match self {
            AbortPermission::Aggressive => true,
            AbortPermission::Priority => rhs.iter().all(|r| r.priority <= lhs.priority),
            AbortPermission::Fairness => rhs.iter().all(|r| {
                let lhs_side = (lhs.priority as u128 + 1) * (r.commits as u128 + 1);
                let rhs_side = (r.priority as u128 + 1) * (lhs.commits as u128 + 1);
                lhs_side >= rhs_side
            }),
            AbortPermission::Balanced => {
                let weight = |t: &TxInfo| -> u128 {
                    t.writes as u128 * (t.priority as u128 + 1) + t.reads as u128
                };
                let victims: u128 = rhs.iter().map(weight).sum();
                weight(lhs) >= victims
            }
        }
    }
}

/// Lock arbitration shared by the built-in managers
fn default_lock_arbitration(
    wait_ms: u64,
    abort_count: u64,
    requester_irrevocable: bool,
    victim: &TxInfo,
) -> bool {
    if victim.is_irrevocable() {
        return false;
    }
    if requester_irrevocable {
        return true;
    }
    victim.priority as u64 <= abort_count.saturating_add(wait_ms)
}

/// Manager that never aborts anyone on immediate conflicts
///
/// All conflicts are left to commit-time invalidation or validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpContentionManager;

impl ContentionManager for NoOpContentionManager {
    fn abort_on_new(&self, _tx: &TxInfo, _object: ObjectId) -> bool {
        false
    }

    fn abort_on_read(&self, _tx: &TxInfo, _object: ObjectId) -> bool {
        false
    }

    fn abort_on_write(&self, _tx: &TxInfo, _object: ObjectId) -> bool {
        false
    }

    fn abort_on_delete(&self, _tx: &TxInfo, _object: ObjectId) -> bool {
        false
    }

    fn abort_before_commit(&self, _tx: &TxInfo) -> bool {
        false
    }

    fn permission_to_abort(&self, _lhs: &TxInfo, _rhs: &TxInfo) -> bool {
        true
    }

    fn allow_lock_to_abort_tx(
        &self,
        _wait_ms: u64,
        _abort_count: u64,
        _requester_irrevocable: bool,
        victim: &TxInfo,
    ) -> bool {
        !victim.is_irrevocable()
    }

    fn perform_isolated_tx_wait_priority_promotion(&self, tx: &TxInfo) -> usize {
        tx.priority
    }

    fn perform_irrevocable_tx_wait_priority_promotion(&self, tx: &TxInfo) -> usize {
        tx.priority
    }
}

/// Manager that backs off and aborts the requester on immediate conflicts
///
/// The backoff doubles with the requester's priority (which grows every time
/// it stalls in a promotion wait), capped at `max_backoff`. Batched abort
/// permission follows the configured [`AbortPermission`] heuristic.
#[derive(Debug, Clone)]
pub struct BackoffContentionManager {
    permission: AbortPermission,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl BackoffContentionManager {
    /// Create a manager with the given heuristic and backoff bounds
    pub fn new(permission: AbortPermission, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            permission,
            initial_backoff,
            max_backoff,
        }
    }

    /// Heuristic used for abort permission
    pub fn permission(&self) -> AbortPermission {
        self.permission
    }

    /// Sleep length for a transaction at the given priority
    pub fn backoff_for(&self, priority: usize) -> Duration {
        let shift = priority.min(16) as u32;
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    fn back_off(&self, tx: &TxInfo) -> bool {
        let pause = self.backoff_for(tx.priority);
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
        true
    }
}

impl Default for BackoffContentionManager {
    fn default() -> Self {
        let config = ContentionConfig::default();
        Self::new(
            config.abort_permission,
            Duration::from_micros(config.initial_backoff_us),
            Duration::from_micros(config.max_backoff_us),
        )
    }
}

impl ContentionManager for BackoffContentionManager {
    fn abort_on_new(&self, tx: &TxInfo, _object: ObjectId) -> bool {
        self.back_off(tx)
    }

    fn abort_on_read(&self, tx: &TxInfo, _object: ObjectId) -> bool {
        self.back_off(tx)
    }

    fn abort_on_write(&self, tx: &TxInfo, _object: ObjectId) -> bool {
        self.back_off(tx)
    }

    fn abort_on_delete(&self, tx: &TxInfo, _object: ObjectId) -> bool {
        self.back_off(tx)
    }

    fn abort_before_commit(&self, _tx: &TxInfo) -> bool {
        false
    }

    fn permission_to_abort(&self, lhs: &TxInfo, rhs: &TxInfo) -> bool {
        self.permission.permits(lhs, std::slice::from_ref(rhs))
    }

    fn permission_to_abort_all(&self, lhs: &TxInfo, rhs: &[TxInfo]) -> bool {
        self.permission.permits(lhs, rhs)
    }

    fn allow_lock_to_abort_tx(
        &self,
        wait_ms: u64,
        abort_count: u64,
        requester_irrevocable: bool,
        victim: &TxInfo,
    ) -> bool {
        default_lock_arbitration(wait_ms, abort_count, requester_irrevocable, victim)
    }

    fn perform_isolated_tx_wait_priority_promotion(&self, tx: &TxInfo) -> usize {
        tx.priority.saturating_add(1)
    }

    fn perform_irrevocable_tx_wait_priority_promotion(&self, tx: &TxInfo) -> usize {
        tx.priority.saturating_add(1)
    }
}

/// Build the manager selected by `config`
pub fn build_contention_manager(config: &ContentionConfig) -> Arc<dyn ContentionManager> {
    match config.policy {
        ContentionPolicy::NoOp => Arc::new(NoOpContentionManager),
        ContentionPolicy::Backoff => Arc::new(BackoffContentionManager::new(
            config.abort_permission,
            Duration::from_micros(config.initial_backoff_us),
            Duration::from_micros(config.max_backoff_us),
        )),
    }
}
