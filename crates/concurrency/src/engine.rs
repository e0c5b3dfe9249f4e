//! Transactional memory engine
//!
//! The [`Engine`] owns everything shared between participating threads:
//! configuration, the in-flight registry, LATM state, the contention
//! manager and the deletion buffer. It is a cheap `Arc` handle; clones
//! refer to the same engine.
//!
//! # Lock order
//!
//! ```text
//! general (commit) -> in_flight -> latm
//! ```
//!
//! `config` and `contention` are read under `in_flight` or with no other
//! lock held. Thread footprints, the deletion buffer, the thread map and
//! per-thread lists are leaves: nothing is acquired while holding them.
//!
//! # Thread Safety
//!
//! The general lock serializes commits and irrevocable access so a
//! committer's validation and publication happen atomically with respect
//! to other committers. Forcing transactions and promoting one to
//! irrevocable both happen under `in_flight`, so they never race.

use crate::config::{
    CommitValidation, ConflictDetection, ContentionConfig, CopySemantics, EngineConfig, LatmMode,
    UpdatePolicy,
};
use crate::contention::{build_contention_manager, ContentionManager};
use crate::latm::{LatmState, TxLock};
use crate::reclaim::DeletionBuffer;
use crate::registry::{InFlightRegistry, TxRecord};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::thread::{ThreadContext, ThreadHandle};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{Error, IdAllocator, LockId, LogicalClock, Result, ThreadId};
use tracing::{debug, info};

pub(crate) struct EngineInner {
    pub config: RwLock<EngineConfig>,
    /// Commit serialization lock
    ///
    /// Also held by irrevocable transactions for the duration of each
    /// shared access, so no commit can publish under them.
    pub general: Mutex<()>,
    pub in_flight: Mutex<InFlightRegistry>,
    pub latm: Mutex<LatmState>,
    pub contention: RwLock<Arc<dyn ContentionManager>>,
    pub threads: DashMap<ThreadId, Arc<ThreadContext>>,
    pub deletions: Mutex<DeletionBuffer>,
    pub clock: LogicalClock,
    thread_ids: IdAllocator,
    pub tx_ids: IdAllocator,
    lock_ids: IdAllocator,
    /// Irrevocable transaction families currently in flight (0 or 1)
    pub irrevocable: AtomicUsize,
    pub stats: EngineStats,
}

impl EngineInner {
    pub fn contention(&self) -> Arc<dyn ContentionManager> {
        Arc::clone(&self.contention.read())
    }

    pub fn wait_interval(&self) -> Duration {
        self.config.read().wait_interval()
    }

    /// Force `record`'s thread to abort; caller holds `in_flight`
    pub fn force(&self, record: &TxRecord) -> bool {
        let newly = record.ctx.force_abort();
        if newly {
            self.stats.record_forced(1);
            debug!("forced {} on {} to abort", record.id, record.thread());
        }
        newly
    }

    /// Free every retired object no in-flight transaction can reach
    pub fn reclaim(&self) -> usize {
        let ready = {
            let inflight = self.in_flight.lock();
            let mut deletions = self.deletions.lock();
            if deletions.is_empty() {
                return 0;
            }
            deletions.collect(inflight.oldest_start())
        };
        for object in &ready {
            object.reclaim();
        }
        if !ready.is_empty() {
            self.stats.record_reclaimed(ready.len() as u64);
            debug!("reclaimed {} objects", ready.len());
        }
        ready.len()
    }

    pub fn unblock(&self, threads: &[ThreadId]) {
        for thread in threads {
            if let Some(ctx) = self.threads.get(thread) {
                ctx.set_blocked(false);
            }
        }
    }
}

/// Shared transactional memory engine
///
/// # Example
///
/// ```
/// use strata_concurrency::{Engine, TxObject};
///
/// let engine = Engine::new();
/// let counter = TxObject::new(0u64);
/// let thread = engine.initialize_thread();
/// thread.atomic(|tx| {
///     *tx.write(&counter)? += 1;
///     Ok(())
/// }).unwrap();
/// assert_eq!(counter.load(), 1);
/// ```
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine with the default configuration
    pub fn new() -> Self {
        Self::build(EngineConfig::default(), None)
    }

    /// Engine with `config`, after validating it
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Engine configured from a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Self::with_config(EngineConfig::from_toml_str(input)?)
    }

    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    fn build(config: EngineConfig, contention: Option<Arc<dyn ContentionManager>>) -> Self {
        let contention = contention.unwrap_or_else(|| build_contention_manager(&config.contention));
        info!(
            "engine started: {:?} updating, {:?} detection, {:?} commits, {:?} LATM",
            config.update_policy, config.conflict_detection, config.commit_validation, config.latm_mode
        );
        Self {
            inner: Arc::new(EngineInner {
                config: RwLock::new(config),
                general: Mutex::new(()),
                in_flight: Mutex::new(InFlightRegistry::default()),
                latm: Mutex::new(LatmState::default()),
                contention: RwLock::new(contention),
                threads: DashMap::new(),
                deletions: Mutex::new(DeletionBuffer::default()),
                clock: LogicalClock::new(),
                thread_ids: IdAllocator::new(),
                tx_ids: IdAllocator::new(),
                lock_ids: IdAllocator::new(),
                irrevocable: AtomicUsize::new(0),
                stats: EngineStats::default(),
            }),
        }
    }

    /// Register the calling thread
    ///
    /// Every thread that runs transactions or takes LATM locks needs its
    /// own handle.
    pub fn initialize_thread(&self) -> ThreadHandle {
        let id = ThreadId::from_raw(self.inner.thread_ids.allocate());
        let ctx = Arc::new(ThreadContext::new(id));
        self.inner.threads.insert(id, Arc::clone(&ctx));
        debug!("{} registered", id);
        ThreadHandle::new(self.clone(), ctx)
    }

    /// Create a lock managed by this engine's LATM protocol
    pub fn new_lock(&self) -> TxLock {
        TxLock::new(LockId::from_raw(self.inner.lock_ids.allocate()))
    }

    /// Mark `lock` as conflicting with transactions (`Tm` mode)
    pub fn register_conflicting_lock(&self, lock: &TxLock) {
        self.inner.latm.lock().add_tm_conflicting(lock.id());
    }

    /// Undo [`register_conflicting_lock`](Engine::register_conflicting_lock)
    pub fn unregister_conflicting_lock(&self, lock: &TxLock) -> bool {
        self.inner.latm.lock().remove_tm_conflicting(lock.id())
    }

    /// Choose direct or deferred updating
    pub fn set_update_policy(&self, policy: UpdatePolicy) -> Result<()> {
        self.reconfigure("update policy", |c| c.update_policy = policy)
    }

    /// Choose early or late direct-mode conflict detection
    pub fn set_conflict_detection(&self, detection: ConflictDetection) -> Result<()> {
        self.reconfigure("conflict detection", |c| c.conflict_detection = detection)
    }

    /// Choose invalidation or validation at commit
    pub fn set_commit_validation(&self, validation: CommitValidation) -> Result<()> {
        self.reconfigure("commit validation", |c| c.commit_validation = validation)
    }

    /// Choose the LATM protection level
    pub fn set_latm_mode(&self, mode: LatmMode) -> Result<()> {
        self.reconfigure("LATM mode", |c| c.latm_mode = mode)
    }

    /// Choose copy or move publication of staged values
    pub fn set_copy_semantics(&self, copy: CopySemantics) -> Result<()> {
        self.reconfigure("copy semantics", |c| c.copy_semantics = copy)
    }

    /// Install a contention manager
    pub fn set_contention_manager(&self, manager: Arc<dyn ContentionManager>) -> Result<()> {
        let inflight = self.inner.in_flight.lock();
        ensure_idle(&inflight, "contention manager")?;
        debug!("contention manager replaced: {:?}", manager);
        *self.inner.contention.write() = manager;
        Ok(())
    }

    /// Replace the whole configuration, rebuilding the contention manager
    pub fn set_config(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        let inflight = self.inner.in_flight.lock();
        ensure_idle(&inflight, "configuration")?;
        *self.inner.contention.write() = build_contention_manager(&config.contention);
        *self.inner.config.write() = config;
        info!("engine reconfigured");
        Ok(())
    }

    fn reconfigure(&self, what: &str, change: impl FnOnce(&mut EngineConfig)) -> Result<()> {
        let inflight = self.inner.in_flight.lock();
        ensure_idle(&inflight, what)?;
        let mut candidate = self.inner.config.read().clone();
        change(&mut candidate);
        candidate.validate()?;
        *self.inner.config.write() = candidate;
        debug!("{} changed", what);
        Ok(())
    }

    /// Copy of the current configuration
    pub fn config(&self) -> EngineConfig {
        self.inner.config.read().clone()
    }

    /// Installed contention manager
    pub fn contention_manager(&self) -> Arc<dyn ContentionManager> {
        self.inner.contention()
    }

    /// Engine-wide counters
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Transaction attempts currently in flight, nested ones included
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Registered threads
    pub fn thread_count(&self) -> usize {
        self.inner.threads.len()
    }

    /// Deleted objects waiting for reclamation
    pub fn pending_reclamation(&self) -> usize {
        self.inner.deletions.lock().len()
    }

    /// Reclaim what can be reclaimed now; returns the number of objects freed
    ///
    /// Runs automatically at the end of every outermost transaction.
    pub fn reclaim(&self) -> usize {
        self.inner.reclaim()
    }
}

fn ensure_idle(inflight: &InFlightRegistry, what: &str) -> Result<()> {
    if inflight.is_empty() {
        return Ok(());
    }
    Err(Error::InvalidState(format!(
        "cannot change {} while {} transactions are in flight",
        what,
        inflight.len()
    )))
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &*self.inner.config.read())
            .field("threads", &self.inner.threads.len())
            .finish()
    }
}

/// Fluent construction of an [`Engine`]
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    contention: Option<Arc<dyn ContentionManager>>,
}

impl EngineBuilder {
    /// Start from an existing configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the update policy
    pub fn update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.config.update_policy = policy;
        self
    }

    /// Set direct-mode conflict detection
    pub fn conflict_detection(mut self, detection: ConflictDetection) -> Self {
        self.config.conflict_detection = detection;
        self
    }

    /// Set commit validation
    pub fn commit_validation(mut self, validation: CommitValidation) -> Self {
        self.config.commit_validation = validation;
        self
    }

    /// Set the LATM mode
    pub fn latm_mode(mut self, mode: LatmMode) -> Self {
        self.config.latm_mode = mode;
        self
    }

    /// Set copy semantics
    pub fn copy_semantics(mut self, copy: CopySemantics) -> Self {
        self.config.copy_semantics = copy;
        self
    }

    /// Set built-in contention manager options
    pub fn contention(mut self, contention: ContentionConfig) -> Self {
        self.config.contention = contention;
        self
    }

    /// Install a custom contention manager, overriding `contention`
    pub fn contention_manager(mut self, manager: Arc<dyn ContentionManager>) -> Self {
        self.contention = Some(manager);
        self
    }

    /// Set the polling interval for internal waits
    pub fn wait_interval(mut self, interval: Duration) -> Self {
        self.config.wait_interval_us = interval.as_micros() as u64;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        Ok(Engine::build(self.config, self.contention))
    }
}
