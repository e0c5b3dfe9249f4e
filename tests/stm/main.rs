//! StrataSTM Integration Tests
//!
//! End-to-end behavior of the engine across threads:
//! - counter: the two-thread shared counter under every update/commit policy
//! - atomicity: transfers audited by concurrent readers, lost-update checks
//! - rollback: direct-mode abort and dirty readers
//! - reclamation: deleted objects outlive older transactions
//! - latm: lock-aware admission in Full, Tm and Tx modes
//! - irrevocable: promotion, isolation and idempotence
//! - nesting: flattened nesting and nested aborts
//! - config: TOML loading and pluggable contention managers
//! - properties: randomized commit/abort sequences
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test stm
//! cargo test --test stm latm::
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stratastm::prelude::*;

mod atomicity;
mod counter;
mod latm;
mod nesting;
mod properties;
mod reclamation;
mod rollback;

// =============================================================================
// SHARED TEST UTILITIES
// =============================================================================

/// Install a tracing subscriber once; honors `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Engine with the given update and commit policies and a short poll interval
pub fn engine_with(update: UpdatePolicy, validation: CommitValidation) -> Engine {
    Engine::builder()
        .update_policy(update)
        .commit_validation(validation)
        .wait_interval(Duration::from_micros(20))
        .build()
        .expect("valid configuration")
}

/// Engine with the given LATM mode
pub fn latm_engine(mode: LatmMode) -> Engine {
    Engine::builder()
        .latm_mode(mode)
        .wait_interval(Duration::from_micros(20))
        .build()
        .expect("valid configuration")
}

/// Run `f` on a fresh OS thread with its own handle on `engine`
pub fn spawn_participant<R, F>(engine: &Engine, f: F) -> thread::JoinHandle<R>
where
    R: Send + 'static,
    F: FnOnce(ThreadHandle) -> R + Send + 'static,
{
    let engine = engine.clone();
    thread::spawn(move || f(engine.initialize_thread()))
}

/// Pause long enough for a blocked participant to show it is blocked
pub fn settle() {
    thread::sleep(Duration::from_millis(50));
}

/// Shared flag
pub fn flag() -> Arc<std::sync::atomic::AtomicBool> {
    Arc::new(std::sync::atomic::AtomicBool::new(false))
}
