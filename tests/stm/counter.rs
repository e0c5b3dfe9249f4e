//! Shared Counter Tests
//!
//! Two threads each increment one counter 10000 times inside retrying
//! transactions. No increment may be lost and the commit/abort books must
//! balance.

use crate::*;
use std::sync::Barrier;

const THREADS: usize = 2;
const INCREMENTS: u64 = 10_000;

fn run_counter(engine: Engine) {
    init_tracing();
    let counter = TxObject::new(0u64);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = counter.clone();
            let barrier = Arc::clone(&barrier);
            spawn_participant(&engine, move |handle| {
                barrier.wait();
                for _ in 0..INCREMENTS {
                    handle
                        .atomic(|tx| {
                            let current = *tx.read(&counter)?;
                            *tx.write(&counter)? = current + 1;
                            Ok(())
                        })
                        .unwrap();
                }
                (handle.commits(), handle.aborts())
            })
        })
        .collect();

    let mut aborts = 0;
    for h in handles {
        let (commits, thread_aborts) = h.join().unwrap();
        assert_eq!(commits, INCREMENTS);
        aborts += thread_aborts;
    }

    assert_eq!(counter.load(), THREADS as u64 * INCREMENTS);
    let stats = engine.stats();
    assert_eq!(stats.commits, THREADS as u64 * INCREMENTS);
    assert_eq!(stats.aborts, aborts);
    assert_eq!(stats.attempts(), stats.commits + aborts);
    assert_eq!(engine.in_flight_count(), 0);
}

#[test]
fn test_counter_deferred_invalidation() {
    run_counter(engine_with(UpdatePolicy::Deferred, CommitValidation::Invalidation));
}

#[test]
fn test_counter_deferred_validation() {
    run_counter(engine_with(UpdatePolicy::Deferred, CommitValidation::Validation));
}

#[test]
fn test_counter_direct_invalidation() {
    run_counter(engine_with(UpdatePolicy::Direct, CommitValidation::Invalidation));
}

#[test]
fn test_counter_direct_validation() {
    run_counter(engine_with(UpdatePolicy::Direct, CommitValidation::Validation));
}

#[test]
fn test_counter_with_noop_manager_and_move_semantics() {
    let engine = Engine::builder()
        .contention_manager(Arc::new(stratastm::NoOpContentionManager))
        .copy_semantics(CopySemantics::Move)
        .wait_interval(Duration::from_micros(20))
        .build()
        .unwrap();
    run_counter(engine);
}
