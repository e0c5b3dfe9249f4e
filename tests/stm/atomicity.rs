//! Atomicity and Isolation Tests
//!
//! - Committed transactions are observed all-or-nothing
//! - Overlapping writers never both commit (no lost update)

use crate::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Barrier;

const ACCOUNTS: usize = 4;
const INITIAL: i64 = 1_000;
const TRANSFERS: usize = 2_000;
const AUDITS: usize = 2_000;

fn run_bank(engine: Engine) {
    let accounts: Arc<Vec<TxObject<i64>>> =
        Arc::new((0..ACCOUNTS).map(|_| TxObject::new(INITIAL)).collect());
    let barrier = Arc::new(Barrier::new(3));

    let transferers: Vec<_> = (0..2u64)
        .map(|seed| {
            let accounts = Arc::clone(&accounts);
            let barrier = Arc::clone(&barrier);
            spawn_participant(&engine, move |handle| {
                let mut rng = StdRng::seed_from_u64(seed);
                barrier.wait();
                for _ in 0..TRANSFERS {
                    let from = rng.gen_range(0..ACCOUNTS);
                    let to = rng.gen_range(0..ACCOUNTS);
                    let amount = rng.gen_range(1..50i64);
                    handle
                        .atomic(|tx| {
                            *tx.write(&accounts[from])? -= amount;
                            *tx.write(&accounts[to])? += amount;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    let auditor = {
        let accounts = Arc::clone(&accounts);
        let barrier = Arc::clone(&barrier);
        spawn_participant(&engine, move |handle| {
            barrier.wait();
            for _ in 0..AUDITS {
                let total = handle
                    .atomic(|tx| {
                        let mut total = 0;
                        for account in accounts.iter() {
                            total += *tx.read(account)?;
                        }
                        Ok(total)
                    })
                    .unwrap();
                assert_eq!(total, ACCOUNTS as i64 * INITIAL);
            }
        })
    };

    for h in transferers {
        h.join().unwrap();
    }
    auditor.join().unwrap();

    let total: i64 = accounts.iter().map(|a| a.load()).sum();
    assert_eq!(total, ACCOUNTS as i64 * INITIAL);
}

#[test]
fn test_audits_see_consistent_totals_deferred() {
    run_bank(engine_with(UpdatePolicy::Deferred, CommitValidation::Invalidation));
}

#[test]
fn test_audits_see_consistent_totals_validation() {
    run_bank(engine_with(UpdatePolicy::Deferred, CommitValidation::Validation));
}

#[test]
fn test_audits_see_consistent_totals_direct() {
    run_bank(engine_with(UpdatePolicy::Direct, CommitValidation::Invalidation));
}

#[test]
fn test_new_and_deleted_objects_publish_with_writes() {
    let engine = engine_with(UpdatePolicy::Deferred, CommitValidation::Invalidation);
    let writer = engine.initialize_thread();
    let observer = engine.initialize_thread();
    let head = TxObject::new(Vec::<u64>::new());
    let old_node = TxObject::new(7u64);

    let mut tx = writer.transaction().unwrap();
    let node = tx.new_memory_copy(42u64).unwrap();
    tx.write(&head).unwrap().push(node.id().as_u64());
    tx.delete_memory(&old_node).unwrap();

    // nothing is visible before the commit
    assert!(head.load().is_empty());
    assert!(node.header().is_new());
    assert!(!old_node.header().is_retired());

    tx.end().unwrap();
    assert_eq!(head.load(), vec![node.id().as_u64()]);
    assert!(!node.header().is_new());
    assert!(old_node.header().is_retired() || old_node.header().is_reclaimed());

    let seen = observer.atomic(|tx| Ok(*tx.read(&node)?)).unwrap();
    assert_eq!(seen, 42);
}

#[test]
fn test_overlapping_writers_invalidation_one_commits() {
    let engine = engine_with(UpdatePolicy::Deferred, CommitValidation::Invalidation);
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();
    let x = TxObject::new(0u32);

    let mut first = a.transaction().unwrap();
    let mut second = b.transaction().unwrap();
    *first.write(&x).unwrap() = 1;
    *second.write(&x).unwrap() = 2;

    first.end().unwrap();
    let err = second.end().unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::Forced));
    assert_eq!(x.load(), 1);
    assert_eq!(engine.stats().forced_aborts, 1);
}

#[test]
fn test_overlapping_writers_validation_one_commits() {
    let engine = engine_with(UpdatePolicy::Deferred, CommitValidation::Validation);
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();
    let x = TxObject::new(0u32);

    let mut first = a.transaction().unwrap();
    let mut second = b.transaction().unwrap();
    *first.write(&x).unwrap() = 1;
    *second.write(&x).unwrap() = 2;

    first.end().unwrap();
    let err = second.end().unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::ValidationFailed(x.id())));
    assert_eq!(x.load(), 1);
    assert_eq!(engine.stats().forced_aborts, 0);
}

#[test]
fn test_stale_reader_cannot_commit_writes() {
    let engine = engine_with(UpdatePolicy::Deferred, CommitValidation::Validation);
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();
    let x = TxObject::new(10u32);
    let y = TxObject::new(0u32);

    let mut reader = b.transaction().unwrap();
    let seen = *reader.read(&x).unwrap();
    a.atomic(|tx| {
        *tx.write(&x)? = 11;
        Ok(())
    })
    .unwrap();
    *reader.write(&y).unwrap() = seen;

    assert!(reader.end().unwrap_err().is_abort());
    assert_eq!(y.load(), 0);
}
