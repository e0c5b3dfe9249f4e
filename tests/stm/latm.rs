//! Lock-Aware Transactional Memory Tests
//!
//! - Full: no transaction is admitted while another thread holds a lock
//! - Tm: only locks registered as conflicting keep transactions out
//! - Tx: only transactions that declared the lock are kept out
//! - Locks taken inside a transaction promote it and live until its end

use crate::*;
use std::sync::atomic::Ordering;

#[test]
fn test_full_mode_blocks_admission_while_lock_held() {
    init_tracing();
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let locker = engine.initialize_thread();
    locker.lock(&lock).unwrap();

    let released = flag();
    let admitted = flag();
    let participant = {
        let released = Arc::clone(&released);
        let admitted = Arc::clone(&admitted);
        spawn_participant(&engine, move |handle| {
            let tx = handle.transaction().unwrap();
            assert!(released.load(Ordering::SeqCst), "admitted while the lock was held");
            admitted.store(true, Ordering::SeqCst);
            drop(tx);
        })
    };

    settle();
    assert!(!admitted.load(Ordering::SeqCst));
    released.store(true, Ordering::SeqCst);
    locker.unlock(&lock).unwrap();
    participant.join().unwrap();
    assert!(admitted.load(Ordering::SeqCst));
}

#[test]
fn test_plain_lock_forces_in_flight_transactions_out() {
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let x = TxObject::new(0u32);
    let started = Arc::new(std::sync::Barrier::new(2));

    let participant = {
        let x = x.clone();
        let started = Arc::clone(&started);
        spawn_participant(&engine, move |handle| {
            let tx = handle.transaction().unwrap();
            let _ = *tx.read(&x).unwrap();
            started.wait();
            // spin until the lock acquirer dooms us
            let err = loop {
                match tx.read(&x) {
                    Ok(_) => thread::sleep(Duration::from_millis(1)),
                    Err(e) => break e,
                }
            };
            drop(tx);
            err
        })
    };

    started.wait();
    let locker = engine.initialize_thread();
    locker.lock(&lock).unwrap();
    assert_eq!(engine.in_flight_count(), 0);
    locker.unlock(&lock).unwrap();

    let err = participant.join().unwrap();
    assert_eq!(err, Error::Aborted(AbortReason::Forced));
    assert!(engine.stats().forced_aborts >= 1);
}

#[test]
fn test_try_lock_fails_without_side_effects() {
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();

    // a conflicting transaction is in flight
    let tx = b.transaction().unwrap();
    assert!(!a.try_lock(&lock).unwrap());
    assert!(!lock.is_locked());
    assert!(tx.is_in_flight());
    drop(tx);

    assert!(a.try_lock(&lock).unwrap());
    assert_eq!(lock.holder(), Some(a.id()));
    // held by someone else
    assert!(!b.try_lock(&lock).unwrap());
    a.unlock(&lock).unwrap();
}

#[test]
fn test_lock_for_times_out() {
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();

    a.lock(&lock).unwrap();
    let err = b.lock_for(&lock, Duration::from_millis(20)).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(lock.holder(), Some(a.id()));
    a.unlock(&lock).unwrap();

    b.lock_for(&lock, Duration::from_millis(20)).unwrap();
    b.unlock(&lock).unwrap();
}

#[test]
fn test_unlock_requires_ownership() {
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();

    assert!(matches!(a.unlock(&lock), Err(Error::LockNotObtained { .. })));
    a.lock(&lock).unwrap();
    let err = b.unlock(&lock).unwrap_err();
    assert_eq!(
        err,
        Error::LockNotObtained {
            lock: lock.id(),
            thread: b.id()
        }
    );
    a.unlock(&lock).unwrap();
}

#[test]
fn test_guard_releases_on_drop() {
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let thread = engine.initialize_thread();
    {
        let guard = thread.guard(&lock).unwrap();
        assert_eq!(guard.lock().holder(), Some(thread.id()));
    }
    assert!(!lock.is_locked());
    // admission works again
    thread.atomic(|_| Ok(())).unwrap();
}

#[test]
fn test_lock_inside_transaction_promotes_and_lives_until_end() {
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let thread = engine.initialize_thread();
    let x = TxObject::new(1u32);

    let mut tx = thread.transaction().unwrap();
    *tx.write(&x).unwrap() = 2;
    tx.lock(&lock).unwrap();
    assert_eq!(tx.kind(), TxKind::IrrevocableAndIsolated);
    assert!(!tx.force_to_abort());
    tx.end().unwrap();

    assert!(!lock.is_locked());
    assert_eq!(x.load(), 2);
    assert_eq!(engine.stats().irrevocable_commits, 1);
}

#[test]
fn test_tm_mode_conflicting_lock_excludes_transactions() {
    let engine = latm_engine(LatmMode::Tm);
    let lock = engine.new_lock();
    engine.register_conflicting_lock(&lock);
    let x = TxObject::new(0u64);
    let y = TxObject::new(0u64);

    // critical sections keep x == y, updating them outside transactions
    let writer = {
        let (x, y, lock) = (x.clone(), y.clone(), lock.clone());
        spawn_participant(&engine, move |handle| {
            for i in 1..=200u64 {
                let _guard = handle.guard(&lock).unwrap();
                x.store(i);
                thread::yield_now();
                y.store(i);
            }
        })
    };

    let reader = {
        let (x, y) = (x.clone(), y.clone());
        spawn_participant(&engine, move |handle| {
            for _ in 0..2_000 {
                let (a, b) = handle
                    .atomic(|tx| Ok((*tx.read(&x)?, *tx.read(&y)?)))
                    .unwrap();
                assert_eq!(a, b, "observed a critical section mid-update");
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(x.load(), 200);
    assert_eq!(y.load(), 200);
}

#[test]
fn test_tm_mode_unregistered_lock_does_not_block() {
    let engine = latm_engine(LatmMode::Tm);
    let plain = engine.new_lock();
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();

    let tx = b.transaction().unwrap();
    a.lock(&plain).unwrap();
    // neither forced nor kept out
    assert!(tx.read(&TxObject::new(1u8)).is_ok());
    drop(tx);
    b.atomic(|_| Ok(())).unwrap();
    a.unlock(&plain).unwrap();
}

#[test]
fn test_tx_mode_only_declaring_transactions_wait() {
    let engine = latm_engine(LatmMode::Tx);
    let lock = engine.new_lock();
    let locker = engine.initialize_thread();
    locker.lock(&lock).unwrap();

    // undeclared transactions run freely
    let bystander = engine.initialize_thread();
    bystander.atomic(|_| Ok(())).unwrap();

    let released = flag();
    let declarer = {
        let (released, lock) = (Arc::clone(&released), lock.clone());
        spawn_participant(&engine, move |handle| {
            let mut tx = handle.unstarted();
            tx.declare_conflicting_lock(&lock).unwrap();
            tx.begin().unwrap();
            assert!(released.load(Ordering::SeqCst), "admitted while the lock was held");
            tx.end().unwrap();
        })
    };

    settle();
    released.store(true, Ordering::SeqCst);
    locker.unlock(&lock).unwrap();
    declarer.join().unwrap();
}

#[test]
fn test_tx_mode_lock_forces_declaring_transaction() {
    let engine = latm_engine(LatmMode::Tx);
    let lock = engine.new_lock();
    let x = TxObject::new(0u32);
    let started = Arc::new(std::sync::Barrier::new(2));

    let participant = {
        let (x, lock, started) = (x.clone(), lock.clone(), Arc::clone(&started));
        spawn_participant(&engine, move |handle| {
            let mut attempts = 0;
            handle
                .atomic(|tx| {
                    attempts += 1;
                    tx.declare_conflicting_lock(&lock)?;
                    *tx.write(&x)? += 1;
                    if attempts == 1 {
                        started.wait();
                        while tx.read(&x).is_ok() {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    Ok(())
                })
                .unwrap();
            attempts
        })
    };

    started.wait();
    let locker = engine.initialize_thread();
    locker.lock(&lock).unwrap();
    locker.unlock(&lock).unwrap();

    assert_eq!(participant.join().unwrap(), 2);
    assert_eq!(x.load(), 1);
}

#[test]
fn test_lock_refused_while_live_guard_blocks_a_committer() {
    init_tracing();
    let engine = Engine::builder()
        .update_policy(UpdatePolicy::Deferred)
        .commit_validation(CommitValidation::Validation)
        .latm_mode(LatmMode::Tx)
        .wait_interval(Duration::from_micros(20))
        .build()
        .unwrap();
    let lock = engine.new_lock();
    let x = TxObject::new(0u32);
    let reader = engine.initialize_thread();

    let tx = reader.transaction().unwrap();
    let seen = tx.read(&x).unwrap();
    assert!(!seen.is_staged());

    let committed = flag();
    let writer = {
        let x = x.clone();
        let committed = Arc::clone(&committed);
        spawn_participant(&engine, move |handle| {
            handle.atomic(|tx| Ok(*tx.write(&x)? += 1)).unwrap();
            committed.store(true, Ordering::SeqCst);
        })
    };

    // the writer's publication waits on our guard with the commit lock held
    settle();
    assert!(!committed.load(Ordering::SeqCst));

    let started = std::time::Instant::now();
    let err = reader.lock_for(&lock, Duration::from_millis(500)).unwrap_err();
    assert!(matches!(err, Error::Usage(_)), "{}", err);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!lock.is_locked());
    assert_eq!(tx.kind(), TxKind::Normal);

    drop(seen);
    writer.join().unwrap();
    assert_eq!(x.load(), 1);

    // the read went stale under the writer's commit
    let mut tx = tx;
    let err = tx.end().unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::ValidationFailed(x.id())));
}

#[test]
fn test_promotion_refused_while_enclosing_guard_is_live() {
    let engine = latm_engine(LatmMode::Full);
    let lock = engine.new_lock();
    let thread = engine.initialize_thread();
    let x = TxObject::new(3u32);

    let outer = thread.transaction().unwrap();
    let value = outer.read(&x).unwrap();

    let mut inner = thread.transaction().unwrap();
    assert!(matches!(inner.make_irrevocable(), Err(Error::Usage(_))));
    assert!(matches!(inner.make_isolated(), Err(Error::Usage(_))));
    assert!(matches!(inner.try_lock(&lock), Err(Error::Usage(_))));
    assert!(matches!(thread.lock(&lock), Err(Error::Usage(_))));
    assert!(!lock.is_locked());
    assert_eq!(inner.kind(), TxKind::Normal);

    drop(value);
    inner.make_irrevocable().unwrap();
    inner.end().unwrap();

    let mut outer = outer;
    assert_eq!(outer.kind(), TxKind::Irrevocable);
    outer.end().unwrap();
}

#[test]
fn test_lock_for_inside_transaction_bounds_promotion_wait() {
    let engine = latm_engine(LatmMode::Tx);
    let lock = engine.new_lock();
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();

    let mut a_tx = a.transaction().unwrap();
    let mut b_tx = b.transaction().unwrap();
    b_tx.make_irrevocable().unwrap();

    let started = std::time::Instant::now();
    let err = a_tx.lock_for(&lock, Duration::from_millis(30)).unwrap_err();
    assert!(err.is_timeout(), "{}", err);
    assert!(matches!(err, Error::Timeout { lock: id, .. } if id == lock.id()));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(!lock.is_locked());
    assert_eq!(a_tx.kind(), TxKind::Normal);
    assert!(a_tx.is_in_flight());

    b_tx.end().unwrap();
    a_tx.lock_for(&lock, Duration::from_millis(500)).unwrap();
    assert_eq!(lock.holder(), Some(a.id()));
    a_tx.end().unwrap();
    assert!(!lock.is_locked());
}
