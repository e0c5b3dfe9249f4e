//! Reclamation Tests
//!
//! Objects deleted by a commit at time t are only freed once every
//! transaction that began before t has left.

use crate::*;

#[test]
fn test_older_transaction_pins_deleted_object() {
    let engine = engine_with(UpdatePolicy::Deferred, CommitValidation::Validation);
    let old = engine.initialize_thread();
    let young = engine.initialize_thread();
    let deleter = engine.initialize_thread();
    let victim = TxObject::new(String::from("payload"));
    let other = TxObject::new(0u8);

    let mut old_tx = old.transaction().unwrap();
    let _ = *old_tx.read(&other).unwrap();

    deleter.atomic(|tx| tx.delete_memory(&victim)).unwrap();
    assert_eq!(engine.pending_reclamation(), 1);
    assert_eq!(engine.reclaim(), 0);
    assert!(!victim.header().is_reclaimed());

    // a transaction that began after the deletion does not pin it
    let mut young_tx = young.transaction().unwrap();

    // the old transaction is not serialized after the delete
    let err = old_tx.read(&victim).unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::ValidationFailed(victim.id())));
    assert!(old_tx.end().is_err());

    assert_eq!(engine.pending_reclamation(), 0);
    assert!(victim.header().is_reclaimed());
    assert!(matches!(young_tx.read(&victim), Err(Error::Reclaimed(_))));
    young_tx.end().unwrap();
}

#[test]
fn test_transaction_begun_after_delete_fails_without_retrying() {
    let engine = engine_with(UpdatePolicy::Deferred, CommitValidation::Validation);
    let old = engine.initialize_thread();
    let deleter = engine.initialize_thread();
    let reader = engine.initialize_thread();
    let victim = TxObject::new(7u64);
    let other = TxObject::new(0u8);

    // keeps the deleted object pinned, so it is retired but not reclaimed
    let mut old_tx = old.transaction().unwrap();
    let _ = *old_tx.read(&other).unwrap();

    deleter.atomic(|tx| tx.delete_memory(&victim)).unwrap();
    assert!(victim.header().is_retired());
    assert!(!victim.header().is_reclaimed());
    assert!(victim.header().retired_at().is_some());

    let mut attempts = 0;
    let result = reader.atomic(|tx| {
        attempts += 1;
        Ok(*tx.read(&victim)?)
    });
    assert_eq!(result, Err(Error::Retired(victim.id())));
    assert_eq!(attempts, 1);
    assert!(!result.unwrap_err().is_retryable());

    // the pinning transaction began before the delete and may retry
    let err = old_tx.read(&victim).unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::ValidationFailed(victim.id())));
    assert!(old_tx.end().is_err());
    assert!(victim.header().is_reclaimed());
}

#[test]
fn test_reclaim_on_demand_and_stats() {
    let engine = Engine::new();
    let thread = engine.initialize_thread();
    let objects: Vec<_> = (0..5u32).map(TxObject::new).collect();

    thread
        .atomic(|tx| {
            for obj in &objects {
                tx.delete_memory(obj)?;
            }
            Ok(())
        })
        .unwrap();

    // nothing else was in flight, so the commit reclaimed immediately
    assert_eq!(engine.pending_reclamation(), 0);
    assert_eq!(engine.reclaim(), 0);
    assert_eq!(engine.stats().reclaimed, 5);
    for obj in &objects {
        assert!(obj.header().is_reclaimed());
    }
}

#[test]
fn test_deleting_own_new_object_never_reaches_the_buffer() {
    let engine = Engine::new();
    let thread = engine.initialize_thread();

    let mut tx = thread.transaction().unwrap();
    let scratch = tx.new_memory::<Vec<u8>>().unwrap();
    tx.write(&scratch).unwrap().extend_from_slice(b"tmp");
    tx.delete_memory(&scratch).unwrap();
    tx.end().unwrap();

    assert_eq!(engine.pending_reclamation(), 0);
    assert_eq!(engine.stats().reclaimed, 0);
}

#[test]
fn test_concurrent_readers_never_see_reclaimed_state() {
    let engine = engine_with(UpdatePolicy::Deferred, CommitValidation::Invalidation);
    let slots: Arc<Vec<TxObject<Option<String>>>> = Arc::new(
        (0..64)
            .map(|i| TxObject::new(Some(format!("slot-{}", i))))
            .collect(),
    );

    let reader = {
        let slots = Arc::clone(&slots);
        spawn_participant(&engine, move |handle| {
            for round in 0..500 {
                let i = round % slots.len();
                let seen = handle.atomic(|tx| match tx.read(&slots[i]) {
                    Ok(value) => Ok(value.clone()),
                    Err(Error::Reclaimed(_) | Error::Retired(_)) => Ok(None),
                    Err(e) => Err(e),
                });
                // a live read of a slot is always intact
                if let Ok(Some(text)) = seen {
                    assert_eq!(text, format!("slot-{}", i));
                }
            }
        })
    };

    let deleter = {
        let slots = Arc::clone(&slots);
        spawn_participant(&engine, move |handle| {
            for slot in slots.iter() {
                handle.atomic(|tx| tx.delete_memory(slot)).unwrap();
            }
        })
    };

    reader.join().unwrap();
    deleter.join().unwrap();
    engine.reclaim();
    assert_eq!(engine.pending_reclamation(), 0);
}
