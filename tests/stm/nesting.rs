//! Nesting Tests
//!
//! Transactions of one thread flatten into the outermost one: inner ends
//! hand off, inner aborts doom the whole family.

use crate::*;

#[test]
fn test_inner_end_hands_off_to_outer() {
    let engine = Engine::new();
    let thread = engine.initialize_thread();
    let x = TxObject::new(0u32);

    let mut outer = thread.transaction().unwrap();
    {
        let mut inner = thread.transaction().unwrap();
        *inner.write(&x).unwrap() = 5;
        inner.end().unwrap();
        assert_eq!(inner.state(), TxState::HandOff);
    }
    // visible to the family, not to the world
    assert_eq!(*outer.read(&x).unwrap(), 5);
    assert_eq!(x.load(), 0);

    outer.end().unwrap();
    assert_eq!(x.load(), 5);
    let stats = engine.stats();
    assert_eq!(stats.handoffs, 1);
    assert_eq!(stats.commits, 1);
}

#[test]
fn test_inner_abort_dooms_outer() {
    let engine = Engine::new();
    let thread = engine.initialize_thread();
    let x = TxObject::new(0u32);

    let mut outer = thread.transaction().unwrap();
    *outer.write(&x).unwrap() = 1;
    {
        let mut inner = thread.transaction().unwrap();
        inner.abort().unwrap();
    }
    assert!(outer.read(&x).unwrap_err().is_abort());
    let err = outer.end().unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::NestedAbort));
    assert_eq!(x.load(), 0);
}

#[test]
fn test_nested_restart_is_reported() {
    let engine = Engine::new();
    let thread = engine.initialize_thread();

    let mut outer = thread.transaction().unwrap();
    let mut inner = thread.transaction().unwrap();
    let err = inner.restart().unwrap_err();
    assert_eq!(err, Error::NestedRestart { thread: thread.id() });
    assert!(!inner.is_in_flight());
    drop(inner);

    assert!(outer.end().unwrap_err().is_abort());
    // the outermost transaction restarts normally
    outer.restart().unwrap();
    outer.end().unwrap();
}

#[test]
fn test_nested_atomic_blocks_retry_as_a_whole() {
    let engine = Engine::new();
    let thread = engine.initialize_thread();
    let log = TxObject::new(Vec::<&'static str>::new());
    let mut outer_runs = 0;

    thread
        .atomic(|tx| {
            outer_runs += 1;
            tx.write(&log)?.push("outer");
            let first_run = outer_runs == 1;
            thread.atomic(|inner| {
                inner.write(&log)?.push("inner");
                if first_run {
                    return Err(Error::Aborted(AbortReason::Explicit));
                }
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    assert_eq!(outer_runs, 2);
    assert_eq!(log.load(), vec!["outer", "inner"]);
    assert_eq!(engine.stats().handoffs, 1);
}

#[test]
fn test_new_memory_in_inner_survives_handoff() {
    let engine = Engine::new();
    let thread = engine.initialize_thread();
    let root = TxObject::new(None::<TxObject<u64>>);

    thread
        .atomic(|tx| {
            let node = thread.atomic(|inner| inner.new_memory_copy(9u64))?;
            *tx.write(&root)? = Some(node);
            Ok(())
        })
        .unwrap();

    let node = root.load().expect("linked node");
    assert!(!node.header().is_new());
    assert_eq!(node.load(), 9);
}
