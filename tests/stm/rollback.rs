//! Direct-Mode Rollback Tests
//!
//! An aborted direct-mode transaction restores every object it wrote to
//! the value it had before the first write, and readers that saw the
//! uncommitted value cannot commit.

use crate::*;

fn direct_engine(detection: ConflictDetection) -> Engine {
    Engine::builder()
        .update_policy(UpdatePolicy::Direct)
        .conflict_detection(detection)
        .wait_interval(Duration::from_micros(20))
        .build()
        .unwrap()
}

#[test]
fn test_abort_restores_every_written_object() {
    let engine = direct_engine(ConflictDetection::Early);
    let thread = engine.initialize_thread();
    let objects: Vec<_> = (0..8).map(|i| TxObject::new(vec![i; 3])).collect();

    let mut tx = thread.transaction().unwrap();
    for (i, obj) in objects.iter().enumerate() {
        // several writes per object; the backup is taken at the first one
        tx.write(obj).unwrap().push(100);
        tx.write(obj).unwrap()[0] = 1000 + i as i32;
    }
    tx.abort().unwrap();

    for (i, obj) in objects.iter().enumerate() {
        assert_eq!(obj.load(), vec![i as i32; 3]);
        assert_eq!(obj.header().owner(), None);
    }
}

#[test]
fn test_failed_commit_restores_state() {
    let engine = direct_engine(ConflictDetection::Late);
    let a = engine.initialize_thread();
    let b = engine.initialize_thread();
    let x = TxObject::new(1u32);
    let y = TxObject::new(2u32);

    let mut loser = a.transaction().unwrap();
    let seen = *loser.read(&x).unwrap();
    *loser.write(&y).unwrap() = seen * 10;
    assert_eq!(y.load(), 10);

    b.atomic(|tx| {
        *tx.write(&x)? = 5;
        Ok(())
    })
    .unwrap();

    assert!(loser.end().unwrap_err().is_abort());
    assert_eq!(y.load(), 2);
    assert_eq!(x.load(), 5);
}

#[test]
fn test_dirty_reader_fails_validation_after_writer_aborts() {
    let engine = direct_engine(ConflictDetection::Late);
    let writer = engine.initialize_thread();
    let reader = engine.initialize_thread();
    let x = TxObject::new(7u64);

    let mut w = writer.transaction().unwrap();
    *w.write(&x).unwrap() = 99;

    let mut r = reader.transaction().unwrap();
    // late detection lets the read through and checks at commit
    assert_eq!(*r.read(&x).unwrap(), 99);

    w.abort().unwrap();
    assert_eq!(x.load(), 7);

    let err = r.end().unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::ValidationFailed(x.id())));
}

#[test]
fn test_early_detection_aborts_reader_of_owned_object() {
    let engine = direct_engine(ConflictDetection::Early);
    let writer = engine.initialize_thread();
    let reader = engine.initialize_thread();
    let x = TxObject::new(7u64);

    let mut w = writer.transaction().unwrap();
    *w.write(&x).unwrap() = 99;

    let r = reader.transaction().unwrap();
    let err = r.read(&x).unwrap_err();
    assert_eq!(err, Error::Aborted(AbortReason::ReadConflict(x.id())));
    // the attempt stays doomed
    assert!(r.read(&x).unwrap_err().is_abort());
    drop(r);

    w.end().unwrap();
    assert_eq!(x.load(), 99);
}

#[test]
fn test_deleted_object_survives_abort() {
    let engine = direct_engine(ConflictDetection::Early);
    let thread = engine.initialize_thread();
    let x = TxObject::new(String::from("keep me"));

    let mut tx = thread.transaction().unwrap();
    tx.write(&x).unwrap().push('!');
    tx.delete_memory(&x).unwrap();
    assert!(matches!(tx.read(&x), Err(Error::Deleted(_))));
    tx.abort().unwrap();

    assert_eq!(x.load(), "keep me");
    assert!(!x.header().is_retired());
    assert_eq!(engine.pending_reclamation(), 0);
}
