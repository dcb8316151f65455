use std::time::Duration;

use sheaf::{Database, SheafError, StoreConfig, TxnStatus};

fn collect<K: sheaf::KeyType, V: sheaf::RecordType>(
    map: &sheaf::TransactionMap<K, V>,
    txn: &sheaf::Transaction,
) -> Vec<(K, V)> {
    map.cursor(txn, None, None)
        .unwrap()
        .map(|entry| entry.unwrap())
        .collect()
}

#[test]
fn put_get_remove_round_trip() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("t1").unwrap();

    let txn = db.engine().begin();
    assert_eq!(map.put(&txn, 1, "a".into()).unwrap(), None);
    assert_eq!(map.get(&txn, &1).unwrap(), Some("a".to_string()));
    assert_eq!(map.remove(&txn, 1).unwrap(), Some("a".to_string()));
    assert_eq!(map.get(&txn, &1).unwrap(), None);
    txn.commit().unwrap();

    let txn = db.engine().begin();
    assert_eq!(map.get(&txn, &1).unwrap(), None);
    txn.rollback().unwrap();

    db.close().unwrap();
}

#[test]
fn uncommitted_writes_are_invisible_to_others() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("vis").unwrap();

    let writer = db.engine().begin();
    map.put(&writer, 10, "pending".into()).unwrap();

    let reader = db.engine().begin();
    assert_eq!(map.get(&reader, &10).unwrap(), None);
    assert_eq!(map.get(&writer, &10).unwrap(), Some("pending".to_string()));

    writer.commit().unwrap();
    assert_eq!(map.get(&reader, &10).unwrap(), Some("pending".to_string()));
    reader.rollback().unwrap();

    db.close().unwrap();
}

#[test]
fn rollback_restores_the_previous_state() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("undo").unwrap();

    let setup = db.engine().begin();
    for k in 1..=20 {
        map.put(&setup, k, format!("base{k}")).unwrap();
    }
    setup.commit().unwrap();

    let probe = db.engine().begin();
    let before = collect(&map, &probe);
    probe.rollback().unwrap();

    let txn = db.engine().begin();
    for k in 1..=10 {
        map.put(&txn, k, format!("changed{k}")).unwrap();
    }
    map.remove(&txn, 15).unwrap();
    map.put(&txn, 100, "new".into()).unwrap();
    txn.rollback().unwrap();

    let probe = db.engine().begin();
    let after = collect(&map, &probe);
    probe.rollback().unwrap();
    assert_eq!(before, after);

    db.close().unwrap();
}

#[test]
fn savepoint_rollback() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("sp").unwrap();

    let txn = db.engine().begin();
    map.put(&txn, 1, "a".into()).unwrap();
    txn.add_savepoint("s");
    map.put(&txn, 1, "b".into()).unwrap();
    map.put(&txn, 2, "c".into()).unwrap();
    txn.rollback_to_savepoint("s").unwrap();
    txn.commit().unwrap();

    let probe = db.engine().begin();
    assert_eq!(map.get(&probe, &1).unwrap(), Some("a".to_string()));
    assert_eq!(map.get(&probe, &2).unwrap(), None);
    probe.rollback().unwrap();

    db.close().unwrap();
}

#[test]
fn savepoint_rollback_is_idempotent() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("sp2").unwrap();

    let txn = db.engine().begin();
    txn.add_savepoint("s");
    map.put(&txn, 1, "x".into()).unwrap();
    map.put(&txn, 2, "y".into()).unwrap();
    txn.rollback_to_savepoint("s").unwrap();
    txn.rollback_to_savepoint("s").unwrap();
    txn.commit().unwrap();

    let probe = db.engine().begin();
    assert_eq!(collect(&map, &probe), Vec::<(i64, String)>::new());
    probe.rollback().unwrap();

    assert!(db
        .engine()
        .begin()
        .rollback_to_savepoint("missing")
        .is_err());

    db.close().unwrap();
}

#[test]
fn row_lock_blocks_second_writer_until_commit() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("lock").unwrap();

    let a = db.engine().begin();
    map.put(&a, 42, "a1".into()).unwrap();

    let b = db.engine().begin();
    let b_clone = b.clone();
    let map_clone = map.clone();
    let blocked = std::thread::spawn(move || {
        map_clone.put(&b_clone, 42, "b1".into()).unwrap();
        b_clone.log_id()
    });

    // B must enter WAITING on A's row lock.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while b.status() != TxnStatus::Waiting {
        assert!(
            std::time::Instant::now() < deadline,
            "second writer never blocked"
        );
        std::thread::sleep(Duration::from_millis(2));
    }

    a.commit().unwrap();
    let b_log_entries = blocked.join().unwrap();
    assert_eq!(b_log_entries, 1, "the woken writer logged its new value");
    assert_eq!(map.get(&b, &42).unwrap(), Some("b1".to_string()));
    b.commit().unwrap();

    let probe = db.engine().begin();
    assert_eq!(map.get(&probe, &42).unwrap(), Some("b1".to_string()));
    probe.rollback().unwrap();

    db.close().unwrap();
}

#[test]
fn wait_for_cycle_is_detected_as_deadlock() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("dead").unwrap();

    let a = db.engine().begin();
    let b = db.engine().begin();
    map.put(&a, 1, "a".into()).unwrap();
    map.put(&b, 2, "b".into()).unwrap();

    // A blocks on 2 (held by B) in a helper thread, then B tries 1.
    let a_clone = a.clone();
    let map_clone = map.clone();
    let a_wait = std::thread::spawn(move || map_clone.put(&a_clone, 2, "a2".into()));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while a.status() != TxnStatus::Waiting {
        assert!(std::time::Instant::now() < deadline, "A never blocked");
        std::thread::sleep(Duration::from_millis(2));
    }

    let err = map.put(&b, 1, "b1".into()).unwrap_err();
    assert!(matches!(err, SheafError::Deadlock(_)), "got {err:?}");
    // The detecting transaction aborted, which releases its rows and lets
    // A finish.
    assert_eq!(b.status(), TxnStatus::Closed);
    a_wait.join().unwrap().unwrap();
    a.commit().unwrap();

    let probe = db.engine().begin();
    assert_eq!(map.get(&probe, &2).unwrap(), Some("a2".to_string()));
    probe.rollback().unwrap();

    db.close().unwrap();
}

#[test]
fn lock_row_takes_the_lock_without_changing_the_value() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("forupd").unwrap();

    let setup = db.engine().begin();
    map.put(&setup, 3, "base".into()).unwrap();
    setup.commit().unwrap();

    let a = db.engine().begin();
    assert_eq!(map.lock_row(&a, 3).unwrap(), Some("base".to_string()));

    let b = db.engine().begin();
    let b_clone = b.clone();
    let map_clone = map.clone();
    let blocked = std::thread::spawn(move || map_clone.put(&b_clone, 3, "b".into()));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while b.status() != TxnStatus::Waiting {
        assert!(std::time::Instant::now() < deadline, "writer never blocked");
        std::thread::sleep(Duration::from_millis(2));
    }

    // The lock holder did not change the value.
    assert_eq!(map.get_committed(&3).unwrap(), Some("base".to_string()));
    a.commit().unwrap();
    blocked.join().unwrap().unwrap();
    b.commit().unwrap();

    let probe = db.engine().begin();
    assert_eq!(map.get(&probe, &3).unwrap(), Some("b".to_string()));
    probe.rollback().unwrap();

    db.close().unwrap();
}

#[test]
fn transactional_put_if_absent_and_replace() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("cond").unwrap();

    let txn = db.engine().begin();
    assert_eq!(map.put_if_absent(&txn, 5, "v1".into()).unwrap(), None);
    assert_eq!(
        map.put_if_absent(&txn, 5, "v2".into()).unwrap(),
        Some("v1".to_string())
    );
    assert!(map.replace(&txn, 5, "v1".into(), "v3".into()).unwrap());
    assert!(!map.replace(&txn, 5, "v1".into(), "v4".into()).unwrap());
    assert_eq!(map.get(&txn, &5).unwrap(), Some("v3".to_string()));
    txn.commit().unwrap();

    db.close().unwrap();
}

#[test]
fn append_through_a_transaction() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("tapp").unwrap();

    let txn = db.engine().begin();
    let k1 = map.append(&txn, "first".into()).unwrap();
    let k2 = map.append(&txn, "second".into()).unwrap();
    assert!(k2 > k1);
    txn.commit().unwrap();

    let probe = db.engine().begin();
    assert_eq!(map.get(&probe, &k1).unwrap(), Some("first".to_string()));
    assert_eq!(map.get(&probe, &k2).unwrap(), Some("second".to_string()));
    probe.rollback().unwrap();

    db.close().unwrap();
}

#[test]
fn async_put_retries_after_lock_release() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("aretry").unwrap();

    let a = db.engine().begin();
    map.put(&a, 9, "held".into()).unwrap();

    let b = db.engine().begin();
    let (tx, rx) = std::sync::mpsc::channel();
    map.async_put(&b, 9, "waited".into(), move |result| {
        let _ = tx.send(result.into_result());
    });

    // The async write is parked as a waiter; nothing arrives yet.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    a.commit().unwrap();
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(outcome, Some("held".to_string()));
    assert_eq!(map.get(&b, &9).unwrap(), Some("waited".to_string()));
    b.commit().unwrap();

    db.close().unwrap();
}

#[test]
fn isolation_level_round_trip() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let txn = db.engine().begin();
    assert_eq!(txn.isolation_level(), sheaf::IsolationLevel::ReadCommitted);
    txn.set_isolation_level(sheaf::IsolationLevel::Serializable);
    assert_eq!(txn.isolation_level(), sheaf::IsolationLevel::Serializable);
    txn.rollback().unwrap();
    db.close().unwrap();
}

#[test]
fn commit_persists_redo_before_acknowledging() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("redo");

    let db = Database::open(Some(dir.clone()), StoreConfig::default()).unwrap();
    let map = db.open_transaction_map::<i64, String>("durable").unwrap();
    let txn = db.engine().begin();
    map.put(&txn, 1, "logged".into()).unwrap();
    txn.commit().unwrap();
    db.close().unwrap();

    let redo_path = dir.join("redo.log");
    let metadata = std::fs::metadata(redo_path).unwrap();
    assert!(metadata.len() > 0, "redo log is empty after a commit");
}
