use std::sync::Arc;

use sheaf::{Database, StoreConfig};

#[test]
fn concurrent_disjoint_writers_and_reader() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_map::<i64, String>("s2").unwrap();

    let writer_low = {
        let map = map.clone();
        std::thread::spawn(move || {
            for k in 1..=500i64 {
                map.put(k, format!("v{k}")).unwrap();
            }
        })
    };
    let writer_high = {
        let map = map.clone();
        std::thread::spawn(move || {
            for k in 501..=1000i64 {
                map.put(k, format!("v{k}")).unwrap();
            }
        })
    };

    // Reader races the writers; whatever it sees must be strictly
    // ascending and at least as much as was committed at cursor creation.
    let reader = {
        let map = map.clone();
        std::thread::spawn(move || {
            for _ in 0..20 {
                let committed_before = map.size();
                let mut previous = None;
                let mut seen = 0u64;
                for entry in map.cursor(None, None).unwrap() {
                    let (key, _) = entry.unwrap();
                    if let Some(previous) = previous {
                        assert!(key > previous);
                    }
                    previous = Some(key);
                    seen += 1;
                }
                assert!(
                    seen >= committed_before,
                    "cursor saw {seen} entries, {committed_before} were committed before"
                );
            }
        })
    };

    writer_low.join().unwrap();
    writer_high.join().unwrap();
    reader.join().unwrap();

    assert_eq!(map.size(), 1000);
    let keys: Vec<i64> = map
        .cursor(None, None)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, (1..=1000).collect::<Vec<i64>>());

    db.close().unwrap();
}

#[test]
fn concurrent_writers_on_the_same_leaf() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_map::<i64, i64>("hot").unwrap();

    let mut handles = Vec::new();
    for t in 0..4i64 {
        let map = map.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..250i64 {
                let key = i * 4 + t;
                map.put(key, key).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.size(), 1000);
    for key in 0..1000i64 {
        assert_eq!(map.get(&key).unwrap(), Some(key));
    }

    db.close().unwrap();
}

#[test]
fn cursor_keeps_a_weak_snapshot() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_map::<i64, String>("snap").unwrap();
    for k in 1..=10 {
        map.put(k, "before".to_string()).unwrap();
    }

    let mut cursor = map.cursor(None, None).unwrap();
    // Consume the first entry, then mutate a key the cursor has passed and
    // one it has not reached, without structural changes.
    let (first_key, first_value) = cursor.next().unwrap().unwrap();
    assert_eq!(first_key, 1);
    assert_eq!(first_value, "before");

    map.put(1, "after".to_string()).unwrap();
    map.put(5, "after".to_string()).unwrap();

    // The loaded leaf image is immutable: the cursor still reports the
    // pre-put view for entries on it.
    let rest: Vec<(i64, String)> = cursor.map(|entry| entry.unwrap()).collect();
    assert_eq!(rest.len(), 9);
    for (key, value) in rest {
        assert_eq!(value, "before", "key {key} should show the snapshot value");
    }

    // A new cursor sees the updates.
    let fresh: Vec<String> = map
        .cursor(Some(1), Some(1))
        .unwrap()
        .map(|entry| entry.unwrap().1)
        .collect();
    assert_eq!(fresh, vec!["after".to_string()]);

    db.close().unwrap();
}

#[test]
fn readers_never_block_on_writers() {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let map = db.open_map::<i64, i64>("noblock").unwrap();
    for k in 0..100 {
        map.put(k, k).unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer = {
        let map = map.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut round = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                map.put(round % 100, round).unwrap();
                round += 1;
            }
        })
    };

    for _ in 0..1000 {
        let value = map.get(&42).unwrap();
        assert!(value.is_some());
    }
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    writer.join().unwrap();

    db.close().unwrap();
}
