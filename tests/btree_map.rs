use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use sheaf::{Database, StoreConfig};

fn open_db() -> Arc<Database> {
    Database::open_in_memory(StoreConfig::default()).unwrap()
}

#[test]
fn sequential_insert_and_read() {
    let db = open_db();
    let map = db.open_map::<i64, String>("seq").unwrap();

    for k in 1..=1000i64 {
        assert_eq!(map.put(k, format!("v{k}")).unwrap(), None);
    }

    assert_eq!(map.size(), 1000);
    assert_eq!(map.get(&1).unwrap(), Some("v1".to_string()));
    assert_eq!(map.get(&1000).unwrap(), Some("v1000".to_string()));
    assert_eq!(map.get(&1001).unwrap(), None);
    assert_eq!(map.first_key().unwrap(), Some(1));
    assert_eq!(map.last_key().unwrap(), Some(1000));

    db.close().unwrap();
}

#[test]
fn neighbour_keys() {
    let db = open_db();
    let map = db.open_map::<i64, i64>("bounds").unwrap();
    for k in (2..=1000).step_by(2) {
        map.put(k, k).unwrap();
    }

    // 500 exists; 501 does not.
    assert_eq!(map.floor_key(&500).unwrap(), Some(500));
    assert_eq!(map.floor_key(&501).unwrap(), Some(500));
    assert_eq!(map.ceiling_key(&501).unwrap(), Some(502));
    assert_eq!(map.ceiling_key(&502).unwrap(), Some(502));
    assert_eq!(map.higher_key(&502).unwrap(), Some(504));
    assert_eq!(map.lower_key(&502).unwrap(), Some(500));

    // Falling off either end.
    assert_eq!(map.lower_key(&2).unwrap(), None);
    assert_eq!(map.floor_key(&1).unwrap(), None);
    assert_eq!(map.higher_key(&1000).unwrap(), None);
    assert_eq!(map.ceiling_key(&1001).unwrap(), None);

    db.close().unwrap();
}

#[test]
fn iteration_is_ordered_and_counts_match() {
    let db = open_db();
    let map = db.open_map::<i64, String>("ordered").unwrap();

    // Shuffled-ish insertion order.
    for k in (1..=500).rev() {
        map.put(k * 2, format!("v{k}")).unwrap();
    }
    for k in 1..=250 {
        map.put(k * 2 - 1, format!("w{k}")).unwrap();
    }

    let mut previous = None;
    let mut count = 0u64;
    for entry in map.cursor(None, None).unwrap() {
        let (key, _) = entry.unwrap();
        if let Some(previous) = previous {
            assert!(key > previous, "cursor went backwards: {previous} -> {key}");
        }
        previous = Some(key);
        count += 1;
    }
    assert_eq!(count, map.size());

    db.close().unwrap();
}

#[test]
fn cursor_respects_bounds() {
    let db = open_db();
    let map = db.open_map::<i64, i64>("range").unwrap();
    for k in 1..=100 {
        map.put(k, k * 10).unwrap();
    }

    let collected: Vec<i64> = map
        .cursor(Some(40), Some(60))
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(collected, (40..=60).collect::<Vec<i64>>());

    db.close().unwrap();
}

#[test]
fn cursor_over_enumerated_leaf_pages() {
    let db = Database::open_in_memory(StoreConfig::default().page_split_size(4)).unwrap();
    let map = db.open_map::<i64, i64>("pages").unwrap();
    for k in 1..=40 {
        map.put(k, k).unwrap();
    }

    let page_keys = map.leaf_page_keys().unwrap();
    assert!(page_keys.len() > 1);
    assert!(page_keys[0].first);

    // Visit only the last two leaves, in the given order.
    let picked: Vec<_> = page_keys[page_keys.len() - 2..].to_vec();
    let start = picked[0].key;
    let keys: Vec<i64> = map
        .cursor_over_pages(None, None, picked)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, (start..=40).collect::<Vec<i64>>());

    db.close().unwrap();
}

#[test]
fn put_if_absent_keeps_first_value() {
    let db = open_db();
    let map = db.open_map::<i64, String>("pia").unwrap();

    assert_eq!(map.put_if_absent(7, "v1".into()).unwrap(), None);
    assert_eq!(
        map.put_if_absent(7, "v2".into()).unwrap(),
        Some("v1".to_string())
    );
    assert_eq!(map.get(&7).unwrap(), Some("v1".to_string()));
    assert_eq!(map.size(), 1);

    db.close().unwrap();
}

#[test]
fn replace_compares_by_value() {
    let db = open_db();
    let map = db.open_map::<i64, String>("rep").unwrap();
    map.put(1, "old".into()).unwrap();

    assert!(!map.replace(1, "wrong".into(), "new".into()).unwrap());
    assert_eq!(map.get(&1).unwrap(), Some("old".to_string()));

    assert!(map.replace(1, "old".into(), "new".into()).unwrap());
    assert_eq!(map.get(&1).unwrap(), Some("new".to_string()));

    // Absent key never replaces.
    assert!(!map.replace(2, "x".into(), "y".into()).unwrap());

    db.close().unwrap();
}

#[test]
fn remove_returns_old_value_and_shrinks() {
    let db = open_db();
    let map = db.open_map::<i64, String>("rm").unwrap();
    for k in 1..=50 {
        map.put(k, format!("v{k}")).unwrap();
    }

    assert_eq!(map.remove(25).unwrap(), Some("v25".to_string()));
    assert_eq!(map.remove(25).unwrap(), None);
    assert_eq!(map.get(&25).unwrap(), None);
    assert_eq!(map.size(), 49);
    assert_eq!(map.floor_key(&25).unwrap(), Some(24));
    assert_eq!(map.ceiling_key(&25).unwrap(), Some(26));

    db.close().unwrap();
}

#[test]
fn append_reserves_increasing_keys() {
    let db = open_db();
    let map = db.open_map::<i64, String>("app").unwrap();

    let k1 = map.append("a".into()).unwrap();
    let k2 = map.append("b".into()).unwrap();
    assert!(k2 > k1);
    assert_eq!(map.get(&k1).unwrap(), Some("a".to_string()));
    assert_eq!(map.get(&k2).unwrap(), Some("b".to_string()));

    db.close().unwrap();
}

#[test]
fn append_is_rejected_for_non_numeric_keys() {
    let db = open_db();
    let map = db.open_map::<String, String>("appstr").unwrap();
    assert!(map.append("x".into()).is_err());
    db.close().unwrap();
}

#[test]
fn async_put_completes_on_handler() {
    let db = open_db();
    let map = db.open_map::<i64, String>("async").unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for k in 0..32i64 {
        let done = Arc::clone(&done);
        map.async_put(k, format!("v{k}"), move |result| {
            assert!(result.is_succeeded());
            done.fetch_add(1, Ordering::SeqCst);
        });
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while done.load(Ordering::SeqCst) < 32 {
        assert!(std::time::Instant::now() < deadline, "async puts did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(map.size(), 32);

    db.close().unwrap();
}

#[test]
fn clear_leaves_an_empty_root_leaf() {
    let db = open_db();
    let map = db.open_map::<i64, i64>("clr").unwrap();
    for k in 1..=200 {
        map.put(k, k).unwrap();
    }
    map.clear().unwrap();
    assert_eq!(map.size(), 0);
    assert_eq!(map.first_key().unwrap(), None);
    assert_eq!(map.get(&100).unwrap(), None);
    map.put(5, 5).unwrap();
    assert_eq!(map.size(), 1);

    db.close().unwrap();
}

#[test]
fn closed_map_rejects_operations() {
    let db = open_db();
    let map = db.open_map::<i64, i64>("closed").unwrap();
    map.put(1, 1).unwrap();
    map.close().unwrap();
    assert!(map.get(&1).is_err());
    assert!(map.put(2, 2).is_err());

    db.close().unwrap();
}

#[test]
fn read_only_map_rejects_writes() {
    let db = Database::open_in_memory(StoreConfig::default().read_only()).unwrap();
    let map = db.open_map::<i64, i64>("ro").unwrap();
    assert!(map.put(1, 1).is_err());
    assert_eq!(map.get(&1).unwrap(), None);
    db.close().unwrap();
}

#[test]
fn save_and_reopen_restores_entries() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("store");

    {
        let db = Database::open(Some(dir.clone()), StoreConfig::default()).unwrap();
        let map = db.open_map::<i64, String>("persist").unwrap();
        for k in 1..=300 {
            map.put(k, format!("v{k}")).unwrap();
        }
        map.save().unwrap();
        map.close().unwrap();
        db.close().unwrap();
    }

    let db = Database::open(Some(dir), StoreConfig::default()).unwrap();
    let map = db.open_map::<i64, String>("persist").unwrap();
    assert_eq!(map.size(), 300);
    assert_eq!(map.get(&157).unwrap(), Some("v157".to_string()));
    let count = map.cursor(None, None).unwrap().count();
    assert_eq!(count, 300);
    map.close().unwrap();
    db.close().unwrap();
}

#[test]
fn force_save_writes_even_when_clean() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("force");

    let db = Database::open(Some(dir.clone()), StoreConfig::default()).unwrap();
    let map = db.open_map::<i64, i64>("sealed").unwrap();
    map.put(1, 1).unwrap();
    map.save().unwrap();
    // Clean now: a plain save is a no-op, a force save is not.
    map.save().unwrap();
    map.force_save().unwrap();
    map.close().unwrap();
    db.close().unwrap();

    let db = Database::open(Some(dir), StoreConfig::default()).unwrap();
    let map = db.open_map::<i64, i64>("sealed").unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(1));
    map.close().unwrap();
    db.close().unwrap();
}
