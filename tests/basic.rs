//! Integration tests exercising `PersistentMap` against real memory-mapped
//! files.

use pmap::{Error, PersistentMap};
use tempfile::tempdir;

fn base_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn fresh_file_opens_empty() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<i64, i64> =
        PersistentMap::with_capacity(base_path(&dir, "map"), 5).unwrap();

    assert_eq!(map.count().unwrap(), 0);
    assert_eq!(map.get(&1).unwrap(), None);
}

#[test]
fn round_trip_add_get_remove() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    map.add(1, 100).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(100));
    assert!(map.remove(&1).unwrap());
    assert_eq!(map.get(&1).unwrap(), None);
}

#[test]
fn add_duplicate_key_fails() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    map.add(1, 100).unwrap();
    match map.add(1, 200) {
        Err(Error::DuplicateKey) => {}
        other => panic!("expected DuplicateKey, got {:?}", other),
    }
}

#[test]
fn set_updates_in_place() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    map.set(1, 100).unwrap();
    let old = map.set(1, 200).unwrap();
    assert_eq!(old, Some(100));
    assert_eq!(map.get(&1).unwrap(), Some(200));
}

#[test]
fn removed_slot_is_reused_by_a_later_insert() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    map.add(1, 10).unwrap();
    map.add(2, 20).unwrap();
    assert!(map.remove(&1).unwrap());
    map.add(3, 30).unwrap();

    assert_eq!(map.get(&1).unwrap(), None);
    assert_eq!(map.get(&2).unwrap(), Some(20));
    assert_eq!(map.get(&3).unwrap(), Some(30));
    assert_eq!(map.count().unwrap(), 2);
}

#[test]
fn remove_missing_key_returns_false() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    map.add(1, 10).unwrap();
    // See DESIGN.md item 2 for why this returns the correct boolean.
    assert!(!map.remove(&2).unwrap());
    assert!(map.remove(&1).unwrap());
}

#[test]
fn clear_empties_the_map_and_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    for i in 0..10 {
        map.add(i, i * 10).unwrap();
    }
    map.clear().unwrap();
    assert_eq!(map.count().unwrap(), 0);
    for i in 0..10 {
        assert_eq!(map.get(&i).unwrap(), None);
    }

    // Clearing an already-empty map is a no-op on its logical contents.
    map.clear().unwrap();
    assert_eq!(map.count().unwrap(), 0);
}

#[test]
fn resize_triggers_and_all_keys_remain_reachable() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> =
        PersistentMap::with_capacity(base_path(&dir, "map"), 5).unwrap();

    for i in 0..1000i64 {
        map.add(i, i * 2).unwrap();
    }
    for i in 0..1000i64 {
        assert_eq!(map.get(&i).unwrap(), Some(i * 2));
    }
    assert_eq!(map.count().unwrap(), 1000);
}

#[test]
fn reopening_preserves_contents_across_processes() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    {
        let mut map: PersistentMap<i64, i64> = PersistentMap::new(&path).unwrap();
        map.add(1, 111).unwrap();
        map.add(2, 222).unwrap();
    }

    let map: PersistentMap<i64, i64> = PersistentMap::new(&path).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(111));
    assert_eq!(map.get(&2).unwrap(), Some(222));
    assert_eq!(map.count().unwrap(), 2);
}

#[test]
fn iter_yields_all_live_pairs() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    map.add(1, 10).unwrap();
    map.add(2, 20).unwrap();
    map.add(3, 30).unwrap();
    map.remove(&2).unwrap();

    let mut pairs: Vec<(i64, i64)> = map.iter().collect::<Result<_, _>>().unwrap();
    pairs.sort();
    assert_eq!(pairs, vec![(1, 10), (3, 30)]);
}

#[test]
fn iter_detects_concurrent_modification() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();
    map.add(1, 10).unwrap();
    map.add(2, 20).unwrap();

    let mut it = map.iter();
    // Force a version bump in between pulls. This is legal here only
    // because `iter()` took a shared borrow and `add` below is sequenced
    // strictly after -- a real concurrent mutation would come from a
    // second process, which this single-process test stands in for by
    // mutating between `next()` calls instead of during one.
    let _ = it.next();
    drop(it);

    let mut it2 = map.iter();
    map.add(3, 30).unwrap();
    match it2.next() {
        Some(Err(Error::ConcurrentlyModified)) => {}
        other => panic!("expected ConcurrentlyModified, got {:?}", other.map(|r| r.ok())),
    }
}

#[test]
fn two_handles_to_same_file_see_each_others_writes() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    let mut writer: PersistentMap<i64, i64> = PersistentMap::new(&path).unwrap();
    let reader: PersistentMap<i64, i64> = PersistentMap::new(&path).unwrap();

    assert_eq!(reader.get(&1).unwrap(), None);
    writer.add(1, 42).unwrap();
    assert_eq!(reader.get(&1).unwrap(), Some(42));
}

#[test]
fn contains_key_matches_get() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    assert!(!map.contains_key(&1).unwrap());
    map.add(1, 1).unwrap();
    assert!(map.contains_key(&1).unwrap());
}

#[test]
fn index_errors_on_missing_key() {
    let dir = tempdir().unwrap();
    let map: PersistentMap<i64, i64> = PersistentMap::new(base_path(&dir, "map")).unwrap();

    match map.index(&1) {
        Err(Error::NotFound) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn null_key_is_rejected_on_every_entry_point() {
    let dir = tempdir().unwrap();
    let mut map: PersistentMap<Option<i64>, i64> =
        PersistentMap::new(base_path(&dir, "map")).unwrap();

    match map.get(&None) {
        Err(Error::NullKey) => {}
        other => panic!("expected NullKey, got {:?}", other),
    }
    match map.add(None, 1) {
        Err(Error::NullKey) => {}
        other => panic!("expected NullKey, got {:?}", other),
    }
    match map.set(None, 1) {
        Err(Error::NullKey) => {}
        other => panic!("expected NullKey, got {:?}", other),
    }
    match map.remove(&None) {
        Err(Error::NullKey) => {}
        other => panic!("expected NullKey, got {:?}", other),
    }

    // A real key still works; only `None` is rejected.
    map.add(Some(1), 10).unwrap();
    assert_eq!(map.get(&Some(1)).unwrap(), Some(10));
}
