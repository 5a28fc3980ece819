//! Crash-equivalence tests: interrupt an operation at a labelled
//! fault-injection scenario, drop the (now lock-poisoned) map, reopen the
//! same files, and check that the very next operation's recovery pass
//! leaves the map in either the before- or after-state of the interrupted
//! operation -- never something in between.
//!
//! Because these tests run the "crash" in-process (there is no separate
//! process to actually kill), the orphan detection in the acquisition path
//! takes its "reentrant orphan" branch (`holder == self_pid`), which is
//! otherwise only reachable under fault injection -- exactly this test
//! harness.

use std::panic::{self, AssertUnwindSafe};

use pmap::{ChaosMonkey, Options, PersistentMap};
use tempfile::tempdir;

fn base_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

/// Run `op` under a `PersistentMap` armed to panic at `scenario`, catching
/// the resulting unwind to simulate the writing process being killed.
fn crash_during<K, V>(
    path: &std::path::Path,
    scenario: u32,
    op: impl FnOnce(&mut PersistentMap<K, V, pmap::DefaultHasher, ChaosMonkey>) + panic::UnwindSafe,
) where
    K: Copy + std::hash::Hash + Eq + 'static,
    V: Copy + 'static,
{
    let mut map: PersistentMap<K, V, pmap::DefaultHasher, ChaosMonkey> =
        PersistentMap::with_options(
            path,
            Options {
                capacity: 5,
                hasher: pmap::DefaultHasher,
                logger: slog::Logger::root(slog::Discard, slog::o!()),
                crash: ChaosMonkey::new(scenario),
            },
        )
        .unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| op(&mut map)));
    assert!(result.is_err(), "expected scenario {} to panic", scenario);
    // `map` is dropped here without ever releasing the write lock: the
    // buckets file's `lock_pid` is left pointing at this (still-alive, but
    // logically "dead" for the purposes of this test) process.
}

fn reopen<K, V>(path: &std::path::Path) -> PersistentMap<K, V>
where
    K: Copy + std::hash::Hash + Eq + 'static,
    V: Copy + 'static,
{
    PersistentMap::new(path).unwrap()
}

#[test]
fn scenario_42_crash_during_insert_on_empty_map_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    crash_during::<i64, i64>(&path, 42, |map| {
        map.add(1, 100).unwrap();
    });

    let mut map = reopen::<i64, i64>(&path);
    assert_eq!(map.get(&1).unwrap(), None);
    assert_eq!(map.count().unwrap(), 0);

    // The map must still be usable afterward.
    map.add(1, 100).unwrap();
    assert_eq!(map.get(&1).unwrap(), Some(100));
}

#[test]
fn scenario_73_crash_during_remove_with_predecessor_preserves_other_keys() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    {
        let mut map = reopen::<i64, i64>(&path);
        map.add(1, 10).unwrap();
        map.add(2, 20).unwrap();
    }

    crash_during::<i64, i64>(&path, 73, |map| {
        map.remove(&1).unwrap();
    });

    let map = reopen::<i64, i64>(&path);
    assert_eq!(map.get(&1).unwrap(), Some(10));
    assert_eq!(map.get(&2).unwrap(), Some(20));
}

#[test]
fn scenario_21_crash_before_allocation_decision_is_a_no_op() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    crash_during::<i64, i64>(&path, 21, |map| {
        map.add(1, 100).unwrap();
    });

    let map = reopen::<i64, i64>(&path);
    assert_eq!(map.get(&1).unwrap(), None);
    assert_eq!(map.count().unwrap(), 0);
}

#[test]
fn scenario_12_crash_mid_value_update_restores_old_value() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    {
        let mut map = reopen::<i64, i64>(&path);
        map.add(1, 100).unwrap();
    }

    crash_during::<i64, i64>(&path, 12, |map| {
        map.set(1, 999).unwrap();
    });

    // Bit 1 (UPDATE_VALUE) was set but the crash occurred before the value
    // write committed (scenario 12 is between journal-write and
    // value-write); recovery must restore the pre-update value.
    let map = reopen::<i64, i64>(&path);
    assert_eq!(map.get(&1).unwrap(), Some(100));
}

#[test]
fn scenario_13_crash_after_value_write_still_restores_old_value() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    {
        let mut map = reopen::<i64, i64>(&path);
        map.add(1, 100).unwrap();
    }

    crash_during::<i64, i64>(&path, 13, |map| {
        map.set(1, 999).unwrap();
    });

    // Bit 1 (UPDATE_VALUE) is still set -- the crash landed after the new
    // value committed but before `clear_recovery_flags` ran. Recovery reads
    // the bit, not the value, as the source of truth: it restores the
    // pre-update value exactly as it would for scenario 12.
    let map = reopen::<i64, i64>(&path);
    assert_eq!(map.get(&1).unwrap(), Some(100));
}

#[test]
fn invariants_hold_after_recovery_from_every_resize_scenario() {
    for scenario in [33u32, 34, 35] {
        let dir = tempdir().unwrap();
        let path = base_path(&dir, "map");
        {
            // capacity 5 opens at generation 1 (capacity_of(1) == 7); filling
            // exactly 7 keys leaves the next `add` as the one that resizes.
            let mut map = reopen::<i64, i64>(&path);
            for i in 0..7i64 {
                map.add(i, i * 10).unwrap();
            }
        }

        crash_during::<i64, i64>(&path, scenario, |map| {
            map.add(7, 70).unwrap();
        });

        let mut map = reopen::<i64, i64>(&path);
        for i in 0..7i64 {
            assert_eq!(map.get(&i).unwrap(), Some(i * 10), "scenario {}", scenario);
        }
        let seven = map.get(&7).unwrap();
        assert!(
            seven.is_none() || seven == Some(70),
            "scenario {} left a torn insert: {:?}",
            scenario,
            seven
        );
        // The map must remain usable, including growing further.
        map.add(100, 1000).unwrap();
        assert_eq!(map.get(&100).unwrap(), Some(1000));
    }
}

#[test]
fn scenario_6_crash_during_clear_is_idempotent_on_retry() {
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    {
        let mut map = reopen::<i64, i64>(&path);
        for i in 0..5i64 {
            map.add(i, i).unwrap();
        }
    }

    crash_during::<i64, i64>(&path, 6, |map| {
        map.clear().unwrap();
    });

    let mut map = reopen::<i64, i64>(&path);
    assert_eq!(map.count().unwrap(), 0);
    for i in 0..5i64 {
        assert_eq!(map.get(&i).unwrap(), None);
    }
    map.add(0, 0).unwrap();
    assert_eq!(map.get(&0).unwrap(), Some(0));
}

#[test]
fn invariants_hold_after_recovery_from_every_insert_scenario() {
    // Exercises every fault-injection point inside `add`.
    for scenario in [11u32, 21, 22, 23, 24, 25, 26, 31, 32, 41, 42, 43, 44] {
        // 12/13 (value-update) and 33/34/35 (resize) are exercised in their
        // own dedicated tests above, since they need a pre-populated or
        // pre-filled map rather than the fresh map this loop sets up.
        let dir = tempdir().unwrap();
        let path = base_path(&dir, "map");
        {
            let mut map = reopen::<i64, i64>(&path);
            map.add(0, 0).unwrap();
        }

        crash_during::<i64, i64>(&path, scenario, |map| {
            map.add(1, 1).unwrap();
        });

        let mut map = reopen::<i64, i64>(&path);
        // Key 0 must survive every `add(1, ...)` crash scenario regardless
        // of whether `add(1, ...)` itself committed.
        assert_eq!(map.get(&0).unwrap(), Some(0), "scenario {}", scenario);
        let one = map.get(&1).unwrap();
        assert!(
            one.is_none() || one == Some(1),
            "scenario {} left a torn value: {:?}",
            scenario,
            one
        );
        // The map must remain usable: further mutation should not error.
        let _ = map.remove(&1).unwrap();
    }
}

#[test]
fn invariants_hold_after_recovery_from_every_remove_scenario() {
    for scenario in [51u32, 52, 71, 72, 73, 74, 75] {
        let dir = tempdir().unwrap();
        let path = base_path(&dir, "map");
        {
            let mut map = reopen::<i64, i64>(&path);
            map.add(1, 1).unwrap();
            map.add(2, 2).unwrap();
        }

        crash_during::<i64, i64>(&path, scenario, |map| {
            map.remove(&1).unwrap();
        });

        let mut map = reopen::<i64, i64>(&path);
        assert_eq!(map.get(&2).unwrap(), Some(2), "scenario {}", scenario);
        let one = map.get(&1).unwrap();
        assert!(
            one.is_none() || one == Some(1),
            "scenario {} left a torn removal: {:?}",
            scenario,
            one
        );
        let _ = map.remove(&2).unwrap();
    }
}

#[test]
fn second_process_steals_an_orphaned_lock_and_recovers() {
    // A lock left by a process killed mid-operation is detected and stolen
    // by the next attacher, which replays recovery before proceeding with
    // its own operation.
    let dir = tempdir().unwrap();
    let path = base_path(&dir, "map");

    crash_during::<i64, i64>(&path, 43, |map| {
        map.add(1, 1).unwrap();
    });

    // A fresh handle (standing in for "process B") must be able to insert
    // immediately; its first `add` steals the lock and recovers.
    let mut map = reopen::<i64, i64>(&path);
    map.add(2, 2).unwrap();
    assert_eq!(map.get(&2).unwrap(), Some(2));
}
