//! The fail-fast `(key, value)` iterator.
//!
//! A small struct holding a cursor into the backing entry array plus
//! enough state to detect that the store moved under it. Rather than
//! re-running the seqlock double-check on every single element (which
//! would force the whole traversal to restart on every mismatch and turn a
//! lazy iterator back into an eager one), this iterator snapshots
//! `version` once at construction and treats any drift observed on a later
//! `next()` call as `ConcurrentlyModified` (see `DESIGN.md`).

use crate::crash::CrashPoint;
use crate::error::{Error, Result};
use crate::table::{KeyHasher, NullableKey, PersistentMap};

/// A lazy, fail-fast iterator over the `(key, value)` pairs of a
/// [`PersistentMap`].
///
/// Yields `Result<(K, V), Error>`: once the map's `version` has advanced
/// since this iterator was created, the next pull returns
/// `Err(Error::ConcurrentlyModified)` and every subsequent pull does the
/// same (the iterator does not attempt to resynchronize).
pub struct Iter<'a, K, V, H, C>
where
    K: Copy + NullableKey + 'static,
    V: Copy + 'static,
{
    map: &'a PersistentMap<K, V, H, C>,
    snapshot_version: i64,
    next_index: i64,
    raw_count: i32,
    poisoned: bool,
}

impl<'a, K, V, H, C> Iter<'a, K, V, H, C>
where
    K: Copy + NullableKey + 'static,
    V: Copy + 'static,
    H: KeyHasher<K>,
    C: CrashPoint,
{
    pub(crate) fn new(map: &'a PersistentMap<K, V, H, C>) -> Self {
        Iter {
            map,
            snapshot_version: map.version(),
            next_index: 0,
            raw_count: map.raw_count(),
            poisoned: false,
        }
    }
}

impl<'a, K, V, H, C> Iterator for Iter<'a, K, V, H, C>
where
    K: Copy + NullableKey + 'static,
    V: Copy + 'static,
    H: KeyHasher<K>,
    C: CrashPoint,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned {
            return None;
        }

        loop {
            if self.next_index >= self.raw_count as i64 {
                return None;
            }
            let index = self.next_index;
            self.next_index += 1;

            if self.map.version() != self.snapshot_version {
                self.poisoned = true;
                return Some(Err(Error::ConcurrentlyModified));
            }

            if self.map.slot_is_live(index) {
                return Some(Ok(self.map.slot_pair(index)));
            }
            // Free slot: skip it and keep scanning, matching `FindEntry`'s
            // treatment of `hashCode == -1` as "not a live entry" rather
            // than ending the walk.
        }
    }
}
