//! Hash-table primitives and the recovery engine.
//!
//! Everything in `region`, `header`, and `lock` is generic infrastructure;
//! this module is where the map's actual semantics live: chasing chains
//! across generations, journaling each mutating step into the header's
//! shadow slots, and replaying the fixed recovery decision tree when a
//! write lock is stolen from a dead process.
//!
//! Entries are fixed-width `#[repr(C)]` records, accessed through explicit
//! offset arithmetic rather than a serialization layer: `K` and `V` must
//! be `Copy` so that an `Entry<K, V>` can be read and written as plain
//! bytes through the mapped region.

use std::hash::Hash;
use std::marker::PhantomData;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use slog::{debug, o, warn, Logger};

use crate::crash::{CrashPoint, NoCrash};
use crate::error::{Error, Result};
use crate::header::{recovery_bit, *};
use crate::lock;
use crate::primes;
use crate::region::MappedRegion;

/// The capacity `PersistentMap::new` assumes when the caller doesn't give
/// one explicitly.
pub const DEFAULT_CAPACITY: u32 = 5;

/// Pluggable key hashing and equality.
///
/// `hash` must mask its result to 31 bits: the on-disk `hashCode` field
/// reserves its sign bit for the `-1` "free slot" sentinel.
pub trait KeyHasher<K> {
    fn hash(&self, key: &K) -> u32;
    fn equals(&self, a: &K, b: &K) -> bool;
}

/// A `KeyHasher` built from `std::hash::Hash`/`Eq`, for callers who don't
/// need a custom hash function.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHasher;

/// Marks key types that have a distinguished "missing" value, so it can be
/// rejected as `Error::NullKey` before hashing instead of being silently
/// stored.
///
/// Most key types (integers, `char`, `bool`) have no such value and are
/// never null. `Option<T>` is the one built-in exception -- a `None` key is
/// the idiomatic stand-in for "caller passed a missing key" -- and gets its
/// own impl below. Implement this for any other optional-style key type
/// that should get the same rejection.
pub trait NullableKey {
    fn is_null_key(&self) -> bool;
}

macro_rules! never_null_key {
    ($($t:ty),* $(,)?) => {
        $(impl NullableKey for $t {
            fn is_null_key(&self) -> bool {
                false
            }
        })*
    };
}

never_null_key!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, bool, char);

impl<T> NullableKey for Option<T> {
    fn is_null_key(&self) -> bool {
        self.is_none()
    }
}

impl<K: Hash + Eq> KeyHasher<K> for DefaultHasher {
    fn hash(&self, key: &K) -> u32 {
        use std::hash::Hasher as _;
        let mut h = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut h);
        (h.finish() as u32) & 0x7FFF_FFFF
    }

    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// Construction options, bundling everything a constructor needs instead
/// of a long argument list.
pub struct Options<H = DefaultHasher, C = NoCrash> {
    /// Initial capacity; the opened generation is the smallest one whose
    /// bucket array can hold at least this many entries.
    pub capacity: u32,
    pub hasher: H,
    pub logger: Logger,
    pub crash: C,
}

impl Default for Options<DefaultHasher, NoCrash> {
    fn default() -> Self {
        Options {
            capacity: DEFAULT_CAPACITY,
            hasher: DefaultHasher,
            logger: Logger::root(slog::Discard, o!()),
            crash: NoCrash,
        }
    }
}

/// A fixed-width entry record: `{ hashCode, next, key, value }`.
///
/// `hash_code == -1` marks a free slot; `next` is the next entry in this
/// bucket's chain (or the free list, when the slot is free), or `-1` for
/// end-of-chain. Never constructed directly -- entries live in the mapped
/// region and are read/written field-by-field through the offset helpers
/// below, since the header fields (`hash_code`, `next`) must go through
/// atomics while the payload fields do not (see `region::MappedRegion`).
#[repr(C)]
#[derive(Clone, Copy)]
struct RawEntry<K, V> {
    hash_code: i32,
    next: i32,
    key: K,
    value: V,
}

/// Byte offset of the `key` field within a `RawEntry<K, V>`.
///
/// Computed from the actual struct layout rather than hardcoding `8`,
/// since `repr(C)` may insert padding before `key` if `align_of::<K>() >
/// 8`. For any `K` with alignment `<= 8` (true of every type this crate is
/// meant for -- integers, small `Copy` structs, fixed arrays) this
/// evaluates to exactly `8`.
fn key_offset<K, V>() -> usize {
    let base = std::ptr::NonNull::<RawEntry<K, V>>::dangling().as_ptr();
    unsafe { (std::ptr::addr_of!((*base).key) as usize) - (base as usize) }
}

/// Byte offset of the `value` field within a `RawEntry<K, V>`.
fn value_offset<K, V>() -> usize {
    let base = std::ptr::NonNull::<RawEntry<K, V>>::dangling().as_ptr();
    unsafe { (std::ptr::addr_of!((*base).value) as usize) - (base as usize) }
}

/// Total size in bytes of one entry slot.
fn entry_size<K, V>() -> usize {
    mem::size_of::<RawEntry<K, V>>()
}

/// Byte offset of entry `index` within the entries file.
fn entry_offset<K, V>(index: i64) -> usize {
    HEADER_LEN + index as usize * entry_size::<K, V>()
}

/// Byte offset of bucket `bucket` within the buckets file.
fn bucket_offset(bucket: u32) -> usize {
    HEADER_LEN + bucket as usize * 4
}

fn buckets_file_len(generation: u32) -> u64 {
    (HEADER_LEN + primes::capacity_of(generation) as usize * 4) as u64
}

fn entries_file_len<K, V>(generation: u32) -> u64 {
    (HEADER_LEN + primes::capacity_of(generation) as usize * entry_size::<K, V>()) as u64
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// A persistent, crash-consistent, single-writer/multi-reader hash map.
///
/// Backed by two memory-mapped files, `<path>-buckets` and `<path>-entries`.
/// Mutating operations (`set`, `add`, `remove`, `clear`) take `&mut self`:
/// within a single process, the map is meant to be driven synchronously
/// from one thread at a time (the caller adds its own synchronization if
/// it wants otherwise). Read operations (`get`,
/// `contains_key`, `count`, `iter`) take `&self` and use the seqlock
/// protocol of `lock::read_lock_if`, so that other *processes* attached to
/// the same files can read without ever blocking on this process's lock.
pub struct PersistentMap<K, V, H = DefaultHasher, C = NoCrash>
where
    K: Copy + NullableKey + 'static,
    V: Copy + 'static,
{
    buckets: MappedRegion,
    entries: MappedRegion,
    hasher: H,
    crash: C,
    logger: Logger,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> PersistentMap<K, V, DefaultHasher, NoCrash>
where
    K: Copy + NullableKey + Hash + Eq + 'static,
    V: Copy + 'static,
{
    /// Open or create the map at `path`, using the default capacity,
    /// hasher, and (no-op) crash point.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, Options::default())
    }

    /// Open or create the map at `path` with a given initial capacity.
    pub fn with_capacity(path: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        Self::with_options(
            path,
            Options {
                capacity,
                ..Options::default()
            },
        )
    }
}

impl<K, V, H, C> PersistentMap<K, V, H, C>
where
    K: Copy + NullableKey + 'static,
    V: Copy + 'static,
    H: KeyHasher<K>,
    C: CrashPoint,
{
    /// Open or create the map at `path` with explicit options.
    ///
    /// Both backing files are grown (never shrunk) to fit the requested
    /// capacity's generation; if a pre-existing file already recorded a
    /// larger generation, that one wins.
    pub fn with_options(path: impl AsRef<Path>, options: Options<H, C>) -> Result<Self> {
        let path = path.as_ref();
        let buckets_path = suffixed(path, "-buckets");
        let entries_path = suffixed(path, "-entries");

        let buckets = MappedRegion::open_or_create(&buckets_path, HEADER_LEN as u64)?;
        let mut entries = MappedRegion::open_or_create(&entries_path, HEADER_LEN as u64)?;

        let stored_generation = buckets.atomic_i32(OFF_GENERATION).load(Ordering::Acquire) as u32;
        let wanted_generation = primes::generation_for(options.capacity.max(1));
        let generation = stored_generation.max(wanted_generation);

        let mut buckets = buckets;
        buckets.resize_to(buckets_file_len(generation))?;
        entries.resize_to(entries_file_len::<K, V>(generation))?;
        if generation != stored_generation {
            buckets
                .atomic_i32(OFF_GENERATION)
                .store(generation as i32, Ordering::Release);
            debug!(options.logger, "advanced generation on open";
                "from" => stored_generation, "to" => generation);
        }

        Ok(PersistentMap {
            buckets,
            entries,
            hasher: options.hasher,
            crash: options.crash,
            logger: options.logger,
            _marker: PhantomData,
        })
    }

    // -- header accessors -------------------------------------------------

    pub(crate) fn generation(&self) -> u32 {
        self.buckets.atomic_i32(OFF_GENERATION).load(Ordering::Acquire) as u32
    }

    /// The seqlock `version` counter, for `iter()`'s drift check.
    pub(crate) fn version(&self) -> i64 {
        self.buckets.atomic_i64(OFF_VERSION).load(Ordering::Acquire)
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }

    /// The number of live entries: `count - freeCount`.
    pub fn count(&self) -> Result<i32> {
        lock::read_lock_if(
            &self.buckets,
            &self.logger,
            || self.recover(),
            || {
                let count = self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire);
                let free_count = self.buckets.atomic_i32(OFF_FREE_COUNT).load(Ordering::Acquire);
                count - free_count
            },
        )
    }

    // -- chain walking ------------------------------------------------------

    fn bucket_head(&self, generation: u32, hash: u32) -> i64 {
        let modulus = primes::capacity_of(generation);
        let idx = hash % modulus;
        let raw = self.buckets.atomic_u32(bucket_offset(idx)).load(Ordering::Acquire);
        unbias(raw)
    }

    fn entry_hash_code(&self, index: i64) -> i32 {
        self.entries
            .atomic_i32(entry_offset::<K, V>(index))
            .load(Ordering::Acquire)
    }

    fn entry_next(&self, index: i64) -> i64 {
        self.entries
            .atomic_i32(entry_offset::<K, V>(index) + 4)
            .load(Ordering::Acquire) as i64
    }

    fn entry_key(&self, index: i64) -> K {
        self.entries
            .read_pod::<K>(entry_offset::<K, V>(index) + key_offset::<K, V>())
    }

    fn entry_value(&self, index: i64) -> V {
        self.entries
            .read_pod::<V>(entry_offset::<K, V>(index) + value_offset::<K, V>())
    }

    /// The raw slot count (`count` header field, including free slots), for
    /// `Iter`'s linear scan over the entry array. Not itself seqlock
    /// protected -- `Iter` treats a drift between this and the snapshotted
    /// `version` as `ConcurrentlyModified`.
    pub(crate) fn raw_count(&self) -> i32 {
        self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire)
    }

    /// Whether slot `index` is live (`hash_code >= 0`), for `Iter`.
    pub(crate) fn slot_is_live(&self, index: i64) -> bool {
        self.entry_hash_code(index) >= 0
    }

    /// The `(key, value)` pair stored at slot `index`, for `Iter`. Only
    /// meaningful when `slot_is_live(index)`.
    pub(crate) fn slot_pair(&self, index: i64) -> (K, V) {
        (self.entry_key(index), self.entry_value(index))
    }

    /// Walk the chain for `hash` across every generation from the current
    /// one down to `0`.
    fn probe(&self, hash: u32, key: &K) -> Option<i64> {
        let generation = self.generation();
        for g in (0..=generation).rev() {
            let mut idx = self.bucket_head(g, hash);
            while idx != -1 {
                if self.entry_hash_code(idx) == hash as i32
                    && self.hasher.equals(&self.entry_key(idx), key)
                {
                    return Some(idx);
                }
                idx = self.entry_next(idx);
            }
        }
        None
    }

    /// Look up `key`, as a lock-free read. Returns `None` on a miss.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        if key.is_null_key() {
            return Err(Error::NullKey);
        }
        let hash = self.hasher.hash(key);
        lock::read_lock_if(
            &self.buckets,
            &self.logger,
            || self.recover(),
            || self.probe(hash, key).map(|idx| self.entry_value(idx)),
        )
    }

    /// `index(key)`: like `get`, but a miss is an error.
    pub fn index(&self, key: &K) -> Result<V> {
        self.get(key)?.ok_or(Error::NotFound)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    // -- recovery-bit bookkeeping --------------------------------------

    fn set_recovery_bit(&self, bit: i32) {
        self.entries
            .atomic_i32(OFF_RECOVERY_FLAGS)
            .fetch_or(bit, Ordering::AcqRel);
    }

    fn clear_recovery_flags(&self) {
        self.entries
            .atomic_i32(OFF_RECOVERY_FLAGS)
            .store(0, Ordering::Release);
    }

    // -- mutating operations, all taken under the write lock ------------

    /// `set(key, value)`: insert or update.
    pub fn set(&mut self, key: K, value: V) -> Result<Option<V>> {
        self.insert(key, value, false)
    }

    /// `add(key, value)`: insert, failing with `DuplicateKey` if present.
    pub fn add(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value, true)?;
        Ok(())
    }

    /// Run `op` under the cross-process write lock, using the explicit
    /// (non-RAII) acquire/release pair rather than `lock::write_lock`.
    ///
    /// This matters for fault injection: `op`'s `CrashPoint::hit` calls may
    /// panic partway through, and that panic must leave `lock_pid` set to
    /// this process (simulating a kill) instead of releasing cleanly on
    /// unwind. An RAII guard would run its `Drop` impl during that unwind
    /// and release anyway; `acquire_write_lock`/`release_write_lock` have
    /// no such guard, so a panic here simply never reaches the release
    /// call. See `lock::acquire_write_lock`.
    fn with_write_lock<T>(
        &mut self,
        op: impl FnOnce(&mut Self, bool) -> Result<T>,
    ) -> Result<T> {
        let recover = lock::acquire_write_lock(&self.buckets, &self.logger, false)?;
        let result = op(self, recover);
        lock::release_write_lock(&self.buckets, false)?;
        result
    }

    fn insert(&mut self, key: K, value: V, add_only: bool) -> Result<Option<V>> {
        if key.is_null_key() {
            return Err(Error::NullKey);
        }
        let hash = self.hasher.hash(&key);
        self.with_write_lock(|this, recover| {
            if recover {
                this.recover()?;
            }
            this.insert_locked(hash, key, value, add_only)
        })
    }

    /// `remove(key) -> bool`.
    pub fn remove(&mut self, key: &K) -> Result<bool> {
        if key.is_null_key() {
            return Err(Error::NullKey);
        }
        let hash = self.hasher.hash(key);
        self.with_write_lock(|this, recover| {
            if recover {
                this.recover()?;
            }
            this.remove_locked(hash, key)
        })
    }

    /// `clear()`.
    pub fn clear(&mut self) -> Result<()> {
        self.with_write_lock(|this, recover| {
            if recover {
                this.recover()?;
            }
            this.clear_locked()
        })
    }

    /// A lazy, fail-fast iterator over `(key, value)` pairs.
    ///
    /// Snapshots `version` once at creation (see `DESIGN.md` for why this
    /// crate does not attempt full per-element seqlock rechecking) and
    /// fails the first `next()` call observed after the version has
    /// drifted.
    pub fn iter(&self) -> crate::iter::Iter<'_, K, V, H, C> {
        crate::iter::Iter::new(self)
    }

    // -- Phase A / B of Insert --------------------------------------------

    fn insert_locked(&mut self, hash: u32, key: K, value: V, add_only: bool) -> Result<Option<V>> {
        if let Some(i) = self.probe(hash, &key) {
            if add_only {
                return Err(Error::DuplicateKey);
            }
            self.crash.hit(11);
            let old = self.entry_value(i);
            self.update_value_journaled(i, value)?;
            debug!(self.logger(), "updated entry"; "index" => i);
            return Ok(Some(old));
        }

        // Reachable by every insert of a not-yet-present key, including the
        // very first insert into a freshly created (empty) map.
        self.crash.hit(21);
        let free_count = self.buckets.atomic_i32(OFF_FREE_COUNT).load(Ordering::Acquire);
        let index = if free_count > 0 {
            self.allocate_from_free_list(free_count)
        } else {
            self.allocate_fresh_slot()?
        };

        // New entries always hash against the *current* generation's
        // modulus -- recomputed here rather than before the (possible)
        // resize above, since growth changes where new entries land.
        let generation = self.generation();
        let target_bucket = hash % primes::capacity_of(generation);

        self.crash.hit(41);
        let old_head = self
            .buckets
            .atomic_u32(bucket_offset(target_bucket))
            .load(Ordering::Acquire);
        self.entries
            .atomic_i32(OFF_BUCKET_OR_LAST_NEXT_COPY)
            .store(target_bucket as i32, Ordering::Release);
        self.entries
            .atomic_i32(OFF_INDEX_COPY)
            .store(old_head as i32, Ordering::Release);
        self.set_recovery_bit(recovery_bit::INSERT_BUCKET_HEAD);

        self.crash.hit(42);
        self.write_entry(index, hash as i32, unbias(old_head), key, value);

        self.crash.hit(43);
        self.buckets
            .atomic_u32(bucket_offset(target_bucket))
            .store(bias(index), Ordering::Release);

        self.crash.hit(44);
        self.clear_recovery_flags();
        debug!(self.logger(), "inserted entry"; "index" => index, "bucket" => target_bucket);
        Ok(None)
    }

    fn allocate_from_free_list(&mut self, free_count: i32) -> i64 {
        self.crash.hit(22);
        let free_list = self.buckets.atomic_u32(OFF_FREE_LIST).load(Ordering::Acquire);
        self.entries
            .atomic_i32(OFF_FREE_LIST_COPY)
            .store(free_list as i32, Ordering::Release);
        self.entries
            .atomic_i32(OFF_FREE_COUNT_COPY)
            .store(free_count, Ordering::Release);
        self.set_recovery_bit(recovery_bit::INSERT_NEW_FREE_LIST);

        self.crash.hit(23);
        let index = unbias(free_list);
        let next = self.entry_next(index);
        self.buckets
            .atomic_u32(OFF_FREE_LIST)
            .store(bias(next), Ordering::Release);
        self.buckets
            .atomic_i32(OFF_FREE_COUNT)
            .store(free_count - 1, Ordering::Release);
        self.crash.hit(24);
        index
    }

    fn allocate_fresh_slot(&mut self) -> Result<i64> {
        let generation = self.generation();
        let count = self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire);
        self.crash.hit(25);
        if count as u32 == primes::capacity_of(generation) {
            self.resize()?;
        }

        self.crash.hit(26);
        let count = self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire);
        self.entries
            .atomic_i32(OFF_COUNT_COPY)
            .store(count, Ordering::Release);
        self.set_recovery_bit(recovery_bit::INSERT_NEW_COUNT);

        self.crash.hit(31);
        self.buckets
            .atomic_i32(OFF_COUNT)
            .store(count + 1, Ordering::Release);
        self.crash.hit(32);
        Ok(count as i64)
    }

    fn write_entry(&self, index: i64, hash_code: i32, next: i64, key: K, value: V) {
        let off = entry_offset::<K, V>(index);
        self.entries
            .atomic_i32(off + 4)
            .store(next as i32, Ordering::Release);
        self.entries.write_pod(off + key_offset::<K, V>(), key);
        self.entries.write_pod(off + value_offset::<K, V>(), value);
        // `hash_code` last: until this store, the slot reads as free
        // (`-1`) to anyone who happens to stumble on it, which can only
        // happen through the free list (not the case here, this is a
        // fresh or never-before-used slot).
        self.entries
            .atomic_i32(off)
            .store(hash_code, Ordering::Release);
    }

    fn update_value_journaled(&mut self, i: i64, value: V) -> Result<()> {
        let free_count = self.buckets.atomic_i32(OFF_FREE_COUNT).load(Ordering::Acquire);
        let s = if free_count > 0 {
            unbias(self.buckets.atomic_u32(OFF_FREE_LIST).load(Ordering::Acquire))
        } else {
            let generation = self.generation();
            let count = self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire);
            if count as u32 == primes::capacity_of(generation) {
                self.resize()?;
            }
            self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire) as i64
        };

        let key_off = key_offset::<K, V>();
        let len = entry_size::<K, V>() - key_off;
        self.entries.copy_within(
            entry_offset::<K, V>(s) + key_off,
            entry_offset::<K, V>(i) + key_off,
            len,
        );
        self.entries
            .atomic_i32(OFF_INDEX_COPY)
            .store(i as i32, Ordering::Release);
        self.set_recovery_bit(recovery_bit::UPDATE_VALUE);

        self.crash.hit(12);
        self.entries
            .write_pod(entry_offset::<K, V>(i) + value_offset::<K, V>(), value);
        self.crash.hit(13);
        self.clear_recovery_flags();
        Ok(())
    }

    /// Advance the generation by one and grow both mapped regions to
    /// match. Existing entries are never rehashed -- they stay reachable
    /// through `probe`'s per-generation walk.
    fn resize(&mut self) -> Result<()> {
        let generation = self.generation();
        let new_generation = generation + 1;
        if new_generation as usize >= primes::PRIMES.len() {
            return Err(Error::Corrupt("generation table exhausted".to_owned()));
        }
        self.buckets.resize_to(buckets_file_len(new_generation))?;
        self.crash.hit(33);
        self.entries.resize_to(entries_file_len::<K, V>(new_generation))?;
        self.crash.hit(34);
        self.buckets
            .atomic_i32(OFF_GENERATION)
            .store(new_generation as i32, Ordering::Release);
        self.crash.hit(35);
        warn!(self.logger, "resized table";
            "generation" => new_generation,
            "capacity" => primes::capacity_of(new_generation));
        Ok(())
    }

    // -- Remove -------------------------------------------------------------

    fn remove_locked(&mut self, hash: u32, key: &K) -> Result<bool> {
        let generation = self.generation();
        let mut found = None;
        'gens: for g in (0..=generation).rev() {
            let bucket_idx = hash % primes::capacity_of(g);
            let mut last = -1i64;
            let mut idx = self.bucket_head(g, hash);
            while idx != -1 {
                if self.entry_hash_code(idx) == hash as i32
                    && self.hasher.equals(&self.entry_key(idx), key)
                {
                    found = Some((bucket_idx, last, idx));
                    break 'gens;
                }
                last = idx;
                idx = self.entry_next(idx);
            }
        }

        let (bucket_idx, last, i) = match found {
            Some(v) => v,
            None => return Ok(false),
        };

        self.crash.hit(51);
        if last == -1 {
            self.crash.hit(71);
            let old_head = self
                .buckets
                .atomic_u32(bucket_offset(bucket_idx))
                .load(Ordering::Acquire);
            self.entries
                .atomic_i32(OFF_BUCKET_OR_LAST_NEXT_COPY)
                .store(bucket_idx as i32, Ordering::Release);
            self.entries
                .atomic_i32(OFF_INDEX_COPY)
                .store(old_head as i32, Ordering::Release);
            self.set_recovery_bit(recovery_bit::REMOVE_BUCKET_HEAD);

            self.crash.hit(72);
            let next = self.entry_next(i);
            self.buckets
                .atomic_u32(bucket_offset(bucket_idx))
                .store(bias(next), Ordering::Release);
        } else {
            self.crash.hit(73);
            let old_next = self.entry_next(last);
            self.entries
                .atomic_i32(OFF_INDEX_COPY)
                .store(last as i32, Ordering::Release);
            self.entries
                .atomic_i32(OFF_BUCKET_OR_LAST_NEXT_COPY)
                .store(old_next as i32, Ordering::Release);
            self.set_recovery_bit(recovery_bit::REMOVE_PREDECESSOR_LINK);

            self.crash.hit(74);
            let next = self.entry_next(i);
            self.entries
                .atomic_i32(entry_offset::<K, V>(last) + 4)
                .store(next as i32, Ordering::Release);
        }

        self.crash.hit(75);
        let free_list = self.buckets.atomic_u32(OFF_FREE_LIST).load(Ordering::Acquire);
        let free_count = self.buckets.atomic_i32(OFF_FREE_COUNT).load(Ordering::Acquire);
        self.entries
            .atomic_i32(OFF_COUNT_COPY)
            .store(i as i32, Ordering::Release);
        self.entries
            .atomic_i32(OFF_FREE_LIST_COPY)
            .store(free_list as i32, Ordering::Release);
        self.entries
            .atomic_i32(OFF_FREE_COUNT_COPY)
            .store(free_count, Ordering::Release);
        let mut scratch = [0u8; 8];
        self.entries.read_bytes(entry_offset::<K, V>(i), &mut scratch);
        self.entries.write_bytes(OFF_SCRATCH, &scratch);
        self.set_recovery_bit(recovery_bit::REMOVE_FREE_LIST);

        self.crash.hit(52);
        // Keys/values inside the removed entry are deliberately left
        // alone: recovery from bit 7 needs them intact to reconstitute
        // the entry.
        self.entries
            .atomic_i32(entry_offset::<K, V>(i))
            .store(-1, Ordering::Release);
        self.entries
            .atomic_i32(entry_offset::<K, V>(i) + 4)
            .store(free_list as i32, Ordering::Release);
        self.buckets
            .atomic_u32(OFF_FREE_LIST)
            .store(bias(i), Ordering::Release);
        self.buckets
            .atomic_i32(OFF_FREE_COUNT)
            .store(free_count + 1, Ordering::Release);

        self.clear_recovery_flags();
        debug!(self.logger(), "removed entry"; "index" => i);
        Ok(true)
    }

    // -- Clear ----------------------------------------------------------

    fn clear_locked(&mut self) -> Result<()> {
        self.set_recovery_bit(recovery_bit::CLEAR);
        self.crash.hit(6);
        self.clear_inner();
        self.clear_recovery_flags();
        debug!(self.logger(), "cleared map");
        Ok(())
    }

    /// The actual zeroing work of `clear`, separated out so recovery's bit
    /// 8 ("re-run `clear`, idempotent") can call it directly.
    ///
    /// Bounding the bucket-zeroing loop to `[0, count)` (mirroring the
    /// entries-zeroing loop) would leave any bucket index `>= count`
    /// dangling -- bucket indices are `hash % primes[generation]`, nothing
    /// bounds them by `count`, so a stale head could reference a
    /// just-zeroed (and therefore bogus-looking-live, `hash_code == 0`)
    /// entry. This clears the *entire* current bucket array instead; see
    /// `DESIGN.md` for the reasoning.
    fn clear_inner(&self) {
        let generation = self.generation();
        let bucket_count = primes::capacity_of(generation);
        for b in 0..bucket_count {
            self.buckets.atomic_u32(bucket_offset(b)).store(0, Ordering::Release);
        }

        let count = self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire).max(0) as u32;
        let zero = vec![0u8; entry_size::<K, V>()];
        for i in 0..count {
            self.entries.write_bytes(entry_offset::<K, V>(i as i64), &zero);
        }

        self.buckets.atomic_u32(OFF_FREE_LIST).store(0, Ordering::Release);
        self.buckets.atomic_i32(OFF_COUNT).store(0, Ordering::Release);
        self.buckets.atomic_i32(OFF_FREE_COUNT).store(0, Ordering::Release);
    }

    // -- recovery ---------------------------------------------------------

    /// Replay whichever step was in flight when `recoveryFlags` was last
    /// left non-zero, highest bit first, until the flags settle at zero.
    ///
    /// Pure `&self`: every action below is either a header-slot store or a
    /// write into entry/bucket bytes that are unreachable from any chain
    /// until the corresponding forward-path step publishes them, so no
    /// exclusive Rust borrow is required (the write lock, already held by
    /// the caller, is what actually serializes this against other
    /// writers).
    pub(crate) fn recover(&self) -> Result<()> {
        loop {
            let flags = self.entries.atomic_i32(OFF_RECOVERY_FLAGS).load(Ordering::Acquire);
            if flags == 0 {
                return Ok(());
            }
            if flags & !recovery_bit::KNOWN_MASK != 0 {
                return Err(Error::Corrupt(format!(
                    "unknown recovery flag bits: {:#x}",
                    flags & !recovery_bit::KNOWN_MASK
                )));
            }
            warn!(self.logger, "replaying recovery journal"; "flags" => flags);

            if flags & recovery_bit::CLEAR != 0 {
                self.clear_inner();
                self.clear_one_bit(recovery_bit::CLEAR);
            } else if flags & recovery_bit::REMOVE_FREE_LIST != 0 {
                self.recover_remove_free_list();
                self.clear_one_bit(recovery_bit::REMOVE_FREE_LIST);
            } else if flags & recovery_bit::REMOVE_PREDECESSOR_LINK != 0 {
                self.recover_restore_predecessor_link();
                self.clear_one_bit(recovery_bit::REMOVE_PREDECESSOR_LINK);
            } else if flags & recovery_bit::REMOVE_BUCKET_HEAD != 0 {
                self.recover_restore_bucket_head();
                self.clear_one_bit(recovery_bit::REMOVE_BUCKET_HEAD);
            } else if flags & recovery_bit::INSERT_BUCKET_HEAD != 0 {
                self.recover_restore_bucket_head();
                self.clear_one_bit(recovery_bit::INSERT_BUCKET_HEAD);
            } else if flags & recovery_bit::INSERT_NEW_COUNT != 0 {
                self.recover_restore_count();
                self.clear_one_bit(recovery_bit::INSERT_NEW_COUNT);
            } else if flags & recovery_bit::INSERT_NEW_FREE_LIST != 0 {
                self.recover_restore_free_list();
                self.clear_one_bit(recovery_bit::INSERT_NEW_FREE_LIST);
            } else if flags & recovery_bit::UPDATE_VALUE != 0 {
                self.recover_restore_value();
                self.clear_one_bit(recovery_bit::UPDATE_VALUE);
            } else {
                unreachable!("every bit in KNOWN_MASK is handled above");
            }
        }
    }

    fn clear_one_bit(&self, bit: i32) {
        self.entries
            .atomic_i32(OFF_RECOVERY_FLAGS)
            .fetch_and(!bit, Ordering::AcqRel);
    }

    fn recover_remove_free_list(&self) {
        let free_list_copy = self.entries.atomic_i32(OFF_FREE_LIST_COPY).load(Ordering::Acquire);
        let free_count_copy = self.entries.atomic_i32(OFF_FREE_COUNT_COPY).load(Ordering::Acquire);
        let removed_index = self.entries.atomic_i32(OFF_COUNT_COPY).load(Ordering::Acquire);
        self.buckets
            .atomic_u32(OFF_FREE_LIST)
            .store(free_list_copy as u32, Ordering::Release);
        self.buckets
            .atomic_i32(OFF_FREE_COUNT)
            .store(free_count_copy, Ordering::Release);

        let mut scratch = [0u8; 8];
        self.entries.read_bytes(OFF_SCRATCH, &mut scratch);
        self.entries
            .write_bytes(entry_offset::<K, V>(removed_index as i64), &scratch);
    }

    fn recover_restore_predecessor_link(&self) {
        let index_copy = self.entries.atomic_i32(OFF_INDEX_COPY).load(Ordering::Acquire);
        let old_next = self
            .entries
            .atomic_i32(OFF_BUCKET_OR_LAST_NEXT_COPY)
            .load(Ordering::Acquire);
        self.entries
            .atomic_i32(entry_offset::<K, V>(index_copy as i64) + 4)
            .store(old_next, Ordering::Release);
    }

    /// Shared by bits 4 and 5: both restore the same shadow slots into the
    /// same place.
    fn recover_restore_bucket_head(&self) {
        let bucket_idx = self
            .entries
            .atomic_i32(OFF_BUCKET_OR_LAST_NEXT_COPY)
            .load(Ordering::Acquire) as u32;
        let old_head = self.entries.atomic_i32(OFF_INDEX_COPY).load(Ordering::Acquire) as u32;
        self.buckets
            .atomic_u32(bucket_offset(bucket_idx))
            .store(old_head, Ordering::Release);
    }

    fn recover_restore_count(&self) {
        let count_copy = self.entries.atomic_i32(OFF_COUNT_COPY).load(Ordering::Acquire);
        self.buckets.atomic_i32(OFF_COUNT).store(count_copy, Ordering::Release);
    }

    fn recover_restore_free_list(&self) {
        let free_list_copy = self.entries.atomic_i32(OFF_FREE_LIST_COPY).load(Ordering::Acquire);
        let free_count_copy = self.entries.atomic_i32(OFF_FREE_COUNT_COPY).load(Ordering::Acquire);
        self.buckets
            .atomic_u32(OFF_FREE_LIST)
            .store(free_list_copy as u32, Ordering::Release);
        self.buckets
            .atomic_i32(OFF_FREE_COUNT)
            .store(free_count_copy, Ordering::Release);
    }

    /// Recovery for bit 1: the snapshot slot is recomputed identically to
    /// the forward path (`freeList` if `freeCount > 0`, else `count`),
    /// evaluated at recovery time. Nothing else touches
    /// `freeCount`/`count` between the snapshot write and the crash
    /// window this bit covers, so the value recomputed here is the same
    /// one the forward path chose. See `DESIGN.md`.
    fn recover_restore_value(&self) {
        let index_copy = self.entries.atomic_i32(OFF_INDEX_COPY).load(Ordering::Acquire) as i64;
        let free_count = self.buckets.atomic_i32(OFF_FREE_COUNT).load(Ordering::Acquire);
        let s = if free_count > 0 {
            unbias(self.buckets.atomic_u32(OFF_FREE_LIST).load(Ordering::Acquire))
        } else {
            self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire) as i64
        };

        let key_off = key_offset::<K, V>();
        let len = entry_size::<K, V>() - key_off;
        self.entries.copy_within(
            entry_offset::<K, V>(index_copy) + key_off,
            entry_offset::<K, V>(s) + key_off,
            len,
        );
    }
}

impl<K, V, H, C> std::fmt::Debug for PersistentMap<K, V, H, C>
where
    K: Copy + NullableKey + 'static,
    V: Copy + 'static,
{
    /// Prints the header slots only -- never touches key/value bytes, so
    /// this is safe to call from the crash-equivalence tests regardless of
    /// what `K`/`V` happen to be.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMap")
            .field("lock_pid", &self.buckets.atomic_i32(OFF_LOCK_PID).load(Ordering::Acquire))
            .field("version", &self.buckets.atomic_i64(OFF_VERSION).load(Ordering::Acquire))
            .field(
                "next_version",
                &self.buckets.atomic_i64(OFF_NEXT_VERSION).load(Ordering::Acquire),
            )
            .field("count", &self.buckets.atomic_i32(OFF_COUNT).load(Ordering::Acquire))
            .field(
                "free_count",
                &self.buckets.atomic_i32(OFF_FREE_COUNT).load(Ordering::Acquire),
            )
            .field("generation", &self.generation())
            .field(
                "recovery_flags",
                &self.entries.atomic_i32(OFF_RECOVERY_FLAGS).load(Ordering::Acquire),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_offsets_start_after_header_fields() {
        // The `entrySize - 8` arithmetic used when journaling entry
        // updates assumes the payload starts immediately after the two
        // i32 header fields.
        assert_eq!(key_offset::<i64, i64>(), 8);
        assert_eq!(value_offset::<i64, i64>(), 16);
        assert_eq!(entry_size::<i64, i64>(), 24);
    }

    #[test]
    fn bucket_and_entry_offsets_are_header_relative() {
        assert_eq!(bucket_offset(0), HEADER_LEN);
        assert_eq!(bucket_offset(1), HEADER_LEN + 4);
        assert_eq!(entry_offset::<i64, i64>(0), HEADER_LEN);
        assert_eq!(entry_offset::<i64, i64>(1), HEADER_LEN + 24);
    }
}
