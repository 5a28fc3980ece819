//! The 256-byte header prefix shared by both backing files.
//!
//! Both the buckets file and the entries file carry the same fixed-size
//! prefix; the slots are simply interpreted differently per file. Access is
//! always through the atomic accessors below -- nothing in this crate ever
//! reads or writes a header slot through a plain pointer dereference, since
//! the slots are shared across processes and, within a process, across
//! writer and readers.
//!
//! Layout:
//!
//! Buckets file: `lock_pid@0:i32, version@8:i64, nextVersion@16:i64,
//! count@24:i32, freeList@32:u32 (+1 biased), freeCount@40:i32,
//! generation@48:i32`.
//!
//! Entries file: `recoveryFlags@0:i32, countCopy@24:i32, freeListCopy@32:i32,
//! freeCountCopy@40:i32, indexCopy@48:i32, bucketOrLastNextCopy@56:i32`, and
//! a scratch slot at `HEADER_LEN - 8` holding the pre-image `(hashCode,
//! next)` of an entry being removed.

/// Size, in bytes, of the fixed header prefix of each backing file.
pub const HEADER_LEN: usize = 256;

// -- buckets-file slots ------------------------------------------------

pub const OFF_LOCK_PID: usize = 0;
pub const OFF_VERSION: usize = 8;
pub const OFF_NEXT_VERSION: usize = 16;
pub const OFF_COUNT: usize = 24;
pub const OFF_FREE_LIST: usize = 32;
pub const OFF_FREE_COUNT: usize = 40;
pub const OFF_GENERATION: usize = 48;

// -- entries-file slots --------------------------------------------------

pub const OFF_RECOVERY_FLAGS: usize = 0;
pub const OFF_COUNT_COPY: usize = 24;
pub const OFF_FREE_LIST_COPY: usize = 32;
pub const OFF_FREE_COUNT_COPY: usize = 40;
pub const OFF_INDEX_COPY: usize = 48;
pub const OFF_BUCKET_OR_LAST_NEXT_COPY: usize = 56;

/// The 8-byte scratch slot used by `remove`'s free-list phase to stash the
/// `(hashCode, next)` pre-image of the entry being unlinked.
pub const OFF_SCRATCH: usize = HEADER_LEN - 8;

/// Recovery-flag bits, in the descending order `recover` processes them.
///
/// These numbers are part of the on-disk crash-recovery contract and must
/// never be renumbered.
pub mod recovery_bit {
    pub const CLEAR: i32 = 1 << 7; // bit 8
    pub const REMOVE_FREE_LIST: i32 = 1 << 6; // bit 7
    pub const REMOVE_PREDECESSOR_LINK: i32 = 1 << 5; // bit 6
    pub const REMOVE_BUCKET_HEAD: i32 = 1 << 4; // bit 5
    pub const INSERT_BUCKET_HEAD: i32 = 1 << 3; // bit 4
    pub const INSERT_NEW_COUNT: i32 = 1 << 2; // bit 3
    pub const INSERT_NEW_FREE_LIST: i32 = 1 << 1; // bit 2
    pub const UPDATE_VALUE: i32 = 1 << 0; // bit 1

    /// All bits this implementation knows how to replay. Any other bit set
    /// in `recoveryFlags` is a `Corrupt` state.
    pub const KNOWN_MASK: i32 = CLEAR
        | REMOVE_FREE_LIST
        | REMOVE_PREDECESSOR_LINK
        | REMOVE_BUCKET_HEAD
        | INSERT_BUCKET_HEAD
        | INSERT_NEW_COUNT
        | INSERT_NEW_FREE_LIST
        | UPDATE_VALUE;
}

/// Apply the `+1` bias used for `freeList` and bucket-head values.
///
/// A freshly-zeroed page therefore reads back as "empty"/"end of list"
/// without requiring an initialization pass over the mapped bytes.
#[inline]
pub fn bias(logical: i64) -> u32 {
    (logical + 1) as u32
}

/// Undo the `+1` bias, yielding the logical value (`-1` for "none").
#[inline]
pub fn unbias(stored: u32) -> i64 {
    stored as i64 - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bias_round_trips() {
        assert_eq!(unbias(bias(-1)), -1);
        assert_eq!(unbias(bias(0)), 0);
        assert_eq!(unbias(bias(41)), 41);
    }

    #[test]
    fn zeroed_page_reads_as_empty() {
        // A freshly-mapped all-zero page has a raw `freeList`/bucket value
        // of 0, which must unbias to -1 ("empty"/"end of chain").
        assert_eq!(unbias(0), -1);
    }
}
