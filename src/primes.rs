//! The generation-to-capacity prime table.
//!
//! `generation` is an index into this table; `primes[generation]` is both
//! the current bucket array length and the modulus used to place a hash
//! into a bucket. Growing the map advances the generation rather than
//! rehashing in place (see `table::resize`).

/// Monotonically increasing bucket-array sizes, one per generation.
///
/// The first few entries mirror the classic doubling-with-primes scheme:
/// small enough that a fresh map with the default capacity (5) doesn't
/// waste a full page, large enough that collisions stay rare as the table
/// grows by orders of magnitude.
pub const PRIMES: &[u32] = &[
    3, 7, 11, 17, 23, 29, 37, 47, 59, 71, 89, 107, 131, 163, 197, 239, 293,
    353, 431, 521, 631, 761, 919, 1_103, 1_327, 1_597, 1_931, 2_333, 2_801,
    3_371, 4_049, 4_861, 5_839, 7_013, 8_419, 10_103, 12_143, 14_591, 17_519,
    21_023, 25_229, 30_293, 36_353, 43_627, 52_361, 62_851, 75_431, 90_523,
    108_631, 130_363, 156_437, 187_751, 225_307, 270_371, 324_449, 389_357,
    467_237, 560_689, 672_827, 807_403, 968_897, 1_162_687, 1_395_263,
    1_674_319, 2_009_191, 2_411_033, 2_893_249, 3_471_899, 4_166_287,
    4_999_559, 5_999_471, 7_199_369,
];

/// The smallest generation `g` such that `PRIMES[g] >= capacity`.
///
/// Panics if `capacity` exceeds the largest table entry; in practice this
/// table tops out well past a billion entries.
pub fn generation_for(capacity: u32) -> u32 {
    PRIMES
        .iter()
        .position(|&p| p >= capacity)
        .expect("requested capacity exceeds the generation table") as u32
}

/// The bucket-array length (and hash modulus) of a given generation.
pub fn capacity_of(generation: u32) -> u32 {
    PRIMES[generation as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capacity_finds_smallest_sufficient_generation() {
        // smallest g with PRIMES[g] >= 5 is g == 1 (PRIMES[1] == 7). See DESIGN.md for why
        // this implementation follows the stated rule rather than the worked example's
        // number, which is inconsistent with the rule as given against this table.
        assert_eq!(generation_for(5), 1);
        assert_eq!(capacity_of(1), 7);
    }

    #[test]
    fn exact_match_does_not_overshoot() {
        assert_eq!(generation_for(7), 1);
        assert_eq!(capacity_of(1), 7);
    }

    #[test]
    fn table_is_strictly_increasing() {
        for w in PRIMES.windows(2) {
            assert!(w[0] < w[1]);
        }
    }
}
