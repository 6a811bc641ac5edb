//! Chunk fingerprinting using XXH64.
//!
//! Both peers must compute identical fingerprints for identical bytes, so
//! the algorithm and seed are fixed: XXH64 with seed 0. The digest is fast
//! and non-cryptographic; it is used for change detection only, never for
//! integrity.

use xxhash_rust::xxh64::xxh64;

/// Seed shared by both peers. Changing it is a wire-protocol break.
pub const FINGERPRINT_SEED: u64 = 0;

/// XXH64 of the empty input under [`FINGERPRINT_SEED`].
///
/// This is the canonical value an empty chunk hashes to; it also serves as
/// a reference point in tests.
pub const EMPTY_FINGERPRINT: u64 = 0xef46_db37_51d8_e999;

/// Compute the fingerprint of a chunk.
///
/// Callers hash exactly the bytes read from disk. A short final block is
/// hashed on its read-length prefix, never on a full block-sized buffer
/// with stale bytes past the read.
#[must_use]
pub fn chunk_fingerprint(data: &[u8]) -> u64 {
    xxh64(data, FINGERPRINT_SEED)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The digest is a pure function of the input bytes.
        #[test]
        fn deterministic(data in prop::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert_eq!(chunk_fingerprint(&data), chunk_fingerprint(&data));
        }

        /// Distinct inputs (almost) never collide at 64 bits.
        #[test]
        fn collision_resistant(
            a in prop::collection::vec(any::<u8>(), 1..256),
            b in prop::collection::vec(any::<u8>(), 1..256)
        ) {
            if a != b {
                prop_assert_ne!(chunk_fingerprint(&a), chunk_fingerprint(&b));
            }
        }

        /// Hashing a prefix is independent of whatever follows it.
        #[test]
        fn prefix_only(
            data in prop::collection::vec(any::<u8>(), 1..512),
            tail in prop::collection::vec(1u8..=255, 1..64)
        ) {
            let mut extended = data.clone();
            extended.extend_from_slice(&tail);
            prop_assert_eq!(
                chunk_fingerprint(&data),
                chunk_fingerprint(&extended[..data.len()])
            );
            prop_assert_ne!(chunk_fingerprint(&data), chunk_fingerprint(&extended));
        }
    }
}
