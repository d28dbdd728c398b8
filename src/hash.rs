//! Fingerprint and bucket-hash providers.
//!
//! The filters never look at keys directly. They consume exactly two
//! functions: a fixed-length `fingerprint` of a key, which is what gets
//! stored, and a well-mixed `hash32` used on raw keys (primary bucket) and on
//! fingerprints (alternate bucket offset).

use xxhash_rust::xxh3::xxh3_128;
use xxhash_rust::xxh32::xxh32;

/// Length in bytes of a stored fingerprint.
pub const FINGERPRINT_LEN: usize = 16;

/// Fixed-length digest of a key. This is the stored identity; two keys with
/// the same fingerprint are indistinguishable to a filter.
pub type Fingerprint = [u8; FINGERPRINT_LEN];

/// Source of fingerprints and 32-bit bucket hashes.
///
/// Both functions must be deterministic. `fingerprint` should be effectively
/// collision-resistant at [`FINGERPRINT_LEN`] bytes; `hash32` should be well
/// mixed in its low bits since bucket indices are taken modulo the table size.
pub trait KeyHasher {
    /// Digest of `key`.
    fn fingerprint(&self, key: &[u8]) -> Fingerprint;

    /// 32-bit mixed hash of `bytes`.
    fn hash32(&self, bytes: &[u8]) -> u32;
}

/// Default provider backed by xxHash: XXH3-128 for fingerprints and XXH32
/// for bucket hashes.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHasher {
    seed: u32,
}

impl XxHasher {
    /// Provider whose `hash32` is seeded with `seed`. Fingerprints are
    /// unaffected by the seed.
    pub fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl KeyHasher for XxHasher {
    fn fingerprint(&self, key: &[u8]) -> Fingerprint {
        xxh3_128(key).to_le_bytes()
    }

    fn hash32(&self, bytes: &[u8]) -> u32 {
        xxh32(bytes, self.seed)
    }
}
