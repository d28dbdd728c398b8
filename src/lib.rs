// Concurrent Cuckoo Filter
// One cuckoo filter under three concurrency disciplines: a single global lock,
// striped per-bucket reader/writer locks, and a lock-free table driven by
// single-word compare-and-swap with hazard-pointer reclamation.

//! All three tiers share the same table geometry: `size()` buckets of
//! [`SLOTS_PER_BUCKET`] slots, each key living in one of two candidate buckets
//! derived from its hash and its fingerprint. They expose the same surface:
//!
//! ```
//! use concurrent_cuckoo_filter::{FineGrainedFilter, LockFreeFilter, SequentialFilter};
//!
//! let sequential = SequentialFilter::new(1024);
//! assert!(sequential.insert("cat"));
//! assert!(sequential.find("cat"));
//! assert!(sequential.remove("cat"));
//!
//! let striped = FineGrainedFilter::new(1024);
//! assert!(striped.insert("cat"));
//! assert!(striped.find("cat"));
//!
//! // The lock-free tier takes a caller-supplied thread id in [0, thread_count).
//! let lock_free = LockFreeFilter::new(1024, 4);
//! assert!(lock_free.insert("cat", 0));
//! assert!(lock_free.find("cat", 3));
//! assert!(lock_free.remove("cat", 1));
//! ```
//!
//! `insert` returning `false` means the table is saturated for that key, a
//! normal outcome. `remove` must only be called for keys that are present.

mod fine_grained;
mod hash;
mod hazard;
mod lock_free;
mod sequential;
mod table;
mod tagged;

pub use fine_grained::{FineGrainedFilter, FineGrainedFilterBuilder};
pub use hash::{FINGERPRINT_LEN, Fingerprint, KeyHasher, XxHasher};
pub use lock_free::{Location, LockFreeFilter, LockFreeFilterBuilder};
pub use sequential::{SequentialFilter, SequentialFilterBuilder};
pub use table::{LOCK_STRIPES, NUM_MAX_KICKS, SLOTS_PER_BUCKET};
pub use tagged::{MAX_COUNTER, TaggedPointer};

/// Error type for filter construction
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The requested capacity was zero
    #[error("capacity must be greater than zero")]
    ZeroCapacity,
    /// The lock-free filter was configured without any thread ids
    #[error("thread_count must be greater than zero")]
    ZeroThreadCount,
    /// Kick chains and relocation paths need at least one step
    #[error("max_kicks must be greater than zero")]
    ZeroMaxKicks,
    /// A required builder field was never set
    #[error("`{0}` must be initialized")]
    UninitializedField(&'static str),
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(error: derive_builder::UninitializedFieldError) -> Self {
        Self::UninitializedField(error.field_name())
    }
}

/// Builder checks shared by every tier.
fn validate_common(capacity: Option<usize>, max_kicks: Option<usize>) -> Result<(), Error> {
    if capacity == Some(0) {
        return Err(Error::ZeroCapacity);
    }
    if max_kicks == Some(0) {
        return Err(Error::ZeroMaxKicks);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        assert_eq!(
            Error::ZeroCapacity.to_string(),
            "capacity must be greater than zero"
        );
        assert_eq!(
            Error::UninitializedField("hasher").to_string(),
            "`hasher` must be initialized"
        );
    }

    #[test]
    fn common_validation() {
        assert_eq!(validate_common(None, None), Ok(()));
        assert_eq!(validate_common(Some(1), Some(1)), Ok(()));
        assert_eq!(validate_common(Some(0), None), Err(Error::ZeroCapacity));
        assert_eq!(validate_common(None, Some(0)), Err(Error::ZeroMaxKicks));
    }
}
