//! Cuckoo filter with a fixed pool of striped reader/writer locks.
//!
//! Bucket `b` lives in stripe `b % LOCK_STRIPES` at position
//! `b / LOCK_STRIPES`, and is guarded by that stripe's lock. An operation
//! never holds two stripe locks at once: it locks the primary bucket's
//! stripe, releases it, then locks the alternate's.
//!
//! That leaves a window between the two buckets in which another thread can
//! change what was already inspected. Operations are linearizable per bucket
//! but not across the two-bucket span of a single call, e.g. a `find` can
//! miss a key that a concurrent kick moves from the alternate bucket to the
//! primary one between the two lookups. The sequential and lock-free tiers do
//! not have this weakness.

use derive_builder::Builder;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::hash::{KeyHasher, XxHasher};
use crate::table::{
    Bucket, BucketAccess, KickParams, LOCK_STRIPES, NUM_MAX_KICKS, Placement, SLOTS_PER_BUCKET,
    bucket_count, kick,
};
use crate::{Error, validate_common};

type Stripes = [RwLock<Vec<Bucket>>; LOCK_STRIPES];

/// Per-bucket access that takes the stripe's write lock for each step.
struct Striped<'a>(&'a Stripes);

impl BucketAccess for Striped<'_> {
    fn with_bucket<R>(&mut self, index: usize, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut stripe = self.0[index % LOCK_STRIPES].write();
        f(&mut stripe[index / LOCK_STRIPES])
    }
}

/// A cuckoo filter whose buckets are guarded by [`LOCK_STRIPES`] reader/writer
/// locks.
///
/// `find` takes the stripe locks in shared mode; `insert`, `remove` and every
/// kick step take them exclusively, one bucket at a time.
#[derive(Debug, Builder)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "base_build", error = "Error", validate = "Self::validate")
)]
pub struct FineGrainedFilter<H = XxHasher>
where
    H: KeyHasher + Default,
{
    /// Number of buckets, rounded up to a power of two when built
    #[builder(default = "1024")]
    capacity: usize,

    /// Emit per-operation debug events
    #[builder(default = "false")]
    verbose: bool,

    /// Maximum length of a kick chain
    #[builder(default = "NUM_MAX_KICKS")]
    max_kicks: usize,

    /// Fingerprint and bucket-hash provider
    #[builder(default)]
    hasher: H,

    #[builder(setter(skip))]
    stripes: Stripes,
}

impl<H: KeyHasher + Default> FineGrainedFilter<H> {
    /// Insert `key`. Returns `false` when the table is saturated for it.
    pub fn insert<K: AsRef<[u8]> + ?Sized>(&self, key: &K) -> bool {
        let placement = Placement::of(&self.hasher, key.as_ref(), self.capacity);
        let mut access = Striped(&self.stripes);
        for index in placement.buckets() {
            let stored = access.with_bucket(index, |bucket| bucket.try_insert(placement.fingerprint));
            if let Some(slot) = stored {
                if self.verbose {
                    debug!(bucket = index, slot, "inserted");
                }
                return true;
            }
        }
        let params = KickParams {
            hasher: &self.hasher,
            num_buckets: self.capacity,
            max_kicks: self.max_kicks,
            verbose: self.verbose,
        };
        if kick(&mut access, params, placement) {
            return true;
        }
        if self.verbose {
            debug!(
                primary = placement.primary,
                alternate = placement.alternate,
                "table full, insertion failed"
            );
        }
        false
    }

    /// Check whether `key` is possibly present.
    pub fn find<K: AsRef<[u8]> + ?Sized>(&self, key: &K) -> bool {
        let placement = Placement::of(&self.hasher, key.as_ref(), self.capacity);
        let found = placement.buckets().iter().any(|&index| {
            self.stripes[index % LOCK_STRIPES].read()[index / LOCK_STRIPES]
                .position(&placement.fingerprint)
                .is_some()
        });
        if self.verbose {
            debug!(primary = placement.primary, alternate = placement.alternate, found, "find");
        }
        found
    }

    /// Remove one copy of `key`'s fingerprint. `key` must currently be
    /// present; see [`SequentialFilter::remove`](crate::SequentialFilter::remove).
    pub fn remove<K: AsRef<[u8]> + ?Sized>(&self, key: &K) -> bool {
        let placement = Placement::of(&self.hasher, key.as_ref(), self.capacity);
        let mut access = Striped(&self.stripes);
        for index in placement.buckets() {
            if let Some(slot) = access.with_bucket(index, |bucket| bucket.remove(&placement.fingerprint)) {
                if self.verbose {
                    debug!(bucket = index, slot, "removed");
                }
                return true;
            }
        }
        warn!(
            primary = placement.primary,
            alternate = placement.alternate,
            "removing a key that is not present, behavior is undefined"
        );
        false
    }

    /// Number of buckets.
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Total number of slots.
    pub fn slot_capacity(&self) -> usize {
        self.capacity * SLOTS_PER_BUCKET
    }

    /// Number of occupied slots. Stripes are counted one after another, so
    /// under concurrent writes this is only a snapshot.
    pub fn len(&self) -> usize {
        self.stripes
            .iter()
            .map(|stripe| stripe.read().iter().map(Bucket::occupied).sum::<usize>())
            .sum()
    }

    /// True when no slot holds a fingerprint.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of slots occupied.
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.slot_capacity() as f64
    }

    /// Turn per-operation debug events on or off.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }
}

impl FineGrainedFilter<XxHasher> {
    /// Create a new FineGrainedFilterBuilder with default settings
    pub fn builder() -> FineGrainedFilterBuilder<XxHasher> {
        FineGrainedFilterBuilder::default()
    }

    /// Create a filter with at least `capacity` buckets.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_verbose(capacity, false)
    }

    /// Like [`new`](Self::new), optionally emitting per-operation debug events.
    pub fn with_verbose(capacity: usize, verbose: bool) -> Self {
        match Self::builder().capacity(capacity).verbose(verbose).build() {
            Ok(filter) => filter,
            Err(error) => panic!("invalid fine-grained filter configuration: {error}"),
        }
    }
}

impl Default for FineGrainedFilter<XxHasher> {
    fn default() -> Self {
        Self::builder()
            .build()
            .unwrap_or_else(|error| panic!("default configuration is valid: {error}"))
    }
}

impl<H: KeyHasher + Default> Drop for FineGrainedFilter<H> {
    fn drop(&mut self) {
        if self.verbose {
            debug!(buckets = self.capacity, "fine-grained filter terminated");
        }
    }
}

impl<H: KeyHasher + Default> FineGrainedFilterBuilder<H> {
    fn validate(&self) -> Result<(), Error> {
        validate_common(self.capacity, self.max_kicks)
    }

    /// Build a FineGrainedFilter with the specified configuration
    pub fn build(self) -> Result<FineGrainedFilter<H>, Error> {
        let mut filter = self.base_build()?;
        filter.capacity = bucket_count(filter.capacity);
        for (stripe, lock) in filter.stripes.iter_mut().enumerate() {
            let buckets = filter.capacity.saturating_sub(stripe).div_ceil(LOCK_STRIPES);
            *lock.get_mut() = vec![Bucket::default(); buckets];
        }
        if filter.verbose {
            debug!(
                buckets = filter.capacity,
                stripes = LOCK_STRIPES,
                "fine-grained filter started"
            );
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tracing_test::traced_test;

    #[test]
    fn stripes_cover_every_bucket() {
        for capacity in [1, 3, 8, 9, 1000] {
            let filter = FineGrainedFilter::new(capacity);
            let buckets: usize = filter.stripes.iter().map(|stripe| stripe.read().len()).sum();
            assert_eq!(buckets, filter.size());
            for index in 0..filter.size() {
                assert!(index / LOCK_STRIPES < filter.stripes[index % LOCK_STRIPES].read().len());
            }
        }
    }

    #[test]
    fn insert_find_remove() {
        let filter = FineGrainedFilter::new(128);
        for i in 0..100 {
            assert!(filter.insert(&format!("item_{i}")));
        }
        assert_eq!(filter.len(), 100);
        for i in 0..100 {
            assert!(filter.find(&format!("item_{i}")));
        }
        for i in (0..100).step_by(2) {
            assert!(filter.remove(&format!("item_{i}")));
        }
        for i in 0..100 {
            assert_eq!(filter.find(&format!("item_{i}")), i % 2 == 1);
        }
    }

    #[test]
    fn builder_rejects_zero_capacity() {
        let result = FineGrainedFilter::builder().capacity(0).build();
        assert_eq!(result.err(), Some(Error::ZeroCapacity));
    }

    #[test]
    fn disjoint_writers() {
        let filter = Arc::new(FineGrainedFilter::new(4096));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let filter = Arc::clone(&filter);
                thread::spawn(move || {
                    for i in 0..500 {
                        assert!(filter.insert(&format!("t{t}_{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(filter.len(), 4000);
        for t in 0..8 {
            for i in 0..500 {
                assert!(filter.find(&format!("t{t}_{i}")));
            }
        }
    }

    #[traced_test]
    #[test]
    fn removing_absent_key_warns() {
        let filter = FineGrainedFilter::new(16);
        assert!(!filter.remove("ghost"));
        assert!(logs_contain("behavior is undefined"));
    }
}
