//! Cuckoo filter behind one global lock.

use derive_builder::Builder;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::hash::{KeyHasher, XxHasher};
use crate::table::{Bucket, KickParams, NUM_MAX_KICKS, Placement, SLOTS_PER_BUCKET, bucket_count, kick};
use crate::{Error, validate_common};

/// A cuckoo filter whose whole table is guarded by a single mutex.
///
/// Every `insert`, `find` and `remove` holds the lock for its full duration,
/// so the filter is strictly linearizable: all operations appear in one total
/// order. It is the reference tier the other two are measured against.
///
/// ```
/// use concurrent_cuckoo_filter::SequentialFilter;
///
/// let filter = SequentialFilter::new(100);
/// assert_eq!(filter.size(), 128);
/// assert!(filter.insert(b"key"));
/// assert!(filter.find(b"key"));
/// assert!(filter.remove(b"key"));
/// assert!(!filter.find(b"key"));
/// ```
#[derive(Debug, Builder)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "base_build", error = "Error", validate = "Self::validate")
)]
pub struct SequentialFilter<H = XxHasher>
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
    table: Mutex<Vec<Bucket>>,
}

impl<H: KeyHasher + Default> SequentialFilter<H> {
    /// Insert `key`. Returns `false` when both candidate buckets are full and
    /// no kick chain of at most `max_kicks` swaps could make room.
    pub fn insert<K: AsRef<[u8]> + ?Sized>(&self, key: &K) -> bool {
        let placement = Placement::of(&self.hasher, key.as_ref(), self.capacity);
        let mut table = self.table.lock();
        for index in placement.buckets() {
            if let Some(slot) = table[index].try_insert(placement.fingerprint) {
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
        if kick(table.as_mut_slice(), params, placement) {
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

    /// Check whether `key` is possibly present. Never returns `false` for a
    /// key that was inserted and not removed.
    pub fn find<K: AsRef<[u8]> + ?Sized>(&self, key: &K) -> bool {
        let placement = Placement::of(&self.hasher, key.as_ref(), self.capacity);
        let table = self.table.lock();
        let found = placement
            .buckets()
            .iter()
            .any(|&index| table[index].position(&placement.fingerprint).is_some());
        if self.verbose {
            debug!(primary = placement.primary, alternate = placement.alternate, found, "find");
        }
        found
    }

    /// Remove one copy of `key`'s fingerprint.
    ///
    /// `key` must currently be present. Removing a key that was never
    /// inserted may remove a colliding key's fingerprint instead; when no
    /// matching fingerprint exists at all, nothing is cleared and a warning is
    /// logged.
    pub fn remove<K: AsRef<[u8]> + ?Sized>(&self, key: &K) -> bool {
        let placement = Placement::of(&self.hasher, key.as_ref(), self.capacity);
        let mut table = self.table.lock();
        for index in placement.buckets() {
            if let Some(slot) = table[index].remove(&placement.fingerprint) {
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

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.table.lock().iter().map(Bucket::occupied).sum()
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

impl SequentialFilter<XxHasher> {
    /// Create a new SequentialFilterBuilder with default settings
    pub fn builder() -> SequentialFilterBuilder<XxHasher> {
        SequentialFilterBuilder::default()
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
            Err(error) => panic!("invalid sequential filter configuration: {error}"),
        }
    }
}

impl Default for SequentialFilter<XxHasher> {
    fn default() -> Self {
        Self::builder()
            .build()
            .unwrap_or_else(|error| panic!("default configuration is valid: {error}"))
    }
}

impl<H: KeyHasher + Default> Drop for SequentialFilter<H> {
    fn drop(&mut self) {
        if self.verbose {
            debug!(buckets = self.capacity, "sequential filter terminated");
        }
    }
}

impl<H: KeyHasher + Default> SequentialFilterBuilder<H> {
    fn validate(&self) -> Result<(), Error> {
        validate_common(self.capacity, self.max_kicks)
    }

    /// Build a SequentialFilter with the specified configuration
    pub fn build(self) -> Result<SequentialFilter<H>, Error> {
        let mut filter = self.base_build()?;
        filter.capacity = bucket_count(filter.capacity);
        filter.table = Mutex::new(vec![Bucket::default(); filter.capacity]);
        if filter.verbose {
            debug!(buckets = filter.capacity, "sequential filter started");
        }
        Ok(filter)
    }
}
