//! Lock-free cuckoo filter.
//!
//! Each slot is one `AtomicU64` holding a [`TaggedPointer`] to a heap
//! `Record`. Every transition of a slot is a single compare-and-swap on its
//! word:
//!
//! - **empty**: null reference, unmarked;
//! - **reserved**: null reference, marked. The slot is the destination of a
//!   relocation and only that relocation may fill it;
//! - **occupied**: reference to a record, unmarked;
//! - **marked**: the record is being relocated to its alternate bucket.
//!
//! A relocation moves a record from `(b, s)` to `(alt(b), s)`, keeping the
//! slot index. The initiator reserves the destination first and marks the
//! source second, so a marked source always has somewhere to go. From then on
//! any thread that sees the mark finishes the move: it fills the destination
//! with counter `max(source, destination) + 1` and clears the source. A
//! marked source is only ever cleared once its destination holds the record,
//! so a record is never resident, unmarked, in both of its slots.
//!
//! Filling and clearing a slot bump its counter; reserving and marking do
//! not. `find` reads slot `s` of both candidate buckets in two rounds and
//! compares the counters of the rounds: a record can only have hopped past the
//! reader if both counters moved far enough, in which case it reads again.
//!
//! A counter that would pass [`MAX_COUNTER`](crate::MAX_COUNTER) is fatal:
//! the process is aborted before any slot is touched.
//!
//! Records are reclaimed with hazard pointers, see the `hazard` module.

use std::collections::HashSet;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use derive_builder::Builder;
use rand::seq::SliceRandom;
use tracing::{debug, error, trace, warn};

use crate::hash::{Fingerprint, KeyHasher, XxHasher};
use crate::hazard::{DESTINATION, HazardDomain, SOURCE, ThreadGuard};
use crate::table::{NUM_MAX_KICKS, Placement, SLOTS_PER_BUCKET, alt_index, bucket_count};
use crate::tagged::TaggedPointer;
use crate::{Error, validate_common};

/// Heap cell a slot points to. Aligned so bit 0 of its address is free for
/// the mark.
#[derive(Debug)]
#[repr(align(8))]
struct Record {
    fingerprint: Fingerprint,
}

type Tagged = TaggedPointer<Record>;
type Guard<'a> = ThreadGuard<'a, Record>;

/// Outcome of one `help_relocate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relocation {
    /// The source slot was vacated, by this call or by another thread
    /// finishing the same move.
    Moved,
    /// Initiator only: the destination is taken, or the record's alternate
    /// bucket is its own. Nothing was marked.
    Blocked,
    /// Nothing to do: the source is empty, or not marked.
    Idle,
}

/// True for an empty slot that nobody has reserved.
fn is_vacant(word: Tagged) -> bool {
    word.is_null() && !word.is_marked()
}

/// One past the largest of `counters`, or `None` if that leaves the 16-bit
/// range.
fn successor(counters: &[u16]) -> Option<u32> {
    counters
        .iter()
        .copied()
        .max()
        .unwrap_or(0)
        .checked_add(1)
        .map(u32::from)
}

/// Like [`successor`], aborting the process when the counter is exhausted.
fn bump(counters: &[u16]) -> u32 {
    match successor(counters) {
        Some(counter) => counter,
        None => {
            error!(?counters, "slot counter exhausted, aborting");
            process::abort()
        }
    }
}

/// Position of a matched fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub bucket: usize,
    pub slot: usize,
}

/// A match together with the slot word it was read from.
#[derive(Debug, Clone, Copy)]
struct Found {
    location: Location,
    observed: Tagged,
}

/// Result of inspecting one slot during a lookup.
enum Probe {
    Match(Tagged),
    Miss,
    Retry,
}

/// A cuckoo filter that never locks a slot.
///
/// Every operation takes a thread id `tid` in `[0, thread_count)`. The id
/// indexes the caller's hazard pointers and retired list, so two threads must
/// never use the same id at the same time; doing so panics.
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use concurrent_cuckoo_filter::LockFreeFilter;
///
/// let filter = Arc::new(LockFreeFilter::new(1024, 4));
/// let handles: Vec<_> = (0..4)
///     .map(|tid| {
///         let filter = Arc::clone(&filter);
///         thread::spawn(move || {
///             for i in 0..100 {
///                 assert!(filter.insert(&format!("{tid}:{i}"), tid));
///             }
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert!(filter.find("3:99", 0));
/// ```
#[derive(Debug, Builder)]
#[builder(
    pattern = "owned",
    build_fn(private, name = "base_build", error = "Error", validate = "Self::validate")
)]
pub struct LockFreeFilter<H = XxHasher>
where
    H: KeyHasher + Default,
{
    /// Number of buckets, rounded up to a power of two when built
    #[builder(default = "1024")]
    capacity: usize,

    /// Number of distinct thread ids callers may use
    #[builder(default = "1")]
    thread_count: usize,

    /// Emit per-operation debug events
    #[builder(default = "false")]
    verbose: bool,

    /// Maximum relocation path depth, and maximum number of path restarts
    #[builder(default = "NUM_MAX_KICKS")]
    max_kicks: usize,

    /// Fingerprint and bucket-hash provider
    #[builder(default)]
    hasher: H,

    /// `capacity * SLOTS_PER_BUCKET` tagged words, bucket-major
    #[builder(setter(skip))]
    slots: Box<[AtomicU64]>,

    #[builder(setter(skip))]
    hazards: HazardDomain<Record>,
}

impl<H: KeyHasher + Default> LockFreeFilter<H> {
    /// Insert `key`. Returns `false` when no relocation could free a slot in
    /// either candidate bucket.
    pub fn insert<K: AsRef<[u8]> + ?Sized>(&self, key: &K, tid: usize) -> bool {
        let guard = self.hazards.claim(tid);
        let freed = guard.free_hazard_pointers();
        if self.verbose && freed > 0 {
            trace!(tid, freed, "reclaimed retired records");
        }

        let placement = self.placement(key.as_ref());
        let record = Box::into_raw(Box::new(Record {
            fingerprint: placement.fingerprint,
        }));
        let mut order: [usize; SLOTS_PER_BUCKET] = std::array::from_fn(|slot| slot);
        loop {
            if let Some(location) = self.claim_empty(&placement, record) {
                if self.verbose {
                    debug!(tid, bucket = location.bucket, slot = location.slot, "inserted");
                }
                return true;
            }
            order.shuffle(&mut rand::rng());
            if !order
                .iter()
                .any(|&slot| self.relocate(&guard, placement.primary, slot))
            {
                break;
            }
        }

        // SAFETY: the record was never published to the table.
        drop(unsafe { Box::from_raw(record) });
        if self.verbose {
            debug!(
                tid,
                primary = placement.primary,
                alternate = placement.alternate,
                "table full, insertion failed"
            );
        }
        false
    }

    /// Check whether `key` is possibly present.
    pub fn find<K: AsRef<[u8]> + ?Sized>(&self, key: &K, tid: usize) -> bool {
        self.locate(key, tid).is_some()
    }

    /// Where `key`'s fingerprint currently sits, if anywhere. The location is
    /// a snapshot: a concurrent relocation may move the record right after.
    pub fn locate<K: AsRef<[u8]> + ?Sized>(&self, key: &K, tid: usize) -> Option<Location> {
        let guard = self.hazards.claim(tid);
        let placement = self.placement(key.as_ref());
        let found = self.search(&guard, &placement);
        if self.verbose {
            debug!(
                tid,
                primary = placement.primary,
                alternate = placement.alternate,
                found = found.is_some(),
                "find"
            );
        }
        found.map(|found| found.location)
    }

    /// Remove one copy of `key`'s fingerprint. `key` must currently be
    /// present; removing an absent key logs a warning and returns `false`.
    pub fn remove<K: AsRef<[u8]> + ?Sized>(&self, key: &K, tid: usize) -> bool {
        let guard = self.hazards.claim(tid);
        let placement = self.placement(key.as_ref());
        loop {
            let Some(Found { location, observed }) = self.search(&guard, &placement) else {
                warn!(
                    tid,
                    primary = placement.primary,
                    alternate = placement.alternate,
                    "removing a key that is not present, behavior is undefined"
                );
                return false;
            };
            let Location { bucket, slot } = location;

            if observed.is_marked() {
                // never clear a record that is being copied elsewhere
                self.help_relocate(&guard, bucket, slot, false);
                continue;
            }
            let partner = if bucket == placement.primary {
                placement.alternate
            } else {
                placement.primary
            };
            if partner != bucket && self.load(partner, slot).reference() == observed.reference() {
                // the move into this slot has not cleared its source yet
                self.help_relocate(&guard, partner, slot, false);
                continue;
            }

            let empty = Tagged::create(bump(&[observed.counter()]), ptr::null_mut(), false);
            if self.cas(bucket, slot, observed, empty) {
                guard.retire(observed.reference());
                if self.verbose {
                    debug!(tid, bucket, slot, retired = guard.retired_count(), "removed");
                }
                return true;
            }
        }
    }

    /// Number of buckets.
    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Total number of slots.
    pub fn slot_capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots. A record caught mid-relocation may be counted
    /// twice; under concurrent writes this is only a snapshot.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|word| !Tagged::from_bits(word.load(Ordering::Acquire)).is_null())
            .count()
    }

    /// True when no slot holds a record.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of slots occupied.
    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.slot_capacity() as f64
    }

    /// Number of thread ids callers may use, `0..thread_count()`.
    pub fn thread_count(&self) -> usize {
        self.hazards.thread_count()
    }

    /// Number of records `tid` has removed but not yet freed.
    ///
    /// # Panics
    ///
    /// Claims `tid` like every operation does, so it panics if `tid` is out of
    /// range or currently in use by another thread.
    pub fn retired_count(&self, tid: usize) -> usize {
        self.hazards.claim(tid).retired_count()
    }

    /// Free `tid`'s retired records that no thread is reading. `insert` does
    /// this on its own; returns how many were freed.
    pub fn reclaim(&self, tid: usize) -> usize {
        let guard = self.hazards.claim(tid);
        let freed = guard.free_hazard_pointers();
        if self.verbose {
            debug!(tid, freed, remaining = guard.retired_count(), "reclaimed retired records");
        }
        freed
    }

    /// Turn per-operation debug events on or off.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn placement(&self, key: &[u8]) -> Placement {
        Placement::of(&self.hasher, key, self.capacity)
    }

    fn slot(&self, bucket: usize, slot: usize) -> &AtomicU64 {
        &self.slots[bucket * SLOTS_PER_BUCKET + slot]
    }

    fn load(&self, bucket: usize, slot: usize) -> Tagged {
        Tagged::from_bits(self.slot(bucket, slot).load(Ordering::SeqCst))
    }

    fn cas(&self, bucket: usize, slot: usize, current: Tagged, new: Tagged) -> bool {
        self.slot(bucket, slot)
            .compare_exchange(
                current.into_bits(),
                new.into_bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn alternate(&self, bucket: usize, fingerprint: &Fingerprint) -> usize {
        alt_index(&self.hasher, bucket, fingerprint, self.capacity)
    }

    /// Publish `record` in the first empty slot of either candidate bucket.
    /// Returns `None` only once both buckets were seen full.
    fn claim_empty(&self, placement: &Placement, record: *mut Record) -> Option<Location> {
        loop {
            let mut saw_empty = false;
            for bucket in placement.buckets() {
                for slot in 0..SLOTS_PER_BUCKET {
                    let current = self.load(bucket, slot);
                    if !is_vacant(current) {
                        continue;
                    }
                    saw_empty = true;
                    let stored = Tagged::create(current.counter().into(), record, false);
                    if self.cas(bucket, slot, current, stored) {
                        return Some(Location { bucket, slot });
                    }
                }
            }
            if !saw_empty {
                return None;
            }
        }
    }

    /// Find a slot holding `placement.fingerprint`.
    ///
    /// Slot index `s` of both buckets is read twice, in two rounds. A record
    /// that dodged all four reads must have hopped between the two slots at
    /// least three times, which shows in the counters: both slots changed at
    /// least twice between rounds, and the second slot ran at least three
    /// ahead of the first one's initial counter. In that case index `s` is
    /// read again.
    fn search(&self, guard: &Guard<'_>, placement: &Placement) -> Option<Found> {
        let [first, second] = placement.buckets();
        for slot in 0..SLOTS_PER_BUCKET {
            'retry: loop {
                let mut counters = [[0u16; 2]; 2];
                for round in &mut counters {
                    for (hazard, bucket) in [(SOURCE, first), (DESTINATION, second)] {
                        let observed = guard.protect(hazard, self.slot(bucket, slot));
                        round[hazard] = observed.counter();
                        match self.probe(guard, bucket, slot, observed, &placement.fingerprint) {
                            Probe::Match(observed) => {
                                return Some(Found {
                                    location: Location { bucket, slot },
                                    observed,
                                });
                            }
                            Probe::Retry => continue 'retry,
                            Probe::Miss => {}
                        }
                    }
                }
                let [[ts1, ts2], [ts1x, ts2x]] = counters.map(|round| round.map(i32::from));
                if ts1x - ts1 >= 2 && ts2x - ts2 >= 2 && ts2x - ts1 >= 3 {
                    if self.verbose {
                        trace!(tid = guard.tid(), slot, "possible false miss, retrying");
                    }
                    continue 'retry;
                }
                break;
            }
        }
        None
    }

    /// Compare one protected slot word against `fingerprint`. A marked record
    /// is moved to its destination first and the slot index read again.
    fn probe(
        &self,
        guard: &Guard<'_>,
        bucket: usize,
        slot: usize,
        observed: Tagged,
        fingerprint: &Fingerprint,
    ) -> Probe {
        if observed.is_null() {
            return Probe::Miss;
        }
        // SAFETY: `observed` was returned by `protect`, so its record is
        // published and cannot be freed while this comparison runs.
        let matches = unsafe { (*observed.reference()).fingerprint == *fingerprint };
        if observed.is_marked() && self.help_relocate(guard, bucket, slot, false) != Relocation::Blocked {
            return Probe::Retry;
        }
        if matches {
            Probe::Match(observed)
        } else {
            Probe::Miss
        }
    }

    /// Free slot `slot` of `bucket` by moving its occupant, and the occupants
    /// in its way, one hop each towards an empty slot.
    ///
    /// The eviction path is discovered first by following alternate buckets
    /// from `bucket` until an empty slot turns up, at most `max_kicks` hops
    /// deep. The moves are then applied from the far end backwards. If a hop
    /// cannot be applied because a concurrent writer got there first, the
    /// path is rediscovered from that hop; after `max_kicks` such restarts the
    /// relocation gives up.
    fn relocate(&self, guard: &Guard<'_>, bucket: usize, slot: usize) -> bool {
        let mut route = Vec::with_capacity(self.max_kicks);
        let mut origin = bucket;
        let mut restarts = 0;
        'discovery: loop {
            let mut current = origin;
            let mut reached_empty = false;
            while route.len() < self.max_kicks {
                let occupant = guard.protect(SOURCE, self.slot(current, slot));
                if occupant.is_null() {
                    // a reserved slot belongs to another move
                    reached_empty = !occupant.is_marked();
                    break;
                }
                // SAFETY: protected above.
                let fingerprint = unsafe { (*occupant.reference()).fingerprint };
                if occupant.is_marked()
                    && matches!(
                        self.help_relocate(guard, current, slot, false),
                        Relocation::Moved | Relocation::Idle
                    )
                {
                    continue;
                }
                let next = self.alternate(current, &fingerprint);
                if next == current {
                    break;
                }
                route.push(current);
                current = next;
            }
            if !reached_empty {
                if self.verbose {
                    trace!(tid = guard.tid(), bucket, slot, depth = route.len(), "no relocation path");
                }
                return false;
            }

            for depth in (0..route.len()).rev() {
                match self.help_relocate(guard, route[depth], slot, true) {
                    Relocation::Moved | Relocation::Idle => {}
                    Relocation::Blocked => {
                        restarts += 1;
                        if restarts > self.max_kicks {
                            if self.verbose {
                                trace!(tid = guard.tid(), bucket, slot, restarts, "relocation abandoned");
                            }
                            return false;
                        }
                        origin = route[depth];
                        route.truncate(depth);
                        continue 'discovery;
                    }
                }
            }
            if self.verbose {
                debug!(tid = guard.tid(), bucket, slot, hops = route.len(), "relocated");
            }
            return true;
        }
    }

    /// Move the record in `(bucket, slot)` to `(alt(bucket), slot)`.
    ///
    /// A marked source is always carried through to the end, whoever marked
    /// it. As initiator, an unmarked source is first given a reserved
    /// destination and then marked; if the destination is taken nothing is
    /// marked and `Blocked` is returned.
    fn help_relocate(&self, guard: &Guard<'_>, bucket: usize, slot: usize, initiator: bool) -> Relocation {
        loop {
            let source = guard.protect(SOURCE, self.slot(bucket, slot));
            if source.is_null() {
                return Relocation::Idle;
            }
            if source.is_marked() {
                return self.complete_move(guard, bucket, slot, source);
            }
            if !initiator {
                return Relocation::Idle;
            }
            // SAFETY: protected above.
            let fingerprint = unsafe { (*source.reference()).fingerprint };
            let destination = self.alternate(bucket, &fingerprint);
            if destination == bucket {
                return Relocation::Blocked;
            }
            let target = self.load(destination, slot);
            if target.reference() == source.reference() {
                // this slot is the destination of a move whose source is
                // still marked
                self.help_relocate(guard, destination, slot, false);
                continue;
            }
            if !is_vacant(target) {
                return Relocation::Blocked;
            }
            // every counter the move will write, checked before anything is
            // reserved or marked
            bump(&[source.counter(), target.counter()]);

            let reserved = target.with_mark(true);
            if !self.cas(destination, slot, target, reserved) {
                continue;
            }
            let marked = source.with_mark(true);
            if !self.cas(bucket, slot, source, marked) {
                // no helper fills a reservation whose source is unmarked
                let released = Tagged::create(bump(&[reserved.counter()]), ptr::null_mut(), false);
                self.cas(destination, slot, reserved, released);
                continue;
            }
            return self.complete_move(guard, bucket, slot, marked);
        }
    }

    /// Carry the marked record in `(bucket, slot)` into its destination and
    /// clear the source. `marked` must be protected at the `SOURCE` hazard.
    fn complete_move(&self, guard: &Guard<'_>, bucket: usize, slot: usize, marked: Tagged) -> Relocation {
        let record = marked.reference();
        // SAFETY: the caller protected `marked`.
        let fingerprint = unsafe { (*record).fingerprint };
        let destination = self.alternate(bucket, &fingerprint);
        loop {
            let target = self.load(destination, slot);
            if target.reference() == record {
                break;
            }
            // The source word is re-read after the destination: if it is
            // unchanged, the move was unfinished when `target` was read.
            if self.load(bucket, slot) != marked {
                return Relocation::Moved;
            }
            if !target.is_null() {
                // a reserved destination cannot be taken by anyone else
                if self.verbose {
                    trace!(tid = guard.tid(), bucket, slot, destination, "relocation blocked");
                }
                return Relocation::Blocked;
            }
            let filled = Tagged::create(bump(&[marked.counter(), target.counter()]), record, false);
            if self.cas(destination, slot, target, filled) {
                if self.verbose {
                    trace!(tid = guard.tid(), bucket, slot, destination, "moved record");
                }
                break;
            }
        }
        // another thread may already have cleared the source
        let empty = Tagged::create(bump(&[marked.counter()]), ptr::null_mut(), false);
        self.cas(bucket, slot, marked, empty);
        Relocation::Moved
    }
}

impl LockFreeFilter<XxHasher> {
    /// Create a new LockFreeFilterBuilder with default settings
    pub fn builder() -> LockFreeFilterBuilder<XxHasher> {
        LockFreeFilterBuilder::default()
    }

    /// Create a filter with at least `capacity` buckets, usable from thread
    /// ids `0..thread_count`.
    ///
    /// # Panics
    ///
    /// If `capacity` or `thread_count` is zero.
    pub fn new(capacity: usize, thread_count: usize) -> Self {
        Self::with_verbose(capacity, thread_count, false)
    }

    /// Like [`new`](Self::new), optionally emitting per-operation debug events.
    pub fn with_verbose(capacity: usize, thread_count: usize, verbose: bool) -> Self {
        match Self::builder()
            .capacity(capacity)
            .thread_count(thread_count)
            .verbose(verbose)
            .build()
        {
            Ok(filter) => filter,
            Err(error) => panic!("invalid lock-free filter configuration: {error}"),
        }
    }
}

impl<H: KeyHasher + Default> Drop for LockFreeFilter<H> {
    fn drop(&mut self) {
        // a record caught between fill and clear of a move sits in two slots
        let resident: HashSet<*mut Record> = self
            .slots
            .iter_mut()
            .map(|word| Tagged::from_bits(*word.get_mut()).reference())
            .filter(|reference| !reference.is_null())
            .collect();
        let records = resident.len();
        for reference in resident {
            // SAFETY: `&mut self` rules out concurrent readers, and retired
            // records are never resident, so each record is freed once here.
            drop(unsafe { Box::from_raw(reference) });
        }
        if self.verbose {
            debug!(buckets = self.capacity, records, "lock-free filter terminated");
        }
    }
}

impl<H: KeyHasher + Default> LockFreeFilterBuilder<H> {
    fn validate(&self) -> Result<(), Error> {
        if self.thread_count == Some(0) {
            return Err(Error::ZeroThreadCount);
        }
        validate_common(self.capacity, self.max_kicks)
    }

    /// Build a LockFreeFilter with the specified configuration
    pub fn build(self) -> Result<LockFreeFilter<H>, Error> {
        let mut filter = self.base_build()?;
        filter.capacity = bucket_count(filter.capacity);
        filter.slots = (0..filter.capacity * SLOTS_PER_BUCKET)
            .map(|_| AtomicU64::new(Tagged::null().into_bits()))
            .collect();
        filter.hazards = HazardDomain::new(filter.thread_count);
        if filter.verbose {
            debug!(
                buckets = filter.capacity,
                threads = filter.thread_count,
                "lock-free filter started"
            );
        }
        Ok(filter)
    }
}
