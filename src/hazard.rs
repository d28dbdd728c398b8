//! Hazard-pointer reclamation for the lock-free filter.
//!
//! Every thread id owns a [`HazardRecord`]: two published references it is
//! about to dereference, and a list of references it has unlinked from the
//! table but not yet freed. A retired reference is freed only by its owner,
//! and only once no thread publishes it.
//!
//! A thread id is claimed for the duration of one top-level operation through
//! a [`ThreadGuard`]. Claiming an id that is already held by another thread
//! panics: sharing an id would let two threads scribble over the same hazard
//! slots and free records the other one is still reading.

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::tagged::TaggedPointer;

/// Hazard entries published per thread.
pub(crate) const HAZARDS_PER_THREAD: usize = 2;

/// Hazard index for the slot an operation reads from.
pub(crate) const SOURCE: usize = 0;

/// Hazard index for the slot an operation may write to.
pub(crate) const DESTINATION: usize = 1;

/// Per-thread published references and retired list.
pub(crate) struct HazardRecord<T> {
    hazards: [AtomicPtr<T>; HAZARDS_PER_THREAD],
    claimed: AtomicBool,
    retired: UnsafeCell<Vec<*mut T>>,
}

// SAFETY: `hazards` and `claimed` are atomics. `retired` is only touched by
// the holder of the `claimed` flag (through a `ThreadGuard`) or through
// `&mut self`, so it is never accessed from two threads at once.
unsafe impl<T: Send> Send for HazardRecord<T> {}
unsafe impl<T: Send> Sync for HazardRecord<T> {}

impl<T> Default for HazardRecord<T> {
    fn default() -> Self {
        Self {
            hazards: [AtomicPtr::default(), AtomicPtr::default()],
            claimed: AtomicBool::new(false),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

impl<T> fmt::Debug for HazardRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardRecord")
            .field("hazards", &self.hazards)
            .field("claimed", &self.claimed)
            .finish_non_exhaustive()
    }
}

/// All threads' hazard records. Records are boxed (`Box<T>`) allocations and
/// are freed with `Box::from_raw`.
pub(crate) struct HazardDomain<T> {
    records: Box<[HazardRecord<T>]>,
}

impl<T> HazardDomain<T> {
    pub fn new(thread_count: usize) -> Self {
        Self {
            records: (0..thread_count).map(|_| HazardRecord::default()).collect(),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.records.len()
    }

    /// Claim `tid` for one operation. Both hazard entries start out null.
    ///
    /// # Panics
    ///
    /// If `tid >= thread_count`, or if another thread currently holds `tid`.
    pub fn claim(&self, tid: usize) -> ThreadGuard<'_, T> {
        let Some(record) = self.records.get(tid) else {
            panic!(
                "thread id {tid} is out of range for a filter with {} threads",
                self.records.len()
            );
        };
        if record
            .claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            panic!("thread id {tid} is already in use by another thread");
        }
        let guard = ThreadGuard {
            domain: self,
            record,
            tid,
        };
        guard.clear();
        guard
    }

    /// Union of every thread's published references.
    fn published(&self) -> HashSet<*mut T> {
        self.records
            .iter()
            .flat_map(|record| record.hazards.iter())
            .map(|hazard| hazard.load(Ordering::SeqCst))
            .filter(|reference| !reference.is_null())
            .collect()
    }
}

impl<T> Default for HazardDomain<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T> fmt::Debug for HazardDomain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardDomain")
            .field("thread_count", &self.records.len())
            .finish()
    }
}

impl<T> Drop for HazardDomain<T> {
    fn drop(&mut self) {
        for record in self.records.iter_mut() {
            for reference in record.retired.get_mut().drain(..) {
                // SAFETY: no thread can be inside an operation while the
                // domain is dropped, and every retired reference was unlinked
                // from the table exactly once.
                drop(unsafe { Box::from_raw(reference) });
            }
        }
    }
}

/// Exclusive hold on one thread id for the duration of an operation.
pub(crate) struct ThreadGuard<'a, T> {
    domain: &'a HazardDomain<T>,
    record: &'a HazardRecord<T>,
    tid: usize,
}

impl<T> ThreadGuard<'_, T> {
    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Read `slot` and publish its reference at hazard `index`.
    ///
    /// The slot is re-read after publishing until the reference is stable, so
    /// the returned word's reference stays valid until hazard `index` is
    /// overwritten or the guard is dropped.
    pub fn protect(&self, index: usize, slot: &AtomicU64) -> TaggedPointer<T> {
        let mut observed = TaggedPointer::from_bits(slot.load(Ordering::SeqCst));
        loop {
            self.record.hazards[index].store(observed.reference(), Ordering::SeqCst);
            let current = TaggedPointer::from_bits(slot.load(Ordering::SeqCst));
            if current.reference() == observed.reference() {
                return current;
            }
            observed = current;
        }
    }

    /// Unpublish both hazard entries.
    pub fn clear(&self) {
        for hazard in &self.record.hazards {
            hazard.store(ptr::null_mut(), Ordering::SeqCst);
        }
    }

    /// Hand an unlinked reference over for deferred freeing.
    pub fn retire(&self, reference: *mut T) {
        self.retired().push(reference);
    }

    pub fn retired_count(&self) -> usize {
        self.retired().len()
    }

    /// Free every retired reference that no thread currently publishes,
    /// keeping the rest for a later pass. Returns how many were freed.
    pub fn free_hazard_pointers(&self) -> usize {
        let retired = self.retired();
        if retired.is_empty() {
            return 0;
        }
        let published = self.domain.published();
        let before = retired.len();
        retired.retain(|&reference| {
            if published.contains(&reference) {
                return true;
            }
            // SAFETY: the reference was unlinked from the table before it was
            // retired, and no thread published it after that point, so nobody
            // can dereference it again.
            drop(unsafe { Box::from_raw(reference) });
            false
        });
        before - retired.len()
    }

    #[allow(clippy::mut_from_ref)]
    fn retired(&self) -> &mut Vec<*mut T> {
        // SAFETY: this guard holds the `claimed` flag of `record`, which makes
        // it the only accessor of the retired list, and no reference returned
        // here outlives the method that obtained it.
        unsafe { &mut *self.record.retired.get() }
    }
}

impl<T> Drop for ThreadGuard<'_, T> {
    fn drop(&mut self) {
        self.clear();
        self.record.claimed.store(false, Ordering::Release);
    }
}
