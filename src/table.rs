//! Bucket table layout shared by every filter tier.
//!
//! A table is `num_buckets` buckets of [`SLOTS_PER_BUCKET`] slots each. For a
//! key `k` with fingerprint `f` the two candidate buckets are
//!
//! ```text
//! h1 = hash32(k) mod num_buckets
//! h2 = h1 XOR (hash32(f) mod num_buckets)
//! ```
//!
//! `num_buckets` is always a power of two, so the XOR stays in range and
//! applying it twice returns to `h1`: an occupant of either bucket can always
//! compute the other one from its fingerprint alone.

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::hash::{Fingerprint, KeyHasher};

/// Number of slots in one bucket.
pub const SLOTS_PER_BUCKET: usize = 4;

/// Maximum number of kicks (and relocation path depth) tried for one insert
/// before the table is considered saturated for that item.
pub const NUM_MAX_KICKS: usize = 10;

/// Number of reader/writer locks in the fine-grained tier's pool.
pub const LOCK_STRIPES: usize = 8;

/// Actual bucket count for a requested capacity.
pub(crate) fn bucket_count(capacity: usize) -> usize {
    capacity.next_power_of_two()
}

/// Alternate bucket of a fingerprint currently sitting in bucket `index`.
pub(crate) fn alt_index<H: KeyHasher>(
    hasher: &H,
    index: usize,
    fingerprint: &Fingerprint,
    num_buckets: usize,
) -> usize {
    index ^ (hasher.hash32(fingerprint) as usize & (num_buckets - 1))
}

/// Fingerprint and both candidate buckets of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    pub fingerprint: Fingerprint,
    pub primary: usize,
    pub alternate: usize,
}

impl Placement {
    pub fn of<H: KeyHasher>(hasher: &H, key: &[u8], num_buckets: usize) -> Self {
        let fingerprint = hasher.fingerprint(key);
        let primary = hasher.hash32(key) as usize & (num_buckets - 1);
        let alternate = alt_index(hasher, primary, &fingerprint, num_buckets);
        Self {
            fingerprint,
            primary,
            alternate,
        }
    }

    /// Both candidates, primary first.
    pub fn buckets(&self) -> [usize; 2] {
        [self.primary, self.alternate]
    }
}

/// One bucket of the lock-based tiers: `SLOTS_PER_BUCKET` optional
/// fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Bucket([Option<Fingerprint>; SLOTS_PER_BUCKET]);

impl Bucket {
    /// Slot holding `fingerprint`, if any.
    pub fn position(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.0.iter().position(|slot| slot.as_ref() == Some(fingerprint))
    }

    /// Store `fingerprint` in the first empty slot. Returns the slot used, or
    /// `None` when the bucket is full.
    pub fn try_insert(&mut self, fingerprint: Fingerprint) -> Option<usize> {
        let slot = self.0.iter().position(Option::is_none)?;
        self.0[slot] = Some(fingerprint);
        Some(slot)
    }

    /// Clear the slot holding `fingerprint`. Returns the slot cleared.
    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<usize> {
        let slot = self.position(fingerprint)?;
        self.0[slot] = None;
        Some(slot)
    }

    /// Put `fingerprint` into `slot` and hand back whatever was there.
    pub fn swap(&mut self, slot: usize, fingerprint: Fingerprint) -> Option<Fingerprint> {
        self.0[slot].replace(fingerprint)
    }

    /// Put `value` back into `slot` if the slot still holds `expected`.
    pub fn restore(&mut self, slot: usize, expected: &Fingerprint, value: Fingerprint) -> bool {
        if self.0[slot].as_ref() != Some(expected) {
            return false;
        }
        self.0[slot] = Some(value);
        true
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.0.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Exclusive access to one bucket at a time.
///
/// The sequential tier hands out buckets from the table it already holds
/// locked; the fine-grained tier takes the bucket's stripe lock for the
/// duration of the closure.
pub(crate) trait BucketAccess {
    fn with_bucket<R>(&mut self, index: usize, f: impl FnOnce(&mut Bucket) -> R) -> R;
}

impl BucketAccess for [Bucket] {
    fn with_bucket<R>(&mut self, index: usize, f: impl FnOnce(&mut Bucket) -> R) -> R {
        f(&mut self[index])
    }
}

/// Table geometry and tuning for a kick chain.
#[derive(Debug)]
pub(crate) struct KickParams<'a, H> {
    pub hasher: &'a H,
    pub num_buckets: usize,
    pub max_kicks: usize,
    pub verbose: bool,
}

/// Place `placement.fingerprint` by displacing occupants along a chain of at
/// most `max_kicks` swaps.
///
/// The chain starts in a randomly chosen candidate bucket. Each step swaps the
/// carried fingerprint into a random slot and carries the displaced one to its
/// alternate bucket; the chain ends as soon as a carried fingerprint lands in
/// an empty slot. If the budget runs out, every swap is undone in reverse
/// order so no resident fingerprint is lost, and `false` is returned.
///
/// A step is only undone while its slot still holds what the chain put there.
/// Once a concurrent writer has changed one, the earlier steps are kept, the
/// fingerprint in hand is stored in either of its buckets, and the insert
/// counts as done.
pub(crate) fn kick<H, A>(access: &mut A, params: KickParams<'_, H>, placement: Placement) -> bool
where
    H: KeyHasher,
    A: BucketAccess + ?Sized,
{
    let mut rng = rand::rng();
    let mut index = if rng.random_bool(0.5) {
        placement.primary
    } else {
        placement.alternate
    };
    let mut carried = placement.fingerprint;
    let mut chain = Vec::with_capacity(params.max_kicks);

    for _ in 0..params.max_kicks {
        let slot = rng.random_range(0..SLOTS_PER_BUCKET);
        let Some(victim) = access.with_bucket(index, |bucket| bucket.swap(slot, carried)) else {
            // the slot was emptied since the candidates were scanned
            return true;
        };
        chain.push((index, slot, carried));
        index = alt_index(params.hasher, index, &victim, params.num_buckets);
        carried = victim;
        if params.verbose {
            trace!(bucket = index, slot, kicks = chain.len(), "kicked fingerprint");
        }
        if let Some(slot) = access.with_bucket(index, |bucket| bucket.try_insert(carried)) {
            if params.verbose {
                debug!(bucket = index, slot, kicks = chain.len(), "kick chain placed fingerprint");
            }
            return true;
        }
    }

    // Undo: put each victim back where it was and carry the previous one.
    while let Some((index, slot, placed)) = chain.pop() {
        if access.with_bucket(index, |bucket| bucket.restore(slot, &placed, carried)) {
            carried = placed;
            continue;
        }
        let alternate = alt_index(params.hasher, index, &carried, params.num_buckets);
        let stored = [index, alternate]
            .into_iter()
            .any(|bucket| access.with_bucket(bucket, |b| b.try_insert(carried)).is_some());
        if !stored {
            warn!(bucket = index, slot, "kick undo raced a concurrent writer, a fingerprint was lost");
        } else if params.verbose {
            debug!(bucket = index, slot, "kick undo stopped at a slot changed by another writer");
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::XxHasher;

    #[test]
    fn bucket_count_rounds_up_to_power_of_two() {
        assert_eq!(bucket_count(1), 1);
        assert_eq!(bucket_count(1000), 1024);
        assert_eq!(bucket_count(1024), 1024);
        assert_eq!(bucket_count(1025), 2048);
    }

    #[test]
    fn candidates_are_mutually_reachable() {
        let hasher = XxHasher::default();
        for num_buckets in [1, 2, 64, 1024] {
            for i in 0..200u32 {
                let key = format!("key_{i}");
                let placement = Placement::of(&hasher, key.as_bytes(), num_buckets);
                assert!(placement.primary < num_buckets);
                assert!(placement.alternate < num_buckets);
                let f = &placement.fingerprint;
                assert_eq!(
                    alt_index(&hasher, placement.alternate, f, num_buckets),
                    placement.primary
                );
                assert_eq!(
                    alt_index(&hasher, placement.primary, f, num_buckets),
                    placement.alternate
                );
            }
        }
    }

    #[test]
    fn bucket_fills_then_rejects() {
        let mut bucket = Bucket::default();
        for i in 0..SLOTS_PER_BUCKET {
            assert_eq!(bucket.try_insert([i as u8; 16]), Some(i));
        }
        assert_eq!(bucket.try_insert([99; 16]), None);
        assert_eq!(bucket.occupied(), SLOTS_PER_BUCKET);
    }

    #[test]
    fn bucket_remove_matches_fingerprint() {
        let mut bucket = Bucket::default();
        bucket.try_insert([1; 16]);
        bucket.try_insert([2; 16]);
        assert_eq!(bucket.remove(&[3; 16]), None);
        assert_eq!(bucket.remove(&[2; 16]), Some(1));
        assert_eq!(bucket.position(&[1; 16]), Some(0));
        assert_eq!(bucket.occupied(), 1);
    }

    #[test]
    fn bucket_swap_and_restore() {
        let mut bucket = Bucket::default();
        assert_eq!(bucket.swap(2, [5; 16]), None);
        assert_eq!(bucket.swap(2, [6; 16]), Some([5; 16]));
        assert!(!bucket.restore(2, &[5; 16], [7; 16]));
        assert!(bucket.restore(2, &[6; 16], [7; 16]));
        assert_eq!(bucket.position(&[7; 16]), Some(2));
        assert_eq!(bucket.occupied(), 1);
    }

    /// Every key routes to buckets 0 and 1 of a two-bucket table.
    #[derive(Debug, Default)]
    struct PairHasher;

    impl KeyHasher for PairHasher {
        fn fingerprint(&self, key: &[u8]) -> Fingerprint {
            XxHasher::default().fingerprint(key)
        }

        fn hash32(&self, bytes: &[u8]) -> u32 {
            if bytes.len() == crate::hash::FINGERPRINT_LEN { 1 } else { 0 }
        }
    }

    #[test]
    fn kick_chain_undo_keeps_every_resident() {
        let hasher = PairHasher;
        let mut table = vec![Bucket::default(); 2];
        let residents: Vec<Fingerprint> = (0..8)
            .map(|i| hasher.fingerprint(format!("resident_{i}").as_bytes()))
            .collect();
        for (i, fingerprint) in residents.iter().enumerate() {
            table[i / SLOTS_PER_BUCKET].try_insert(*fingerprint);
        }
        let before = table.clone();

        let placement = Placement::of(&hasher, b"newcomer", 2);
        assert_eq!(placement.buckets(), [0, 1]);
        let params = KickParams {
            hasher: &hasher,
            num_buckets: 2,
            max_kicks: NUM_MAX_KICKS,
            verbose: false,
        };
        assert!(!kick(table.as_mut_slice(), params, placement));
        assert_eq!(table, before);
    }

    #[test]
    fn kick_chain_finds_the_free_slot() {
        let hasher = PairHasher;
        let mut table = vec![Bucket::default(); 2];
        for i in 0..7 {
            let fingerprint = hasher.fingerprint(format!("resident_{i}").as_bytes());
            table[i / SLOTS_PER_BUCKET].try_insert(fingerprint);
        }
        let placement = Placement::of(&hasher, b"newcomer", 2);
        let params = KickParams {
            hasher: &hasher,
            num_buckets: 2,
            max_kicks: NUM_MAX_KICKS,
            verbose: true,
        };
        // bucket 1 has a hole that every chain reaches within two kicks
        assert!(kick(table.as_mut_slice(), params, placement));
        let occupied: usize = table.iter().map(Bucket::occupied).sum();
        assert_eq!(occupied, 8);
        assert!(table.iter().any(|b| b.position(&placement.fingerprint).is_some()));
    }

    /// Table access that, right before the first undo step, swaps out the
    /// newcomer for a foreign fingerprint and clears another slot of that
    /// bucket, as two concurrent writers would.
    struct Meddling {
        table: Vec<Bucket>,
        calls: usize,
        newcomer: Fingerprint,
        foreign: Fingerprint,
        cleared: Option<Fingerprint>,
    }

    impl BucketAccess for Meddling {
        fn with_bucket<R>(&mut self, index: usize, f: impl FnOnce(&mut Bucket) -> R) -> R {
            self.calls += 1;
            // one kick is a swap and a failed try_insert
            if self.calls == 3 {
                let bucket = &mut self.table[index];
                let slot = bucket.position(&self.newcomer).unwrap();
                bucket.0[slot] = Some(self.foreign);
                self.cleared = bucket.0[(slot + 1) % SLOTS_PER_BUCKET].take();
            }
            f(&mut self.table[index])
        }
    }

    #[test]
    fn kick_undo_stops_at_a_slot_changed_by_another_writer() {
        let hasher = PairHasher;
        let residents: Vec<Fingerprint> = (0..8)
            .map(|i| hasher.fingerprint(format!("resident_{i}").as_bytes()))
            .collect();
        let mut table = vec![Bucket::default(); 2];
        for (i, fingerprint) in residents.iter().enumerate() {
            table[i / SLOTS_PER_BUCKET].try_insert(*fingerprint);
        }
        let placement = Placement::of(&hasher, b"newcomer", 2);
        let mut access = Meddling {
            table,
            calls: 0,
            newcomer: placement.fingerprint,
            foreign: [0xEE; 16],
            cleared: None,
        };
        let params = KickParams {
            hasher: &hasher,
            num_buckets: 2,
            max_kicks: 1,
            verbose: false,
        };

        assert!(kick(&mut access, params, placement));
        let cleared = access.cleared.unwrap();
        let present = |fingerprint: &Fingerprint| {
            access.table.iter().any(|bucket| bucket.position(fingerprint).is_some())
        };
        // the foreign fingerprint stays, and the displaced resident found a home
        assert!(present(&[0xEE; 16]));
        for fingerprint in residents.iter().filter(|&&f| f != cleared) {
            assert!(present(fingerprint), "resident lost");
        }
        let occupied: usize = access.table.iter().map(Bucket::occupied).sum();
        assert_eq!(occupied, 8);
    }
}
