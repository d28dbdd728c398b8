//! One-word tagged pointer: reference + 16-bit counter + 1-bit mark.
//!
//! ## Encoding
//! - **Bits 48-63**: counter (0..=65535)
//! - **Bits 1-47**: reference address (user-space addresses fit in 48 bits,
//!   and records are at least 2-byte aligned so bit 0 is always free)
//! - **Bit 0**: relocation mark
//!
//! This is the only place that performs bit arithmetic on slot words; the
//! lock-free table stores the raw bits in an `AtomicU64` and converts through
//! [`TaggedPointer::from_bits`] / [`TaggedPointer::into_bits`].

use std::fmt;
use std::marker::PhantomData;
use std::ptr;

const COUNTER_SHIFT: u32 = 48;
const COUNTER_MASK: u64 = 0xFFFF_0000_0000_0000;
const REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFE;
const MARK_MASK: u64 = 0x1;

/// Largest counter value a tagged pointer can hold.
pub const MAX_COUNTER: u32 = u16::MAX as u32;

/// A reference to a `T` packed together with a counter and a mark.
///
/// All constructors are pure: `with_*` return a new value and leave the
/// operand untouched. Supplying a counter above [`MAX_COUNTER`] or a
/// reference that cannot be encoded is a fatal invariant violation and
/// panics; nothing is ever silently truncated.
pub struct TaggedPointer<T> {
    bits: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> TaggedPointer<T> {
    /// The empty word: null reference, counter 0, unmarked.
    pub const fn null() -> Self {
        Self::from_bits(0)
    }

    /// Pack `counter`, `reference` and `mark` into one word.
    pub fn create(counter: u32, reference: *mut T, mark: bool) -> Self {
        Self::from_bits(encode_counter(counter) | encode_reference(reference) | u64::from(mark))
    }

    /// Reinterpret raw bits previously produced by [`into_bits`](Self::into_bits).
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    /// Raw encoded word.
    pub const fn into_bits(self) -> u64 {
        self.bits
    }

    /// Counter field.
    pub const fn counter(self) -> u16 {
        ((self.bits & COUNTER_MASK) >> COUNTER_SHIFT) as u16
    }

    /// Reference field.
    pub fn reference(self) -> *mut T {
        ptr::with_exposed_provenance_mut((self.bits & REFERENCE_MASK) as usize)
    }

    /// Mark field.
    pub const fn is_marked(self) -> bool {
        self.bits & MARK_MASK != 0
    }

    /// True when the reference field is null, whatever the counter and mark.
    pub const fn is_null(self) -> bool {
        self.bits & REFERENCE_MASK == 0
    }

    /// Same reference and mark, new counter.
    pub fn with_counter(self, counter: u32) -> Self {
        Self::from_bits((self.bits & !COUNTER_MASK) | encode_counter(counter))
    }

    /// Same counter and mark, new reference.
    pub fn with_reference(self, reference: *mut T) -> Self {
        Self::from_bits((self.bits & !REFERENCE_MASK) | encode_reference(reference))
    }

    /// Same counter and reference, new mark.
    pub const fn with_mark(self, mark: bool) -> Self {
        Self::from_bits((self.bits & !MARK_MASK) | mark as u64)
    }

    /// The counter this word's successor should carry.
    pub fn next_counter(self) -> u32 {
        u32::from(self.counter()) + 1
    }
}

fn encode_counter(counter: u32) -> u64 {
    assert!(
        counter <= MAX_COUNTER,
        "tagged pointer counter {counter} exceeds the 16-bit range"
    );
    u64::from(counter) << COUNTER_SHIFT
}

fn encode_reference<T>(reference: *mut T) -> u64 {
    let address = reference.expose_provenance() as u64;
    assert!(
        address & !REFERENCE_MASK == 0,
        "reference {address:#x} cannot be packed into a tagged pointer"
    );
    address
}

impl<T> Clone for TaggedPointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TaggedPointer<T> {}

impl<T> PartialEq for TaggedPointer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Eq for TaggedPointer<T> {}

impl<T> Default for TaggedPointer<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for TaggedPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedPointer")
            .field("counter", &self.counter())
            .field("reference", &self.reference())
            .field("marked", &self.is_marked())
            .finish()
    }
}
