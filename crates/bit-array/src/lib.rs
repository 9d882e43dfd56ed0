//! Packed bit vector with contiguous-run search.
//!
//! A [`BitArray`] stores one flag per bit, where a set bit means "used". It
//! keeps a running count of set bits so usage queries do not rescan the
//! storage, and it can search for the first run of unset bits that starts on
//! a given bit boundary.
//!
//! The storage is generic: the default is an owned `Vec<u8>`, but any
//! `AsRef<[u8]> + AsMut<[u8]>` works, which lets allocators keep their
//! bitmaps inside the memory they manage.
//!
//! ```rust
//! use bit_array::BitArray;
//!
//! let mut bits = BitArray::new(64);
//! bits.set_range(0..4);
//! assert_eq!(bits.count(true), 4);
//!
//! // First free run of 8 bits starting on a multiple of 8.
//! assert_eq!(bits.find_unset(8, 0..64, 8), Some(8));
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::{vec, vec::Vec};
use core::{fmt, ops::Range};

/// Returns the number of bytes needed to store `bit_count` bits.
#[must_use]
pub const fn storage_size(bit_count: usize) -> usize {
    bit_count.div_ceil(8)
}

/// Fixed-length array of bits.
pub struct BitArray<S = Vec<u8>> {
    bits: usize,
    set: usize,
    storage: S,
}

impl BitArray<Vec<u8>> {
    /// Creates an array of `bit_count` unset bits backed by a new vector.
    #[must_use]
    pub fn new(bit_count: usize) -> Self {
        Self {
            bits: bit_count,
            set: 0,
            storage: vec![0; storage_size(bit_count)],
        }
    }
}

impl<S> BitArray<S>
where
    S: AsRef<[u8]>,
{
    /// Returns the number of bits in the array.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits
    }

    /// Returns `true` if the array holds no bits at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Returns the number of bits equal to `value`.
    #[must_use]
    pub fn count(&self, value: bool) -> usize {
        if value { self.set } else { self.bits - self.set }
    }

    /// Returns whether the bit at `bit` is set.
    ///
    /// # Panics
    ///
    /// Panics if `bit` is out of range.
    #[must_use]
    pub fn is_set(&self, bit: usize) -> bool {
        assert!(bit < self.bits, "bit {bit} out of range {}", self.bits);
        self.storage.as_ref()[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Returns the raw storage bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage.as_ref()[..storage_size(self.bits)]
    }

    /// Finds the first run of `count` unset bits inside `range` whose first
    /// bit is a multiple of `boundary`.
    ///
    /// The search does not wrap: it fails if no run fits before
    /// `range.end`. A `boundary` of zero is treated as one.
    ///
    /// # Panics
    ///
    /// Panics if `range.end` is past the end of the array.
    #[must_use]
    pub fn find_unset(&self, count: usize, range: Range<usize>, boundary: usize) -> Option<usize> {
        assert!(range.end <= self.bits, "range {range:?} out of {}", self.bits);
        let boundary = boundary.max(1);
        if count == 0 {
            return None;
        }

        let mut candidate = range.start.next_multiple_of(boundary);
        'search: while candidate
            .checked_add(count)
            .is_some_and(|end| end <= range.end)
        {
            let bytes = self.storage.as_ref();
            let mut bit = candidate;
            while bit < candidate + count {
                // Skip whole bytes that are fully used.
                if bit % 8 == 0 && bytes[bit / 8] == 0xff {
                    candidate = (bit + 8).next_multiple_of(boundary);
                    continue 'search;
                }
                if self.is_set(bit) {
                    candidate = (bit + 1).next_multiple_of(boundary);
                    continue 'search;
                }
                bit += 1;
            }
            return Some(candidate);
        }
        None
    }
}

impl<S> BitArray<S>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Creates an array of `bit_count` unset bits over caller-supplied
    /// storage.
    ///
    /// The storage is cleared.
    ///
    /// # Panics
    ///
    /// Panics if `storage` is shorter than [`storage_size`]`(bit_count)`.
    pub fn with_storage(bit_count: usize, mut storage: S) -> Self {
        let needed = storage_size(bit_count);
        let bytes = storage.as_mut();
        assert!(
            bytes.len() >= needed,
            "storage of {} bytes cannot hold {bit_count} bits",
            bytes.len()
        );
        bytes[..needed].fill(0);
        Self {
            bits: bit_count,
            set: 0,
            storage,
        }
    }

    /// Sets or clears the bit at `bit`.
    ///
    /// # Panics
    ///
    /// Panics if `bit` is out of range.
    pub fn set(&mut self, bit: usize, value: bool) {
        let was = self.is_set(bit);
        let byte = &mut self.storage.as_mut()[bit / 8];
        let mask = 1 << (bit % 8);
        match (was, value) {
            (false, true) => {
                *byte |= mask;
                self.set += 1;
            }
            (true, false) => {
                *byte &= !mask;
                self.set -= 1;
            }
            _ => {}
        }
    }

    /// Clears the bit at `bit`.
    pub fn unset(&mut self, bit: usize) {
        self.set(bit, false);
    }

    /// Sets every bit in `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` extends past the end of the array.
    pub fn set_range(&mut self, range: Range<usize>) {
        assert!(range.end <= self.bits, "range {range:?} out of {}", self.bits);
        for bit in range {
            self.set(bit, true);
        }
    }

    /// Clears every bit in `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` extends past the end of the array.
    pub fn unset_range(&mut self, range: Range<usize>) {
        assert!(range.end <= self.bits, "range {range:?} out of {}", self.bits);
        for bit in range {
            self.set(bit, false);
        }
    }

    /// Finds a run of `count` unset bits at or after `start` on a multiple
    /// of `boundary`, marks it used and returns its first bit.
    pub fn set_next(&mut self, count: usize, start: usize, boundary: usize) -> Option<usize> {
        let bit = self.find_unset(count, start.min(self.bits)..self.bits, boundary)?;
        self.set_range(bit..bit + count);
        Some(bit)
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        let len = storage_size(self.bits);
        self.storage.as_mut()[..len].fill(0);
        self.set = 0;
    }
}

impl<S> fmt::Debug for BitArray<S>
where
    S: AsRef<[u8]>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitArray")
            .field("len", &self.bits)
            .field("set", &self.set)
            .finish_non_exhaustive()
    }
}
