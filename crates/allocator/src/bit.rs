//! Fixed-chunk bitmap allocator.
//!
//! The managed range is cut into chunks of one size and every chunk owns one
//! bit in a [`BitArray`]. Allocation looks for a run of unset bits starting at
//! the bit of the previous grant, so sequential workloads scan forward
//! instead of from the beginning, and retries once from bit zero before
//! giving up. The worst case is two full scans of the bitmap.
//!
//! A second bitmap marks the first chunk of every grant so that
//! [`release`](Allocator::release) frees exactly the run that was handed out.

use alloc::vec::Vec;
use core::ops;

use bit_array::BitArray;
use snafu::ensure;

use crate::{
    AllocError, Allocator, InvalidAddressSnafu, InvalidAlignmentSnafu, InvalidSizeSnafu,
    OutOfMemorySnafu, Range,
};

/// Allocator handing out runs of fixed-size chunks.
pub struct BitAllocator<S = Vec<u8>> {
    base: usize,
    chunk_size: usize,
    used: BitArray<S>,
    heads: BitArray<S>,
    last_bit: usize,
}

impl BitAllocator<Vec<u8>> {
    /// Creates an allocator over `range` with bitmaps on the heap.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    #[must_use]
    pub fn new(range: Range, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must not be zero");
        let chunks = range.size / chunk_size;
        Self::with_storage(
            range,
            chunk_size,
            BitArray::new(chunks),
            BitArray::new(chunks),
        )
    }
}

impl<S> BitAllocator<S>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Creates an allocator over `range` using caller-provided bitmaps.
    ///
    /// Both bitmaps must hold one bit per chunk.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero or a bitmap has the wrong length.
    pub fn with_storage(
        range: Range,
        chunk_size: usize,
        used: BitArray<S>,
        heads: BitArray<S>,
    ) -> Self {
        assert!(chunk_size > 0, "chunk size must not be zero");
        let chunks = range.size / chunk_size;
        assert_eq!(used.len(), chunks, "used bitmap does not match range");
        assert_eq!(heads.len(), chunks, "head bitmap does not match range");
        Self {
            base: range.address,
            chunk_size,
            used,
            heads,
            last_bit: 0,
        }
    }

    /// Returns the first address managed by this allocator.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Returns the allocation granularity.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the number of chunks managed.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.used.len()
    }

    /// Returns whether the chunk containing `address` is in use.
    #[must_use]
    pub fn is_allocated(&self, address: usize) -> bool {
        address
            .checked_sub(self.base)
            .map(|offset| offset / self.chunk_size)
            .is_some_and(|bit| bit < self.used.len() && self.used.is_set(bit))
    }

    /// Returns whether a grant starts exactly at `address`.
    #[must_use]
    pub fn is_grant_start(&self, address: usize) -> bool {
        self.bit_of(address).is_ok_and(|bit| self.heads.is_set(bit))
    }

    /// Reserves the single chunk at `address`.
    pub fn allocate_at(&mut self, address: usize) -> Result<Range, AllocError> {
        self.allocate(Range::new(address, self.chunk_size, 0))
    }

    /// Turns the live grant `grant` into one grant per chunk, so that each
    /// chunk can be released on its own.
    pub fn split(&mut self, grant: Range) -> Result<(), AllocError> {
        let bit = self.bit_of(grant.address)?;
        let end = bit + grant.size.div_ceil(self.chunk_size);
        ensure!(
            self.heads.is_set(bit)
                && end <= self.used.len()
                && (bit + 1..end).all(|b| self.used.is_set(b) && !self.heads.is_set(b)),
            InvalidAddressSnafu {
                address: grant.address
            }
        );
        for b in bit + 1..end {
            self.heads.set(b, true);
        }
        Ok(())
    }

    /// Allocates searching only from bit `start` onwards.
    pub fn allocate_from(&mut self, request: Range, start: usize) -> Result<Range, AllocError> {
        let end = self.used.len();
        self.allocate_in(request, start.min(end)..end)
    }

    /// Allocates inside the chunk range `bits`.
    ///
    /// The search starts at the previous grant when it lies in `bits`, and
    /// wraps to `bits.start` once.
    pub(crate) fn allocate_in(
        &mut self,
        request: Range,
        bits: ops::Range<usize>,
    ) -> Result<Range, AllocError> {
        ensure!(request.size > 0, InvalidSizeSnafu { size: request.size });
        let boundary = self.boundary(request.alignment)?;
        let count = request.size.div_ceil(self.chunk_size);

        let bit = if request.address == 0 {
            let start = if bits.contains(&self.last_bit) {
                self.last_bit
            } else {
                bits.start
            };
            self.used
                .find_unset(count, start..bits.end, boundary)
                .or_else(|| self.used.find_unset(count, bits.clone(), boundary))
                .ok_or_else(|| OutOfMemorySnafu { size: request.size }.build())?
        } else {
            let bit = self.bit_of(request.address)?;
            ensure!(
                bit.checked_add(count).is_some_and(|end| end <= bits.end) && bit >= bits.start,
                InvalidAddressSnafu {
                    address: request.address
                }
            );
            ensure!(
                (bit..bit + count).all(|b| !self.used.is_set(b)),
                InvalidAddressSnafu {
                    address: request.address
                }
            );
            if request.alignment != 0 {
                ensure!(
                    request.address.is_multiple_of(request.alignment),
                    InvalidAlignmentSnafu {
                        alignment: request.alignment,
                        granularity: self.chunk_size,
                    }
                );
            }
            bit
        };

        self.used.set_range(bit..bit + count);
        self.heads.set(bit, true);
        self.last_bit = bit;

        let address = self.base + bit * self.chunk_size;
        log::trace!("bit allocator granted {address:#x} ({count} chunks)");
        Ok(Range::new(address, request.size, request.alignment))
    }

    /// Translates an alignment request to a bit boundary.
    fn boundary(&self, alignment: usize) -> Result<usize, AllocError> {
        if alignment == 0 {
            return Ok(1);
        }
        ensure!(
            alignment.is_multiple_of(self.chunk_size) && self.base.is_multiple_of(alignment),
            InvalidAlignmentSnafu {
                alignment,
                granularity: self.chunk_size,
            }
        );
        Ok(alignment / self.chunk_size)
    }

    /// Returns the bit of the chunk starting at `address`.
    fn bit_of(&self, address: usize) -> Result<usize, AllocError> {
        let offset = address
            .checked_sub(self.base)
            .filter(|offset| offset.is_multiple_of(self.chunk_size))
            .ok_or_else(|| InvalidAddressSnafu { address }.build())?;
        let bit = offset / self.chunk_size;
        ensure!(bit < self.used.len(), InvalidAddressSnafu { address });
        Ok(bit)
    }
}

impl<S> Allocator for BitAllocator<S>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
{
    fn size(&self) -> usize {
        self.used.len() * self.chunk_size
    }

    fn available(&self) -> usize {
        self.used.count(false) * self.chunk_size
    }

    /// A non-zero `request.address` reserves exactly that run.
    fn allocate(&mut self, request: Range) -> Result<Range, AllocError> {
        let end = self.used.len();
        self.allocate_in(request, 0..end)
    }

    fn release(&mut self, address: usize) -> Result<(), AllocError> {
        let bit = self.bit_of(address)?;
        ensure!(self.heads.is_set(bit), InvalidAddressSnafu { address });

        self.heads.unset(bit);
        self.used.unset(bit);
        let mut next = bit + 1;
        while next < self.used.len() && self.used.is_set(next) && !self.heads.is_set(next) {
            self.used.unset(next);
            next += 1;
        }
        log::trace!("bit allocator released {address:#x} ({} chunks)", next - bit);
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 32;
    const BASE: usize = 0x0010_0000;

    fn allocator(chunks: usize) -> BitAllocator {
        BitAllocator::new(Range::new(BASE, CHUNK * chunks, 4), CHUNK)
    }

    #[test]
    fn construct() {
        let ba = allocator(64);
        assert_eq!(ba.chunk_size(), CHUNK);
        assert_eq!(ba.base(), BASE);
        assert_eq!(ba.size(), CHUNK * 64);
        assert_eq!(ba.available(), CHUNK * 64);
        assert!(!ba.is_allocated(BASE));
    }

    #[test]
    fn allocate_chunks_in_order() {
        let mut ba = allocator(64);
        for i in 0..10 {
            let range = ba.allocate(Range::any(CHUNK, 0)).unwrap();
            assert_eq!(range.address, BASE + CHUNK * i);
            assert_eq!(range.size, CHUNK);
        }
        for i in 0..64 {
            assert_eq!(ba.is_allocated(BASE + CHUNK * i), i < 10);
        }
    }

    #[test]
    fn allocate_rounds_to_chunks() {
        let mut ba = allocator(256);
        let mut next = BASE;
        for size in 1..=CHUNK * 3 {
            let range = ba.allocate(Range::any(size, 0)).unwrap();
            assert_eq!(range.address, next);
            assert_eq!(range.size, size);
            next += size.div_ceil(CHUNK) * CHUNK;
        }
        assert_eq!(ba.available(), ba.size() - (next - BASE));
        assert!(ba.is_allocated(next - 1));
        assert!(!ba.is_allocated(next));
    }

    #[test]
    fn allocate_aligned() {
        let mut ba = BitAllocator::new(Range::new(CHUNK * 999, CHUNK * 64, 4), CHUNK);
        for size in 1..=10 {
            let range = ba.allocate(Range::any(size, 0)).unwrap();
            assert!(range.address.is_multiple_of(CHUNK));
        }
        for size in 1..=10 {
            let range = ba.allocate(Range::any(size, CHUNK * 3)).unwrap();
            assert!(range.address.is_multiple_of(CHUNK * 3));
        }
        let err = ba.allocate(Range::any(1, CHUNK + 1)).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAlignment { .. }));
    }

    #[test]
    fn alignment_needs_aligned_base() {
        let mut ba = BitAllocator::new(Range::new(BASE + CHUNK, CHUNK * 64, 4), CHUNK);
        let err = ba.allocate(Range::any(1, CHUNK * 2)).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAlignment { .. }));
    }

    #[test]
    fn allocate_from_start_bit() {
        let mut ba = allocator(64);
        let range = ba.allocate_from(Range::any(CHUNK, 0), 1).unwrap();
        assert_eq!(range.address, BASE + CHUNK);
        let range = ba.allocate_from(Range::any(CHUNK, 0), 2).unwrap();
        assert_eq!(range.address, BASE + CHUNK * 2);
        assert!(!ba.is_allocated(BASE));
    }

    #[test]
    fn split_grant_releases_per_chunk() {
        let mut ba = allocator(64);
        let grant = ba.allocate(Range::any(3 * CHUNK, 0)).unwrap();
        let after = ba.allocate(Range::any(CHUNK, 0)).unwrap();
        ba.split(grant).unwrap();
        assert!(ba.is_grant_start(grant.address + CHUNK));

        ba.release(grant.address + CHUNK).unwrap();
        assert!(ba.is_allocated(grant.address));
        assert!(!ba.is_allocated(grant.address + CHUNK));
        assert!(ba.is_allocated(grant.address + 2 * CHUNK));
        assert!(ba.is_allocated(after.address));

        // The run no longer covers the released chunk.
        let err = ba.split(grant).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAddress { .. }));
        let err = ba.split(Range::new(BASE + 10 * CHUNK, CHUNK, 0)).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAddress { .. }));
    }

    #[test]
    fn allocate_specific() {
        let mut ba = allocator(256);
        for i in 0..CHUNK {
            ba.allocate_at(BASE + CHUNK * i).unwrap();
        }
        for i in 0..256 {
            assert_eq!(ba.is_allocated(BASE + CHUNK * i), i < CHUNK);
        }

        let err = ba.allocate_at(BASE).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAddress { .. }));
        let err = ba.allocate_at(BASE + 1).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAddress { .. }));
        let err = ba.allocate_at(BASE + CHUNK * 256).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAddress { .. }));
    }

    #[test]
    fn exhaustion_tracks_available() {
        let mut ba = allocator(64);
        let mut count = 0;
        while ba.available() > 0 {
            assert_eq!(ba.available(), CHUNK * (64 - count));
            ba.allocate(Range::any(CHUNK, 0)).unwrap();
            count += 1;
        }
        assert_eq!(count, 64);
        let err = ba.allocate(Range::any(1, 0)).unwrap_err();
        assert!(err.is_out_of_memory());

        ba.release(BASE + CHUNK * 7).unwrap();
        assert_eq!(ba.available(), CHUNK);
        let range = ba.allocate(Range::any(1, 0)).unwrap();
        assert_eq!(range.address, BASE + CHUNK * 7);
    }

    #[test]
    fn search_wraps_once() {
        let mut ba = allocator(8);
        let first = ba.allocate(Range::any(CHUNK * 2, 0)).unwrap();
        let _second = ba.allocate(Range::any(CHUNK * 6, 0)).unwrap();
        ba.release(first.address).unwrap();
        let again = ba.allocate(Range::any(CHUNK * 2, 0)).unwrap();
        assert_eq!(again.address, first.address);
    }

    #[test]
    fn release_frees_whole_run() {
        let mut ba = allocator(16);
        let a = ba.allocate(Range::any(CHUNK * 3, 0)).unwrap();
        let b = ba.allocate(Range::any(CHUNK * 2, 0)).unwrap();
        assert_eq!(b.address, a.address + CHUNK * 3);

        ba.release(a.address).unwrap();
        assert!(!ba.is_allocated(a.address + CHUNK * 2));
        assert!(ba.is_allocated(b.address));
        assert_eq!(ba.available(), CHUNK * 14);
    }

    #[test]
    fn release_rejects_foreign_addresses() {
        let mut ba = allocator(16);
        let a = ba.allocate(Range::any(CHUNK * 3, 0)).unwrap();

        for address in [a.address + CHUNK, a.address + 1, BASE - CHUNK, BASE + CHUNK * 16] {
            let err = ba.release(address).unwrap_err();
            assert!(matches!(err, AllocError::InvalidAddress { .. }), "{address:#x}");
        }

        ba.release(a.address).unwrap();
        let err = ba.release(a.address).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAddress { .. }));
    }

    #[test]
    fn grants_never_overlap() {
        let mut ba = allocator(128);
        let mut live: Vec<Range> = Vec::new();
        let mut seed = 0x2545_f491_u32;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let release = seed % 3 == 0 && !live.is_empty();
            if release {
                let index = (seed as usize / 3) % live.len();
                let range = live.swap_remove(index);
                ba.release(range.address).unwrap();
            } else if let Ok(range) = ba.allocate(Range::any((seed % 200) as usize + 1, 0)) {
                live.push(range);
            }
            for (i, a) in live.iter().enumerate() {
                for b in &live[i + 1..] {
                    assert!(a.end() <= b.address || b.end() <= a.address);
                }
            }
        }
    }

    #[test]
    fn zero_size_is_invalid() {
        let mut ba = allocator(4);
        let err = ba.allocate(Range::any(0, 0)).unwrap_err();
        assert!(matches!(err, AllocError::InvalidSize { .. }));
    }
}
