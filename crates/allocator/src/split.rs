//! Physical memory allocator split into low and high memory.
//!
//! Low memory is the part of physical memory the kernel keeps permanently
//! mapped at a constant virtual offset. Structures the kernel must reach
//! without creating a mapping first (page tables, pool headers) come from
//! there. High memory is only reachable after it has been mapped.
//!
//! Both regions share one [`BitAllocator`] with page-sized chunks. The low
//! region occupies the first bits, the high region the rest.

use alloc::vec::Vec;

use snafu::ensure;

use crate::{
    AllocError, Allocator, InvalidAddressSnafu, PhysicalAllocator, Range, bit::BitAllocator,
};

/// Page frame allocator over contiguous low and high physical memory.
pub struct SplitAllocator<S = Vec<u8>> {
    frames: BitAllocator<S>,
    low: Range,
    high: Range,
    low_pages: usize,
    virt_base: usize,
}

impl SplitAllocator<Vec<u8>> {
    /// Creates an allocator over `low` followed by `high`.
    ///
    /// `virt_base` is the virtual address at which `low.address` is mapped.
    ///
    /// # Panics
    ///
    /// Panics if `high` does not start where `low` ends, or if either region
    /// is not a whole number of pages.
    #[must_use]
    pub fn new(low: Range, high: Range, page_size: usize, virt_base: usize) -> Self {
        assert!(page_size > 0, "page size must not be zero");
        assert!(
            low.size.is_multiple_of(page_size) && high.size.is_multiple_of(page_size),
            "regions must be a whole number of pages"
        );
        assert!(
            high.size == 0 || high.address == low.end(),
            "high memory {:#x} does not follow low memory {:#x}",
            high.address,
            low.end()
        );

        let frames = BitAllocator::new(Range::new(low.address, low.size + high.size, 0), page_size);
        Self {
            frames,
            low: Range::new(low.address, low.size, page_size),
            high: Range::new(low.end(), high.size, page_size),
            low_pages: low.size / page_size,
            virt_base,
        }
    }
}

impl<S> SplitAllocator<S>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
{
    /// Returns the low memory region.
    #[must_use]
    pub fn low(&self) -> Range {
        self.low
    }

    /// Returns the high memory region.
    #[must_use]
    pub fn high(&self) -> Range {
        self.high
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.frames.chunk_size()
    }

    /// Returns whether the frame containing `address` is in use.
    #[must_use]
    pub fn is_allocated(&self, address: usize) -> bool {
        self.frames.is_allocated(address)
    }

    /// Reserves the single frame at `address`.
    pub fn allocate_at(&mut self, address: usize) -> Result<Range, AllocError> {
        self.frames.allocate_at(address)
    }

    /// Marks every frame overlapping `range` as used.
    ///
    /// This is how boot code excludes memory that is already occupied, such
    /// as the kernel image. The reservation is one grant that can be
    /// released at its first frame.
    pub fn reserve(&mut self, range: Range) -> Result<Range, AllocError> {
        let page = self.page_size();
        let start = range.address - range.address % page;
        ensure!(
            range.size > 0 && range.end() > start,
            InvalidAddressSnafu {
                address: range.address
            }
        );
        let end = range
            .end()
            .checked_next_multiple_of(page)
            .ok_or_else(|| {
                InvalidAddressSnafu {
                    address: range.address,
                }
                .build()
            })?;
        let size = end - start;
        log::debug!("reserving physical {start:#x}..{:#x}", start + size);
        self.frames.allocate(Range::new(start, size, 0))
    }
}

impl<S> Allocator for SplitAllocator<S>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
{
    fn size(&self) -> usize {
        self.frames.size()
    }

    fn available(&self) -> usize {
        self.frames.available()
    }

    fn allocate(&mut self, request: Range) -> Result<Range, AllocError> {
        self.frames.allocate(request)
    }

    fn release(&mut self, address: usize) -> Result<(), AllocError> {
        self.frames.release(address)
    }
}

impl<S> PhysicalAllocator for SplitAllocator<S>
where
    S: AsRef<[u8]> + AsMut<[u8]>,
{
    fn allocate_low(&mut self, request: Range) -> Result<Range, AllocError> {
        let pages = self.low_pages;
        self.frames.allocate_in(request, 0..pages)
    }

    fn allocate_high(&mut self, request: Range) -> Result<Range, AllocError> {
        let pages = self.low_pages..self.frames.chunk_count();
        self.frames.allocate_in(request, pages)
    }

    fn allocate_frames(&mut self, request: Range) -> Result<Range, AllocError> {
        let granted = self.frames.allocate(request)?;
        self.frames.split(granted)?;
        Ok(granted)
    }

    fn to_virtual(&self, phys: usize) -> usize {
        phys.wrapping_sub(self.low.address).wrapping_add(self.virt_base)
    }

    fn to_physical(&self, virt: usize) -> usize {
        virt.wrapping_sub(self.virt_base).wrapping_add(self.low.address)
    }
}

/// Allocator view of low memory that speaks virtual addresses.
///
/// Grants are taken from low memory of the wrapped physical allocator and
/// returned as their virtual addresses, which makes this a suitable parent
/// for a [`PoolAllocator`](crate::pool::PoolAllocator).
#[derive(Debug)]
pub struct LowMemory<P> {
    physical: P,
}

impl<P> LowMemory<P> {
    pub fn new(physical: P) -> Self {
        Self { physical }
    }

    pub fn into_inner(self) -> P {
        self.physical
    }
}

impl<P> Allocator for LowMemory<P>
where
    P: PhysicalAllocator,
{
    fn size(&self) -> usize {
        self.physical.size()
    }

    fn available(&self) -> usize {
        self.physical.available()
    }

    fn allocate(&mut self, mut request: Range) -> Result<Range, AllocError> {
        if request.address != 0 {
            request.address = self.physical.to_physical(request.address);
        }
        let mut granted = self.physical.allocate_low(request)?;
        granted.address = self.physical.to_virtual(granted.address);
        Ok(granted)
    }

    fn release(&mut self, address: usize) -> Result<(), AllocError> {
        let phys = self.physical.to_physical(address);
        self.physical.release(phys)
    }
}
