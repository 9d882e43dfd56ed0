//! Memory allocators for the kernel memory manager.
//!
//! Every allocator in this crate implements the [`Allocator`] contract: it
//! owns a fixed backing [`Range`], grants sub-ranges from it and takes them
//! back by address. Allocation either reserves the whole request or nothing.
//!
//! # Available Allocators
//!
//! ## [`BitAllocator`](bit::BitAllocator)
//!
//! Fixed-chunk allocator over a bitmap. One bit per chunk, contiguous runs
//! found with a forward scan from the last grant that wraps around once.
//!
//! ## [`BubbleAllocator`](bubble::BubbleAllocator)
//!
//! Monotonic bump allocator that never frees. Used for memory that lives as
//! long as the system, such as early boot tables.
//!
//! ## [`SplitAllocator`](split::SplitAllocator)
//!
//! Physical frame allocator over a "low" and a "high" region. Low memory is
//! reachable through a fixed virtual offset; see
//! [`to_virtual`](PhysicalAllocator::to_virtual).
//!
//! ## [`PoolAllocator`](pool::PoolAllocator)
//!
//! Power-of-two size classes, each backed by a chain of pools obtained from a
//! parent allocator. Objects can be bracketed by signatures to detect heap
//! corruption and double frees.
//!
//! # Composition
//!
//! Allocators are stacked by composition. The kernel builds the chain once
//! and hands references to the components that need memory:
//!
//! ```rust
//! use allocator::{
//!     Allocator as _, PhysicalAllocator as _, Range,
//!     heap::Heap,
//!     split::{LowMemory, SplitAllocator},
//! };
//!
//! let mut memory = vec![0u64; 64 * 4096 / 8];
//! let virt_base = memory.as_mut_ptr().expose_provenance();
//!
//! let physical = spin::Mutex::new(SplitAllocator::new(
//!     Range::new(0x10_0000, 32 * 4096, 0),
//!     Range::new(0x12_0000, 32 * 4096, 0),
//!     4096,
//!     virt_base,
//! ));
//! let heap = Heap::new(LowMemory::new(&physical));
//!
//! let object = heap.lock().allocate(Range::any(100, 0)).unwrap();
//! assert_eq!(object.size, 100);
//! heap.lock().release(object.address).unwrap();
//!
//! // The same physical allocator keeps serving page frames.
//! let frame = (&physical).allocate_high(Range::any(4096, 0)).unwrap();
//! assert!(frame.address >= 0x12_0000);
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use snafu::Snafu;
use snafu_utils::{Located, Location};

pub mod bit;
pub mod bubble;
pub mod heap;
pub mod pool;
pub mod split;

/// Address range requested from or granted by an allocator.
///
/// An `address` of zero in a request means "anywhere". An `alignment` of
/// zero means the allocator's own granularity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub address: usize,
    pub size: usize,
    pub alignment: usize,
}

impl Range {
    #[must_use]
    pub const fn new(address: usize, size: usize, alignment: usize) -> Self {
        Self {
            address,
            size,
            alignment,
        }
    }

    /// Creates a request for `size` bytes at any address.
    #[must_use]
    pub const fn any(size: usize, alignment: usize) -> Self {
        Self::new(0, size, alignment)
    }

    /// Returns the first address past the range.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.address.saturating_add(self.size)
    }

    #[must_use]
    pub const fn contains(&self, address: usize) -> bool {
        self.address <= address && address < self.end()
    }
}

/// Errors returned by allocators.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AllocError {
    #[snafu(display("address {address:#x} is not allocated by this allocator"))]
    InvalidAddress {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid allocation size {size:#x}"))]
    InvalidSize {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("alignment {alignment:#x} does not fit granularity {granularity:#x}"))]
    InvalidAlignment {
        alignment: usize,
        granularity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("out of memory allocating {size:#x} bytes"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("object {address:#x} released twice"))]
    DoubleFree {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("corrupted object {address:#x} in pool {pool:#x}"))]
    Corrupted {
        address: usize,
        pool: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns `true` for the recoverable out-of-memory condition.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

impl Located for AllocError {
    fn location(&self) -> Location {
        match self {
            Self::InvalidAddress { location, .. }
            | Self::InvalidSize { location, .. }
            | Self::InvalidAlignment { location, .. }
            | Self::OutOfMemory { location, .. }
            | Self::DoubleFree { location, .. }
            | Self::Corrupted { location, .. } => *location,
        }
    }
}

/// Common contract of every allocator.
pub trait Allocator {
    /// Returns the total number of bytes managed.
    fn size(&self) -> usize;

    /// Returns the number of bytes that can still be granted.
    fn available(&self) -> usize;

    /// Reserves memory for `request`.
    ///
    /// On success the granted range is returned. The granted address is
    /// aligned to the requested alignment and never overlaps another live
    /// grant of the same allocator.
    fn allocate(&mut self, request: Range) -> Result<Range, AllocError>;

    /// Returns the grant starting at `address`.
    fn release(&mut self, address: usize) -> Result<(), AllocError>;
}

impl<A> Allocator for &mut A
where
    A: Allocator + ?Sized,
{
    fn size(&self) -> usize {
        (**self).size()
    }

    fn available(&self) -> usize {
        (**self).available()
    }

    fn allocate(&mut self, request: Range) -> Result<Range, AllocError> {
        (**self).allocate(request)
    }

    fn release(&mut self, address: usize) -> Result<(), AllocError> {
        (**self).release(address)
    }
}

/// An allocator shared between cores through a spin lock.
impl<A> Allocator for &spin::Mutex<A>
where
    A: Allocator,
{
    fn size(&self) -> usize {
        self.lock().size()
    }

    fn available(&self) -> usize {
        self.lock().available()
    }

    fn allocate(&mut self, request: Range) -> Result<Range, AllocError> {
        self.lock().allocate(request)
    }

    fn release(&mut self, address: usize) -> Result<(), AllocError> {
        self.lock().release(address)
    }
}

/// Allocator of physical page frames.
///
/// Low memory is permanently mapped at a fixed virtual offset, so frames
/// taken from it can be read and written without touching the page tables.
pub trait PhysicalAllocator: Allocator {
    /// Allocates from low memory only.
    fn allocate_low(&mut self, request: Range) -> Result<Range, AllocError>;

    /// Allocates from high memory only.
    fn allocate_high(&mut self, request: Range) -> Result<Range, AllocError>;

    /// Allocates contiguous frames that are released one frame at a time.
    fn allocate_frames(&mut self, request: Range) -> Result<Range, AllocError>;

    /// Translates a low-memory physical address to its virtual address.
    fn to_virtual(&self, phys: usize) -> usize;

    /// Translates a virtual address of low memory back to its physical
    /// address.
    fn to_physical(&self, virt: usize) -> usize;
}

impl<A> PhysicalAllocator for &mut A
where
    A: PhysicalAllocator + ?Sized,
{
    fn allocate_low(&mut self, request: Range) -> Result<Range, AllocError> {
        (**self).allocate_low(request)
    }

    fn allocate_high(&mut self, request: Range) -> Result<Range, AllocError> {
        (**self).allocate_high(request)
    }

    fn allocate_frames(&mut self, request: Range) -> Result<Range, AllocError> {
        (**self).allocate_frames(request)
    }

    fn to_virtual(&self, phys: usize) -> usize {
        (**self).to_virtual(phys)
    }

    fn to_physical(&self, virt: usize) -> usize {
        (**self).to_physical(virt)
    }
}

impl<A> PhysicalAllocator for &spin::Mutex<A>
where
    A: PhysicalAllocator,
{
    fn allocate_low(&mut self, request: Range) -> Result<Range, AllocError> {
        self.lock().allocate_low(request)
    }

    fn allocate_high(&mut self, request: Range) -> Result<Range, AllocError> {
        self.lock().allocate_high(request)
    }

    fn allocate_frames(&mut self, request: Range) -> Result<Range, AllocError> {
        self.lock().allocate_frames(request)
    }

    fn to_virtual(&self, phys: usize) -> usize {
        self.lock().to_virtual(phys)
    }

    fn to_physical(&self, virt: usize) -> usize {
        self.lock().to_physical(virt)
    }
}
