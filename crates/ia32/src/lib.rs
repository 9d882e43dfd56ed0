//! Two-level IA-32 paging for the kernel memory manager.
//!
//! A [`Paging`] context edits the page directory of the running address
//! space (the *local* view) and, through a reserved window, the directory of
//! one other address space at a time (the *remote* view). Page table frames
//! come from low memory of a [`PhysicalAllocator`](allocator::PhysicalAllocator),
//! so they are reachable without mapping them first.
//!
//! ```rust
//! use allocator::{PhysicalAllocator as _, Range, split::SplitAllocator};
//! use ia32::{Access, Paging, SoftTlb, VirtAddr};
//!
//! #[repr(C, align(4096))]
//! struct Frame([u8; 4096]);
//!
//! let mut memory: Vec<Frame> = (0..16).map(|_| Frame([0; 4096])).collect();
//! let mut physical = SplitAllocator::new(
//!     Range::new(0x10_0000, 8 * 4096, 0),
//!     Range::new(0x10_8000, 8 * 4096, 0),
//!     4096,
//!     memory.as_mut_ptr().expose_provenance(),
//! );
//! let frame = physical.allocate_high(Range::any(4096, 0)).unwrap();
//!
//! let mut paging = Paging::bootstrap(&mut physical, SoftTlb::new()).unwrap();
//! let frame = ia32::PhysAddr::from_usize(frame.address).unwrap();
//! let virt = paging
//!     .map(frame, None, Access::PRESENT | Access::RW)
//!     .unwrap();
//! assert_eq!(paging.lookup(virt), Some(frame));
//! assert!(paging.access(virt, 4096, Access::WRITABLE));
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use allocator::AllocError;
use bitflags::bitflags;
use snafu::Snafu;
use snafu_utils::{Located, Location};

pub use self::{
    address::{PhysAddr, VirtAddr},
    paging::{Paging, Remote},
    region::Region,
    tlb::{SoftTlb, Tlb, TlbFlush},
};

#[cfg(target_arch = "x86")]
pub use self::tlb::HardwareTlb;

mod address;
mod entry;
mod paging;
mod region;
mod table;
mod tlb;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
pub const DIR_SHIFT: usize = 22;

/// Number of entries in a page directory or page table.
pub const ENTRY_COUNT: usize = 1024;

/// Bytes of virtual memory covered by one page table.
pub const TABLE_SPAN: usize = 1 << DIR_SHIFT;

/// Mask selecting the frame address of an entry.
pub const FRAME_MASK: u32 = 0xffff_f000;

/// Window through which the tables of the running address space appear.
pub const PAGE_TABLES_LOCAL: VirtAddr = VirtAddr::new(0x0040_0000);

/// Window through which the tables of the remote address space appear.
pub const PAGE_TABLES_REMOTE: VirtAddr = VirtAddr::new(0x0080_0000);

const _: () = assert!(PAGE_SIZE == ENTRY_COUNT * 4);
const _: () = assert!(TABLE_SPAN == ENTRY_COUNT * PAGE_SIZE);

bitflags! {
    /// Page access rights and bookkeeping markers.
    ///
    /// `READABLE` has no hardware bit: every present page is readable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const PRESENT = 1 << 0;
        const READABLE = 1 << 1;
        const WRITABLE = 1 << 2;
        const USER = 1 << 3;

        /// Never released by bulk release.
        const PINNED = 1 << 4;

        /// Free for use by the kernel.
        const MARKED = 1 << 5;

        /// Reserved for the kernel's own bookkeeping.
        const RESERVED = 1 << 6;

        const RW = Self::READABLE.bits() | Self::WRITABLE.bits();
        const URW = Self::USER.bits() | Self::RW.bits();
    }
}

/// Errors that can occur during paging operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PagingError {
    #[snafu(display("failed to allocate page table for {virt:#x}"))]
    AllocPageTable {
        virt: VirtAddr,
        source: AllocError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate {size:#x} bytes of page frames"))]
    AllocFrames {
        size: usize,
        source: AllocError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate page directory"))]
    AllocDirectory {
        source: AllocError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to release frame {phys:#x}"))]
    ReleaseFrame {
        phys: PhysAddr,
        source: AllocError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{virt:#x} lies in the page table window"))]
    ReservedAddress {
        virt: VirtAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{size:#x} bytes at {virt:#x} do not fit in the address space"))]
    InvalidRange {
        virt: VirtAddr,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{virt:#x} is not mapped"))]
    NotMapped {
        virt: VirtAddr,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free range of {size:#x} bytes in {region:?}"))]
    NoFreeRange {
        size: usize,
        region: Region,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address space {directory:#x} is the running one"))]
    ActiveAddressSpace {
        directory: PhysAddr,
        #[snafu(implicit)]
        location: Location,
    },
}

impl PagingError {
    /// Returns `true` if the operation failed for lack of physical memory.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::AllocPageTable { source, .. }
            | Self::AllocFrames { source, .. }
            | Self::AllocDirectory { source, .. } => source.is_out_of_memory(),
            _ => false,
        }
    }
}

impl Located for PagingError {
    fn location(&self) -> Location {
        match self {
            Self::AllocPageTable { location, .. }
            | Self::AllocFrames { location, .. }
            | Self::AllocDirectory { location, .. }
            | Self::ReleaseFrame { location, .. }
            | Self::ReservedAddress { location, .. }
            | Self::InvalidRange { location, .. }
            | Self::NotMapped { location, .. }
            | Self::NoFreeRange { location, .. }
            | Self::ActiveAddressSpace { location, .. } => *location,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use allocator::OutOfMemorySnafu;
    use snafu::IntoError as _;
    use snafu_utils::Report;

    use super::*;

    #[test]
    fn out_of_memory_is_recoverable() {
        let err = AllocPageTableSnafu {
            virt: VirtAddr::new(0x1000),
        }
        .into_error(OutOfMemorySnafu { size: PAGE_SIZE }.build());
        assert!(err.is_out_of_memory());
        assert_eq!(err.location().file(), file!());

        let err = NotMappedSnafu {
            virt: VirtAddr::new(0x1000),
        }
        .build();
        assert!(!err.is_out_of_memory());
    }

    #[test]
    fn report_includes_allocator_cause() {
        let err = AllocDirectorySnafu.into_error(OutOfMemorySnafu { size: PAGE_SIZE }.build());
        let report = format!("{}", Report::new(err));
        assert!(report.starts_with("Error: failed to allocate page directory\n"));
        assert!(report.contains("out of memory allocating 0x1000 bytes"));
    }
}
