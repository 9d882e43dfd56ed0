use core::ops;

use platform_cast::CastFrom as _;

use crate::{DIR_SHIFT, TABLE_SPAN, VirtAddr};

/// Fixed regions of every virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    KernelData,
    /// Local and remote page table windows.
    PageTables,
    KernelPrivate,
    KernelStack,
    KernelHeap,
    UserData,
    UserPrivate,
    UserHeap,
    UserStack,
    UserShared,
}

const MIB: u32 = 1 << 20;

impl Region {
    pub const ALL: [Self; 10] = [
        Self::KernelData,
        Self::PageTables,
        Self::KernelPrivate,
        Self::KernelStack,
        Self::KernelHeap,
        Self::UserData,
        Self::UserPrivate,
        Self::UserHeap,
        Self::UserStack,
        Self::UserShared,
    ];

    /// Regions whose tables every address space shares with the kernel.
    pub const KERNEL: [Self; 4] = [
        Self::KernelData,
        Self::KernelPrivate,
        Self::KernelStack,
        Self::KernelHeap,
    ];

    const fn bounds(self) -> (u32, u32) {
        match self {
            Self::KernelData => (0x0000_0000, 4 * MIB),
            Self::PageTables => (0x0040_0000, 64 * MIB),
            Self::KernelPrivate => (0x0440_0000, 64 * MIB),
            Self::KernelStack => (0x0840_0000, 4 * MIB),
            Self::KernelHeap => (0x0880_0000, 64 * MIB),
            Self::UserData => (0x8000_0000, 256 * MIB),
            Self::UserPrivate => (0xa000_0000, 256 * MIB),
            Self::UserHeap => (0xb000_0000, 256 * MIB),
            Self::UserStack => (0xc000_0000, 4 * MIB),
            Self::UserShared => (0xd000_0000, 256 * MIB),
        }
    }

    #[must_use]
    pub const fn base(self) -> VirtAddr {
        VirtAddr::new(self.bounds().0)
    }

    #[must_use]
    pub fn size(self) -> usize {
        usize::cast_from(self.bounds().1)
    }

    /// First address past the region. Every region ends below 4 GiB, but the
    /// result is a `usize` so that it can be compared without wrapping.
    #[must_use]
    pub fn end(self) -> usize {
        self.base().as_usize() + self.size()
    }

    #[must_use]
    pub fn contains(self, virt: VirtAddr) -> bool {
        (self.base().as_usize()..self.end()).contains(&virt.as_usize())
    }

    /// Directory slots whose tables cover the region.
    #[must_use]
    pub fn dir_slots(self) -> ops::Range<usize> {
        let (base, size) = self.bounds();
        let first = usize::cast_from(base >> DIR_SHIFT);
        first..first + usize::cast_from(size >> DIR_SHIFT)
    }
}

const fn regions_are_well_formed() -> bool {
    let mut i = 0;
    while i < Region::ALL.len() {
        let (base, size) = Region::ALL[i].bounds();
        #[expect(clippy::cast_possible_truncation)]
        let span = TABLE_SPAN as u32;
        if base % span != 0 || size % span != 0 || base.checked_add(size).is_none() {
            return false;
        }
        if i > 0 {
            let (prev_base, prev_size) = Region::ALL[i - 1].bounds();
            if prev_base + prev_size > base {
                return false;
            }
        }
        i += 1;
    }
    true
}

const _: () = assert!(regions_are_well_formed());
