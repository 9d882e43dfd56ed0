use core::{fmt, ptr};

use platform_cast::CastFrom as _;

use crate::{DIR_SHIFT, ENTRY_COUNT, FRAME_MASK, PAGE_SHIFT, PAGE_SIZE};

macro_rules! impl_hex {
    ($ty:ty) => {
        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl fmt::UpperHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::UpperHex::fmt(&self.0, f)
            }
        }

        impl fmt::Pointer for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let ptr = &ptr::without_provenance::<u8>(usize::cast_from(self.0));
                fmt::Pointer::fmt(ptr, f)
            }
        }
    };
}

/// 32-bit physical address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);
impl_hex!(PhysAddr);

impl PhysAddr {
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Converts a `usize` address, failing if it does not fit in 32 bits.
    #[must_use]
    pub fn from_usize(addr: usize) -> Option<Self> {
        u32::try_from(addr).ok().map(Self)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::cast_from(self.0)
    }

    /// Returns the address with the in-page offset cleared.
    #[must_use]
    pub const fn frame(self) -> Self {
        Self(self.0 & FRAME_MASK)
    }

    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & !FRAME_MASK == 0
    }
}

/// 32-bit virtual address.
///
/// The upper ten bits select a directory slot, the next ten a table slot and
/// the low twelve the byte within the page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);
impl_hex!(VirtAddr);

impl VirtAddr {
    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[must_use]
    pub fn from_usize(addr: usize) -> Option<Self> {
        u32::try_from(addr).ok().map(Self)
    }

    /// Builds the page address selected by a directory and a table slot.
    ///
    /// # Panics
    ///
    /// Panics if either index is not below [`ENTRY_COUNT`].
    #[must_use]
    pub const fn from_indices(dir: usize, table: usize) -> Self {
        assert!(dir < ENTRY_COUNT && table < ENTRY_COUNT);
        #[expect(clippy::cast_possible_truncation)]
        let addr = ((dir << DIR_SHIFT) | (table << PAGE_SHIFT)) as u32;
        Self(addr)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::cast_from(self.0)
    }

    /// Index of the directory entry that covers this address.
    #[must_use]
    pub const fn dir_index(self) -> usize {
        (self.0 >> DIR_SHIFT) as usize
    }

    /// Index of the table entry that covers this address.
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) as usize) & (ENTRY_COUNT - 1)
    }

    #[must_use]
    pub const fn page_offset(self) -> usize {
        (self.0 & !FRAME_MASK) as usize
    }

    #[must_use]
    pub const fn page_floor(self) -> Self {
        Self(self.0 & FRAME_MASK)
    }

    /// Start of the 4 MiB span served by this address's page table.
    #[must_use]
    pub const fn table_floor(self) -> Self {
        Self(self.0 & !((1 << DIR_SHIFT) - 1))
    }

    #[must_use]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        u32::try_from(bytes)
            .ok()
            .and_then(|bytes| self.0.checked_add(bytes))
            .map(Self)
    }

    /// Returns the address through which the page table of `self` is visible
    /// in the page table window starting at `window`.
    ///
    /// A window is a 4 MiB region whose directory slot points back at a
    /// directory, so the 1024 page tables appear in it one page each, and the
    /// directory itself appears as the table of the window.
    #[must_use]
    pub const fn table_window(self, window: Self) -> Self {
        Self(((self.0 >> PAGE_SHIFT) * 4).wrapping_add(window.0) & FRAME_MASK)
    }
}

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
