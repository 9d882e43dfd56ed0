use core::fmt;

use bitflags::bitflags;
use dataview::Pod;

use crate::{Access, FRAME_MASK, PhysAddr};

bitflags! {
    /// Flags of an IA-32 page directory or page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct EntryFlags: u32 {
        /// Present Bit.
        ///
        /// If clear, the entry is ignored by the MMU.
        const PRESENT = 1 << 0;

        /// Read/Write Bit.
        ///
        /// If set, the page can be written to.
        const WRITABLE = 1 << 1;

        /// User/Supervisor Bit.
        ///
        /// If set, user mode can access the page.
        const USER = 1 << 2;

        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;

        // Bits 9..=11 are left to software.
        const PINNED = 1 << 9;
        const MARKED = 1 << 10;
        const RESERVED = 1 << 11;
    }
}

impl From<Access> for EntryFlags {
    fn from(access: Access) -> Self {
        const PAIRS: [(Access, EntryFlags); 6] = [
            (Access::PRESENT, EntryFlags::PRESENT),
            (Access::WRITABLE, EntryFlags::WRITABLE),
            (Access::USER, EntryFlags::USER),
            (Access::PINNED, EntryFlags::PINNED),
            (Access::MARKED, EntryFlags::MARKED),
            (Access::RESERVED, EntryFlags::RESERVED),
        ];
        PAIRS
            .iter()
            .filter(|(from, _)| access.contains(*from))
            .fold(Self::empty(), |flags, (_, to)| flags | *to)
    }
}

impl From<EntryFlags> for Access {
    fn from(flags: EntryFlags) -> Self {
        let mut access = Self::empty();
        if flags.contains(EntryFlags::PRESENT) {
            access |= Self::PRESENT | Self::READABLE;
        }
        if flags.contains(EntryFlags::WRITABLE) {
            access |= Self::WRITABLE;
        }
        if flags.contains(EntryFlags::USER) {
            access |= Self::USER;
        }
        if flags.contains(EntryFlags::PINNED) {
            access |= Self::PINNED;
        }
        if flags.contains(EntryFlags::MARKED) {
            access |= Self::MARKED;
        }
        if flags.contains(EntryFlags::RESERVED) {
            access |= Self::RESERVED;
        }
        access
    }
}

/// One slot of a page directory or page table.
///
/// The upper twenty bits hold a frame address, the lower twelve the flags.
#[repr(transparent)]
#[derive(Pod, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Entry(u32);

impl Entry {
    pub(crate) const EMPTY: Self = Self(0);

    pub(crate) fn new(frame: PhysAddr, flags: EntryFlags) -> Self {
        Self((frame.value() & FRAME_MASK) | flags.bits())
    }

    pub(crate) fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & FRAME_MASK)
    }

    pub(crate) fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_retain(self.0 & !FRAME_MASK)
    }

    pub(crate) fn with_flags(self, flags: EntryFlags) -> Self {
        Self::new(self.frame(), flags)
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub(crate) fn is_pinned(self) -> bool {
        self.flags().contains(EntryFlags::PINNED)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entry({:#010x}, {:?})", self.frame(), self.flags())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_bits() {
        let flags = EntryFlags::from(Access::PRESENT | Access::URW | Access::PINNED);
        assert_eq!(flags.bits(), 0x207);
        assert_eq!(EntryFlags::from(Access::READABLE), EntryFlags::empty());
        assert_eq!(EntryFlags::from(Access::MARKED | Access::RESERVED).bits(), 0xc00);
    }

    #[test]
    fn access_from_flags() {
        let access = Access::from(EntryFlags::PRESENT | EntryFlags::USER | EntryFlags::DIRTY);
        assert_eq!(access, Access::PRESENT | Access::READABLE | Access::USER);
        assert_eq!(Access::from(EntryFlags::empty()), Access::empty());
    }

    #[test]
    fn entry_layout() {
        let entry = Entry::new(
            PhysAddr::new(0x0012_3456),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        );
        assert_eq!(entry.frame(), PhysAddr::new(0x0012_3000));
        assert_eq!(entry.0, 0x0012_3003);
        assert!(entry.is_present());
        assert!(!entry.is_pinned());

        let pinned = entry.with_flags(entry.flags() | EntryFlags::PINNED);
        assert!(pinned.is_pinned());
        assert_eq!(pinned.frame(), entry.frame());
        assert!(Entry::EMPTY.is_empty());
        assert!(!Entry::EMPTY.is_present());
    }
}
