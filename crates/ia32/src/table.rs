use dataview::{Pod, PodMethods as _};

use crate::{ENTRY_COUNT, entry::Entry};

/// A page directory or page table. Both share the same layout.
#[repr(C, align(4096))]
#[derive(Pod)]
pub(crate) struct PageTable([Entry; ENTRY_COUNT]);

pub(crate) type PageDirectory = PageTable;

impl PageTable {
    pub(crate) fn entry(&self, index: usize) -> Entry {
        self.0[index]
    }

    pub(crate) fn set(&mut self, index: usize, entry: Entry) {
        self.0[index] = entry;
    }

    pub(crate) fn clear(&mut self) {
        self.as_bytes_mut().fill(0);
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (usize, Entry)> + '_ {
        self.0.iter().copied().enumerate()
    }

    /// Returns whether any slot holds a present entry.
    pub(crate) fn is_in_use(&self) -> bool {
        self.0.iter().any(|entry| entry.is_present())
    }
}
