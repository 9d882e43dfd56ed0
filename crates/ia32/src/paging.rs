use alloc::vec::Vec;
use core::{fmt, ops, ptr};

use allocator::{AllocError, InvalidAddressSnafu, PhysicalAllocator, Range};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    Access, ActiveAddressSpaceSnafu, AllocDirectorySnafu, AllocFramesSnafu, AllocPageTableSnafu,
    DIR_SHIFT, ENTRY_COUNT, InvalidRangeSnafu, NoFreeRangeSnafu, NotMappedSnafu, PAGE_SHIFT,
    PAGE_SIZE, PAGE_TABLES_LOCAL, PAGE_TABLES_REMOTE, PagingError, PhysAddr, Region,
    ReleaseFrameSnafu, ReservedAddressSnafu, TABLE_SPAN, VirtAddr,
    entry::{Entry, EntryFlags},
    table::{PageDirectory, PageTable},
    tlb::Tlb,
};

/// Directory slot holding the self-map of the running address space.
const LOCAL_SLOT: usize = PAGE_TABLES_LOCAL.dir_index();

/// Directory slot holding the directory of the remote address space.
const REMOTE_SLOT: usize = PAGE_TABLES_REMOTE.dir_index();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Local,
    Remote,
}

impl Space {
    fn window(self) -> VirtAddr {
        match self {
            Self::Local => PAGE_TABLES_LOCAL,
            Self::Remote => PAGE_TABLES_REMOTE,
        }
    }
}

/// Page table manager of one address space.
///
/// Operations called directly on `Paging` edit the running address space.
/// [`Paging::remote`] gives the same operations for another address space,
/// reached through the remote page table window.
pub struct Paging<P, T> {
    physical: P,
    tlb: T,
    directory: PhysAddr,
    remote: Option<PhysAddr>,
}

impl<P, T> Paging<P, T>
where
    P: PhysicalAllocator,
    T: Tlb,
{
    /// Adopts the page directory at `directory`.
    ///
    /// # Safety
    ///
    /// `directory` must be a page directory in low memory of `physical`,
    /// with its self-map installed, and no other `Paging` may edit it.
    pub unsafe fn new(physical: P, tlb: T, directory: PhysAddr) -> Self {
        Self {
            physical,
            tlb,
            directory,
            remote: None,
        }
    }

    /// Builds an empty page directory with its self-map.
    pub fn bootstrap(physical: P, tlb: T) -> Result<Self, PagingError> {
        let mut paging = Self {
            physical,
            tlb,
            directory: PhysAddr::default(),
            remote: None,
        };
        let directory = paging.allocate_table().context(AllocDirectorySnafu)?;
        paging.write(directory, LOCAL_SLOT, window_entry(directory));
        paging.directory = directory;
        log::debug!("bootstrapped page directory {directory:#x}");
        Ok(paging)
    }

    /// Physical address of the running page directory.
    #[must_use]
    pub fn directory(&self) -> PhysAddr {
        self.directory
    }

    #[must_use]
    pub fn physical(&self) -> &P {
        &self.physical
    }

    #[must_use]
    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    pub fn tlb_mut(&mut self) -> &mut T {
        &mut self.tlb
    }

    pub fn into_parts(self) -> (P, T) {
        (self.physical, self.tlb)
    }

    /// Directory currently installed in the remote window.
    #[must_use]
    pub fn remote_target(&self) -> Option<PhysAddr> {
        self.remote
    }

    /// Maps `phys` at `virt`, or at a free page when `virt` is `None`.
    ///
    /// A missing page table is allocated from low memory. An existing
    /// mapping at `virt` is overwritten.
    pub fn map(
        &mut self,
        phys: PhysAddr,
        virt: Option<VirtAddr>,
        access: Access,
    ) -> Result<VirtAddr, PagingError> {
        self.map_in(Space::Local, phys, virt, access)
    }

    /// Removes the mapping at `virt`. The frame is not released.
    pub fn unmap(&mut self, virt: VirtAddr) -> Result<(), PagingError> {
        self.unmap_in(Space::Local, virt)
    }

    #[must_use]
    pub fn lookup(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.lookup_in(Space::Local, virt)
    }

    /// Checks that every page of `[virt, virt + size)` is present with
    /// `access`.
    #[must_use]
    pub fn access(&self, virt: VirtAddr, size: usize, access: Access) -> bool {
        self.access_in(Space::Local, virt, size, access)
    }

    /// Unmaps `virt` and returns its frame to the physical allocator.
    pub fn release(&mut self, virt: VirtAddr) -> Result<(), PagingError> {
        self.release_in(Space::Local, virt)
    }

    /// Releases every unpinned page of `region`. Returns the number of frames
    /// freed.
    pub fn release_region(&mut self, region: Region) -> usize {
        self.release_region_in(Space::Local, region)
    }

    /// Finds `size` bytes of unmapped pages inside `region`.
    #[must_use]
    pub fn find_free(&self, size: usize, region: Region) -> Option<VirtAddr> {
        self.find_free_in(Space::Local, size, region)
    }

    /// Maps the pages covering `size` bytes at `virt` to contiguous frames
    /// starting at `phys`. Without `phys` the frames are allocated here.
    ///
    /// Either every page is mapped or, on error, nothing changed. Returns
    /// the first frame.
    pub fn map_range(
        &mut self,
        phys: Option<PhysAddr>,
        virt: VirtAddr,
        size: usize,
        access: Access,
    ) -> Result<PhysAddr, PagingError> {
        self.map_range_in(Space::Local, phys, virt, size, access)
    }

    /// Removes the mappings covering `size` bytes at `virt`. If any page of
    /// the range is unmapped, nothing is removed.
    pub fn unmap_range(&mut self, virt: VirtAddr, size: usize) -> Result<(), PagingError> {
        self.unmap_range_in(Space::Local, virt, size)
    }

    /// Releases the unpinned pages covering `size` bytes at `virt` and every
    /// page table of the range left empty. With `tables_only` the pages are
    /// unmapped but their frames stay allocated.
    ///
    /// Returns the number of page frames freed.
    pub fn release_range(
        &mut self,
        virt: VirtAddr,
        size: usize,
        tables_only: bool,
    ) -> Result<usize, PagingError> {
        self.release_range_in(Space::Local, virt, size, tables_only)
    }

    /// Creates a new address space sharing the kernel regions of this one.
    ///
    /// Shared directory entries are pinned in the new directory, so tearing
    /// down the new address space leaves the kernel's tables alone.
    pub fn create_address_space(&mut self) -> Result<PhysAddr, PagingError> {
        let directory = self.allocate_table().context(AllocDirectorySnafu)?;
        let current = self.directory;
        for slot in Region::KERNEL.into_iter().flat_map(Region::dir_slots) {
            let entry = self.read(current, slot);
            if entry.is_present() {
                self.write(
                    directory,
                    slot,
                    entry.with_flags(entry.flags() | EntryFlags::PINNED),
                );
            }
        }
        self.write(directory, LOCAL_SLOT, window_entry(directory));
        log::debug!("created address space {directory:#x}");
        Ok(directory)
    }

    /// Releases everything the address space at `directory` owns, including
    /// the directory itself. Returns the number of page frames freed.
    pub fn destroy_address_space(&mut self, directory: PhysAddr) -> Result<usize, PagingError> {
        ensure!(
            directory != self.directory,
            ActiveAddressSpaceSnafu { directory }
        );
        let freed = self.remote(directory).release_all();
        // Tables left holding pinned pages still belong to this directory.
        self.release_tables_in(Space::Remote);
        self.detach_remote();
        self.physical
            .release(directory.as_usize())
            .context(ReleaseFrameSnafu { phys: directory })?;
        log::debug!("destroyed address space {directory:#x}, {freed} frames freed");
        Ok(freed)
    }

    /// Installs `directory` in the remote window.
    ///
    /// Changing the target flushes the entire TLB, since a whole 4 MiB slice
    /// of the running address space now resolves differently.
    pub fn remote(&mut self, directory: PhysAddr) -> Remote<'_, P, T> {
        if self.remote != Some(directory) {
            let local = self.directory;
            self.write(local, REMOTE_SLOT, window_entry(directory));
            self.tlb.flush_all();
            self.remote = Some(directory);
            log::trace!("remote window now shows {directory:#x}");
        }
        Remote { paging: self }
    }

    /// Clears the remote window.
    pub fn detach_remote(&mut self) {
        if self.remote.take().is_some() {
            let local = self.directory;
            self.write(local, REMOTE_SLOT, Entry::EMPTY);
            self.tlb.flush_all();
        }
    }

    fn table(&self, frame: PhysAddr) -> &PageTable {
        let virt = self.physical.to_virtual(frame.as_usize());
        // Table frames come from low memory, which stays mapped.
        unsafe { &*ptr::with_exposed_provenance::<PageTable>(virt) }
    }

    fn table_mut(&mut self, frame: PhysAddr) -> &mut PageTable {
        let virt = self.physical.to_virtual(frame.as_usize());
        unsafe { &mut *ptr::with_exposed_provenance_mut::<PageTable>(virt) }
    }

    fn read(&self, table: PhysAddr, index: usize) -> Entry {
        self.table(table).entry(index)
    }

    fn write(&mut self, table: PhysAddr, index: usize, entry: Entry) {
        self.table_mut(table).set(index, entry);
    }

    fn allocate_table(&mut self) -> Result<PhysAddr, AllocError> {
        let granted = self
            .physical
            .allocate_low(Range::any(PAGE_SIZE, PAGE_SIZE))?;
        let Some(frame) = PhysAddr::from_usize(granted.address) else {
            self.physical.release(granted.address)?;
            return InvalidAddressSnafu {
                address: granted.address,
            }
            .fail();
        };
        self.table_mut(frame).clear();
        Ok(frame)
    }

    fn directory_of(&self, space: Space) -> PhysAddr {
        match space {
            Space::Local => self.directory,
            // The window slot points at the remote directory.
            Space::Remote => self.read(self.directory, REMOTE_SLOT).frame(),
        }
    }

    /// Whether directory entries written through `space` belong to the
    /// running address space.
    fn shares_directory(&self, space: Space) -> bool {
        space == Space::Local || self.directory_of(Space::Remote) == self.directory
    }

    /// Whether the page table in `slot` of `space` is also used by the
    /// running address space.
    fn shares_table(&self, space: Space, slot: usize) -> bool {
        if self.shares_directory(space) {
            return true;
        }
        let local = self.read(self.directory, slot);
        local.is_present() && local.frame() == self.read(self.directory_of(space), slot).frame()
    }

    fn flush_page(&mut self, space: Space, virt: VirtAddr) {
        if self.shares_table(space, virt.dir_index()) {
            self.tlb.flush(virt);
        }
    }

    /// Invalidates the window address of the page table covering `virt`.
    fn flush_table(&mut self, space: Space, virt: VirtAddr) {
        self.tlb.flush(virt.table_window(space.window()));
        if space == Space::Remote && self.shares_directory(space) {
            self.tlb.flush(virt.table_window(PAGE_TABLES_LOCAL));
        }
    }

    /// Makes sure a page table covers `virt` and that its directory entry
    /// grants at least `wanted`.
    ///
    /// Returns the table and, if the directory entry was written, the entry
    /// it replaced.
    fn install_table(
        &mut self,
        space: Space,
        virt: VirtAddr,
        wanted: EntryFlags,
    ) -> Result<(PhysAddr, Option<Entry>), PagingError> {
        let directory = self.directory_of(space);
        let slot = virt.dir_index();
        let dir_entry = self.read(directory, slot);
        if dir_entry.is_present() {
            if dir_entry.flags().contains(wanted) {
                return Ok((dir_entry.frame(), None));
            }
            self.write(directory, slot, dir_entry.with_flags(dir_entry.flags() | wanted));
            self.flush_table(space, virt);
            // Translations of the whole table were cached with the old rights.
            if self.shares_directory(space) {
                self.tlb.flush_all();
            }
            return Ok((dir_entry.frame(), Some(dir_entry)));
        }

        // Nothing is written until the table frame exists.
        let table = self
            .allocate_table()
            .context(AllocPageTableSnafu { virt })?;
        self.write(directory, slot, Entry::new(table, wanted));
        self.flush_table(space, virt);
        log::trace!("new page table {table:#x} for {:#x}", virt.table_floor());
        Ok((table, Some(dir_entry)))
    }

    /// Puts back the directory entry `install_table` replaced.
    fn restore_table(&mut self, space: Space, virt: VirtAddr, previous: Entry) {
        if previous.is_present() {
            let directory = self.directory_of(space);
            self.write(directory, virt.dir_index(), previous);
            self.flush_table(space, virt);
        } else {
            self.drop_table(space, virt.dir_index());
        }
    }

    /// Returns `count` frames from `allocate_frames` starting at `address`.
    fn release_frames(&mut self, address: usize, count: usize) {
        for index in 0..count {
            let frame = address + index * PAGE_SIZE;
            if let Err(err) = self.physical.release(frame) {
                log::warn!("frame {frame:#x} not released: {err}");
            }
        }
    }

    /// Clears directory `slot` and hands its page table back.
    fn drop_table(&mut self, space: Space, slot: usize) {
        let directory = self.directory_of(space);
        let table = self.read(directory, slot).frame();
        self.write(directory, slot, Entry::EMPTY);
        self.flush_table(space, VirtAddr::from_indices(slot, 0));
        if let Err(err) = self.physical.release(table.as_usize()) {
            log::warn!("page table {table:#x} not released: {err}");
        }
    }

    fn map_in(
        &mut self,
        space: Space,
        phys: PhysAddr,
        virt: Option<VirtAddr>,
        access: Access,
    ) -> Result<VirtAddr, PagingError> {
        let virt = match virt {
            Some(virt) => virt,
            None => {
                let region = if access.contains(Access::USER) {
                    Region::UserPrivate
                } else {
                    Region::KernelPrivate
                };
                self.find_free_in(space, PAGE_SIZE, region)
                    .context(NoFreeRangeSnafu {
                        size: PAGE_SIZE,
                        region,
                    })?
            }
        };
        ensure!(
            !Region::PageTables.contains(virt),
            ReservedAddressSnafu { virt }
        );

        let flags = EntryFlags::from(access);
        let (table, _) = self.install_table(space, virt, directory_flags(flags))?;
        self.write(table, virt.table_index(), Entry::new(phys, flags));
        self.flush_page(space, virt);
        Ok(virt)
    }

    fn map_range_in(
        &mut self,
        space: Space,
        phys: Option<PhysAddr>,
        virt: VirtAddr,
        size: usize,
        access: Access,
    ) -> Result<PhysAddr, PagingError> {
        let (start, count) = page_span(virt, size)?;
        let bytes = count * PAGE_SIZE;
        let (first_frame, allocated) = match phys {
            Some(phys) => {
                let frame = phys.frame();
                ensure!(
                    frames_fit(frame.as_usize(), bytes),
                    InvalidRangeSnafu { virt, size }
                );
                (frame, false)
            }
            None => {
                let granted = self
                    .physical
                    .allocate_frames(Range::any(bytes, PAGE_SIZE))
                    .context(AllocFramesSnafu { size: bytes })?;
                match PhysAddr::from_usize(granted.address) {
                    Some(frame) if frames_fit(granted.address, bytes) => (frame, true),
                    _ => {
                        self.release_frames(granted.address, count);
                        return InvalidAddressSnafu {
                            address: granted.address,
                        }
                        .fail()
                        .context(AllocFramesSnafu { size: bytes });
                    }
                }
            }
        };

        // Every table exists before the first page is written, so only table
        // allocation can fail and it leaves no page behind.
        let flags = EntryFlags::from(access);
        let mut replaced = Vec::new();
        let last_slot = (start.as_usize() + bytes - 1) >> DIR_SHIFT;
        for slot in start.dir_index()..=last_slot {
            let virt = if slot == start.dir_index() {
                start
            } else {
                VirtAddr::from_indices(slot, 0)
            };
            match self.install_table(space, virt, directory_flags(flags)) {
                Ok((_, Some(previous))) => replaced.push((virt, previous)),
                Ok((_, None)) => {}
                Err(err) => {
                    for (virt, previous) in replaced.into_iter().rev() {
                        self.restore_table(space, virt, previous);
                    }
                    if allocated {
                        self.release_frames(first_frame.as_usize(), count);
                    }
                    return Err(err);
                }
            }
        }

        let leaves = (0..count).map_while(|index| {
            let offset = index * PAGE_SIZE;
            Some((
                start.checked_add(offset)?,
                PhysAddr::from_usize(first_frame.as_usize() + offset)?,
            ))
        });
        for (virt, frame) in leaves {
            let table = self.read(self.directory_of(space), virt.dir_index()).frame();
            self.write(table, virt.table_index(), Entry::new(frame, flags));
            self.flush_page(space, virt);
        }
        log::trace!("mapped {count} pages at {start:#x} to {first_frame:#x}");
        Ok(first_frame)
    }

    fn unmap_range_in(
        &mut self,
        space: Space,
        virt: VirtAddr,
        size: usize,
    ) -> Result<(), PagingError> {
        let (start, count) = page_span(virt, size)?;
        let unmapped = pages(start, count).find(|virt| self.lookup_in(space, *virt).is_none());
        if let Some(virt) = unmapped {
            return NotMappedSnafu { virt }.fail();
        }
        for virt in pages(start, count) {
            self.unmap_in(space, virt)?;
        }
        Ok(())
    }

    fn release_range_in(
        &mut self,
        space: Space,
        virt: VirtAddr,
        size: usize,
        tables_only: bool,
    ) -> Result<usize, PagingError> {
        let (start, count) = page_span(virt, size)?;
        let last = start.as_usize() + count * PAGE_SIZE - 1;
        let last_slot = last >> DIR_SHIFT;
        let directory = self.directory_of(space);
        let mut freed = 0;
        for slot in start.dir_index()..=last_slot {
            let dir_entry = self.read(directory, slot);
            if !dir_entry.is_present() || dir_entry.is_pinned() {
                continue;
            }
            let first = if slot == start.dir_index() {
                start.table_index()
            } else {
                0
            };
            let end = if slot == last_slot {
                ((last >> PAGE_SHIFT) & (ENTRY_COUNT - 1)) + 1
            } else {
                ENTRY_COUNT
            };
            let table = dir_entry.frame();
            freed += self.release_table(space, table, slot, first..end, !tables_only);
            if !self.table(table).is_in_use() {
                self.drop_table(space, slot);
            }
        }
        log::debug!("released {freed} frames of {start:#x}, {count} pages");
        Ok(freed)
    }

    fn unmap_in(&mut self, space: Space, virt: VirtAddr) -> Result<(), PagingError> {
        ensure!(
            !Region::PageTables.contains(virt),
            ReservedAddressSnafu { virt }
        );
        let dir_entry = self.read(self.directory_of(space), virt.dir_index());
        ensure!(dir_entry.is_present(), NotMappedSnafu { virt });
        let table = dir_entry.frame();
        ensure!(
            self.read(table, virt.table_index()).is_present(),
            NotMappedSnafu { virt }
        );
        self.write(table, virt.table_index(), Entry::EMPTY);
        self.flush_page(space, virt);
        Ok(())
    }

    fn leaf(&self, space: Space, virt: VirtAddr) -> Option<Entry> {
        let dir_entry = self.read(self.directory_of(space), virt.dir_index());
        if !dir_entry.is_present() {
            return None;
        }
        Some(self.read(dir_entry.frame(), virt.table_index()))
    }

    fn lookup_in(&self, space: Space, virt: VirtAddr) -> Option<PhysAddr> {
        self.leaf(space, virt)
            .filter(|leaf| leaf.is_present())
            .map(Entry::frame)
    }

    fn access_in(&self, space: Space, virt: VirtAddr, size: usize, access: Access) -> bool {
        if size == 0 {
            return true;
        }
        let Some(end) = virt.as_usize().checked_add(size) else {
            return false;
        };
        if VirtAddr::from_usize(end - 1).is_none() {
            return false;
        }

        let required = EntryFlags::from(access) | EntryFlags::PRESENT;
        let dir_required =
            required & (EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER);
        let directory = self.directory_of(space);
        let mut page = virt.page_floor().as_usize();
        while page < end {
            let Some(virt) = VirtAddr::from_usize(page) else {
                return false;
            };
            let dir_entry = self.read(directory, virt.dir_index());
            if !dir_entry.flags().contains(dir_required) {
                return false;
            }
            let leaf = self.read(dir_entry.frame(), virt.table_index());
            if !leaf.flags().contains(required) {
                return false;
            }
            let Some(next) = page.checked_add(PAGE_SIZE) else {
                break;
            };
            page = next;
        }
        true
    }

    fn release_in(&mut self, space: Space, virt: VirtAddr) -> Result<(), PagingError> {
        ensure!(
            !Region::PageTables.contains(virt),
            ReservedAddressSnafu { virt }
        );
        let phys = self
            .lookup_in(space, virt)
            .context(NotMappedSnafu { virt })?;
        let released = self.physical.release(phys.as_usize());
        self.unmap_in(space, virt)?;
        released.context(ReleaseFrameSnafu { phys })
    }

    /// Unmaps the unpinned pages at `indices` of the table in directory
    /// `slot`, releasing their frames if `frames` is set. Returns the number
    /// of frames freed.
    fn release_table(
        &mut self,
        space: Space,
        table: PhysAddr,
        slot: usize,
        indices: ops::Range<usize>,
        frames: bool,
    ) -> usize {
        let mut freed = 0;
        for index in indices {
            let leaf = self.read(table, index);
            if !leaf.is_present() || leaf.is_pinned() {
                continue;
            }
            let virt = VirtAddr::from_indices(slot, index);
            if frames {
                match self.physical.release(leaf.frame().as_usize()) {
                    Ok(()) => freed += 1,
                    Err(err) => {
                        log::warn!("{virt:#x}: frame {:#x} not released: {err}", leaf.frame());
                    }
                }
            }
            self.write(table, index, Entry::EMPTY);
            self.flush_page(space, virt);
        }
        freed
    }

    fn release_region_in(&mut self, space: Space, region: Region) -> usize {
        let directory = self.directory_of(space);
        let mut freed = 0;
        for slot in region.dir_slots() {
            let dir_entry = self.read(directory, slot);
            if !dir_entry.is_present() || dir_entry.is_pinned() {
                continue;
            }
            freed += self.release_table(space, dir_entry.frame(), slot, 0..ENTRY_COUNT, true);
        }
        log::debug!("released {freed} frames of {region:?}");
        freed
    }

    fn release_all_in(&mut self, space: Space) -> usize {
        let directory = self.directory_of(space);
        let mut freed = 0;
        for slot in 0..ENTRY_COUNT {
            let dir_entry = self.read(directory, slot);
            if !dir_entry.is_present() || dir_entry.is_pinned() {
                continue;
            }
            let table = dir_entry.frame();
            freed += self.release_table(space, table, slot, 0..ENTRY_COUNT, true);
            if !self.table(table).is_in_use() {
                self.drop_table(space, slot);
            }
        }
        log::debug!("released {freed} frames of address space {directory:#x}");
        freed
    }

    fn release_tables_in(&mut self, space: Space) {
        let directory = self.directory_of(space);
        for slot in 0..ENTRY_COUNT {
            let dir_entry = self.read(directory, slot);
            if dir_entry.is_present() && !dir_entry.is_pinned() {
                self.drop_table(space, slot);
            }
        }
    }

    fn find_free_in(&self, space: Space, size: usize, region: Region) -> Option<VirtAddr> {
        let needed = size.max(1).div_ceil(PAGE_SIZE).checked_mul(PAGE_SIZE)?;
        let directory = self.directory_of(space);
        let end = region.end();
        let mut addr = region.base().as_usize();
        let mut run_start = addr;
        while addr < end {
            let virt = VirtAddr::from_usize(addr)?;
            let dir_entry = self.read(directory, virt.dir_index());
            if !dir_entry.is_present() {
                addr = (addr & !(TABLE_SPAN - 1)) + TABLE_SPAN;
            } else if self.read(dir_entry.frame(), virt.table_index()).is_empty() {
                addr += PAGE_SIZE;
            } else {
                addr += PAGE_SIZE;
                run_start = addr;
                continue;
            }
            if addr - run_start >= needed {
                return VirtAddr::from_usize(run_start);
            }
        }
        None
    }
}

impl<P, T> fmt::Debug for Paging<P, T>
where
    P: PhysicalAllocator,
    T: Tlb,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Paging")
            .field("directory", &DebugPointer(self.directory))
            .field("remote", &self.remote.map(DebugPointer))
            .field("mappings", &DebugMappings {
                paging: self,
                directory: self.table(self.directory),
            })
            .finish()
    }
}

/// Paging operations on the address space installed in the remote window.
///
/// Obtained from [`Paging::remote`]. The processor caches no translations of
/// the remote address space, so a page update is invalidated only when the
/// running address space uses the same page table.
pub struct Remote<'a, P, T> {
    paging: &'a mut Paging<P, T>,
}

impl<P, T> Remote<'_, P, T>
where
    P: PhysicalAllocator,
    T: Tlb,
{
    /// Physical address of the remote page directory.
    #[must_use]
    pub fn directory(&self) -> PhysAddr {
        self.paging.directory_of(Space::Remote)
    }

    pub fn map(
        &mut self,
        phys: PhysAddr,
        virt: Option<VirtAddr>,
        access: Access,
    ) -> Result<VirtAddr, PagingError> {
        self.paging.map_in(Space::Remote, phys, virt, access)
    }

    pub fn unmap(&mut self, virt: VirtAddr) -> Result<(), PagingError> {
        self.paging.unmap_in(Space::Remote, virt)
    }

    #[must_use]
    pub fn lookup(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.paging.lookup_in(Space::Remote, virt)
    }

    #[must_use]
    pub fn access(&self, virt: VirtAddr, size: usize, access: Access) -> bool {
        self.paging.access_in(Space::Remote, virt, size, access)
    }

    pub fn release(&mut self, virt: VirtAddr) -> Result<(), PagingError> {
        self.paging.release_in(Space::Remote, virt)
    }

    pub fn release_region(&mut self, region: Region) -> usize {
        self.paging.release_region_in(Space::Remote, region)
    }

    /// Releases every unpinned page and every emptied page table of the
    /// remote address space. Returns the number of page frames freed.
    pub fn release_all(&mut self) -> usize {
        self.paging.release_all_in(Space::Remote)
    }

    #[must_use]
    pub fn find_free(&self, size: usize, region: Region) -> Option<VirtAddr> {
        self.paging.find_free_in(Space::Remote, size, region)
    }

    pub fn map_range(
        &mut self,
        phys: Option<PhysAddr>,
        virt: VirtAddr,
        size: usize,
        access: Access,
    ) -> Result<PhysAddr, PagingError> {
        self.paging
            .map_range_in(Space::Remote, phys, virt, size, access)
    }

    pub fn unmap_range(&mut self, virt: VirtAddr, size: usize) -> Result<(), PagingError> {
        self.paging.unmap_range_in(Space::Remote, virt, size)
    }

    pub fn release_range(
        &mut self,
        virt: VirtAddr,
        size: usize,
        tables_only: bool,
    ) -> Result<usize, PagingError> {
        self.paging
            .release_range_in(Space::Remote, virt, size, tables_only)
    }
}

/// Directory entry rights a table needs to hold a page with `flags`.
fn directory_flags(flags: EntryFlags) -> EntryFlags {
    EntryFlags::PRESENT | EntryFlags::WRITABLE | (flags & EntryFlags::USER)
}

/// Returns the first page and the page count covering `size` bytes at
/// `virt`. An empty range covers one page.
fn page_span(virt: VirtAddr, size: usize) -> Result<(VirtAddr, usize), PagingError> {
    let start = virt.page_floor();
    let count = virt
        .page_offset()
        .checked_add(size.max(1))
        .map(|bytes| bytes.div_ceil(PAGE_SIZE))
        .filter(|count| {
            count
                .checked_mul(PAGE_SIZE)
                .and_then(|bytes| start.checked_add(bytes - 1))
                .is_some()
        })
        .context(InvalidRangeSnafu { virt, size })?;

    let end = start.as_usize() + count * PAGE_SIZE;
    let window = Region::PageTables;
    if start.as_usize() < window.end() && window.base().as_usize() < end {
        let virt = if window.contains(start) {
            start
        } else {
            window.base()
        };
        return ReservedAddressSnafu { virt }.fail();
    }
    Ok((start, count))
}

fn pages(start: VirtAddr, count: usize) -> impl Iterator<Item = VirtAddr> {
    (0..count).map_while(move |index| start.checked_add(index * PAGE_SIZE))
}

/// Whether `bytes` of frames starting at `address` lie below 4 GiB.
fn frames_fit(address: usize, bytes: usize) -> bool {
    address
        .checked_add(bytes - 1)
        .and_then(PhysAddr::from_usize)
        .is_some()
}

/// Directory entry that exposes `directory` through a page table window.
fn window_entry(directory: PhysAddr) -> Entry {
    Entry::new(
        directory,
        EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::PINNED,
    )
}

struct DebugMappings<'a, P, T> {
    paging: &'a Paging<P, T>,
    directory: &'a PageDirectory,
}

impl<P, T> fmt::Debug for DebugMappings<'_, P, T>
where
    P: PhysicalAllocator,
    T: Tlb,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dumper = DumpRuns::new(f.debug_map());
        for (slot, dir_entry) in self.directory.entries() {
            // The windows alias directories, not pages.
            if !dir_entry.is_present() || Region::PageTables.dir_slots().contains(&slot) {
                continue;
            }
            for (index, leaf) in self.paging.table(dir_entry.frame()).entries() {
                if leaf.is_present() {
                    dumper.page(VirtAddr::from_indices(slot, index), leaf);
                }
            }
        }
        dumper.finish()
    }
}

/// Run of virtually and physically contiguous pages with equal flags.
struct Run {
    virt: (VirtAddr, VirtAddr),
    phys: (PhysAddr, PhysAddr),
    access: Access,
}

impl Run {
    fn try_join(&mut self, virt: VirtAddr, leaf: Entry) -> bool {
        let step = u32::try_from(PAGE_SIZE).ok();
        let contiguous = virt.value().checked_sub(self.virt.1.value()) == step
            && leaf.frame().value().checked_sub(self.phys.1.value()) == step;
        if !contiguous || Access::from(leaf.flags()) != self.access {
            return false;
        }
        self.virt.1 = virt;
        self.phys.1 = leaf.frame();
        true
    }
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#p}..={:#p} ({:?})",
            self.phys.0,
            self.phys.1,
            DebugAccess(self.access)
        )
    }
}

struct DumpRuns<'a, 'b> {
    dm: fmt::DebugMap<'a, 'b>,
    run: Option<Run>,
}

impl<'a, 'b> DumpRuns<'a, 'b> {
    fn new(dm: fmt::DebugMap<'a, 'b>) -> Self {
        Self { dm, run: None }
    }

    fn page(&mut self, virt: VirtAddr, leaf: Entry) {
        if let Some(run) = &mut self.run
            && run.try_join(virt, leaf)
        {
            return;
        }
        self.dump();
        self.run = Some(Run {
            virt: (virt, virt),
            phys: (leaf.frame(), leaf.frame()),
            access: Access::from(leaf.flags()),
        });
    }

    fn dump(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        self.dm.entry(
            &(DebugPointer(run.virt.0)..=DebugPointer(run.virt.1)),
            &run,
        );
    }

    fn finish(&mut self) -> fmt::Result {
        self.dump();
        self.dm.finish()
    }
}

struct DebugPointer<A>(A);

impl<A> fmt::Debug for DebugPointer<A>
where
    A: fmt::Pointer,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#p}", self.0)
    }
}

struct DebugAccess(Access);

impl fmt::Debug for DebugAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [(Access, char); 6] = [
            (Access::READABLE, 'r'),
            (Access::WRITABLE, 'w'),
            (Access::USER, 'u'),
            (Access::PINNED, 'p'),
            (Access::MARKED, 'm'),
            (Access::RESERVED, 'x'),
        ];
        for (flag, letter) in LETTERS {
            let ch = if self.0.contains(flag) { letter } else { '-' };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}
