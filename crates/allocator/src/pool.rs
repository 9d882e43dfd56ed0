//! Power-of-two pool allocator.
//!
//! Requests are rounded up to a power-of-two size class. Each class owns a
//! chain of pools, and each pool is a [`BitAllocator`] whose chunks are the
//! objects of that class. Pools are carved out of blocks obtained from the
//! parent allocator, with their bookkeeping stored in-band:
//!
//! ```text
//! Pool block:
//! ┌─────────────┬─────────────┬─────────────┬─────┬──────────────────────┐
//! │ Pool header │ used bitmap │ head bitmap │ pad │ objects (count × 2ⁿ) │
//! └─────────────┴─────────────┴─────────────┴─────┴──────────────────────┘
//! ```
//!
//! A class whose pools are all full grows by a new pool holding the base
//! object count times the number of pools already in the chain, so the
//! capacity of a class grows geometrically with demand. Pools that become
//! empty are handed back to the parent.
//!
//! # Object guards
//!
//! With [`PoolConfig::guards`] enabled every object is bracketed by
//! signatures:
//!
//! ```text
//! ┌───────────┬────────────┬──────────────────────┬───────────┐
//! │ signature │ length u32 │ payload (4-aligned)  │ signature │
//! └───────────┴────────────┴──────────────────────┴───────────┘
//! ```
//!
//! Release verifies both signatures and reports
//! [`Corrupted`](AllocError::Corrupted) if either was overwritten. Releasing
//! an object that is not live is reported as
//! [`DoubleFree`](AllocError::DoubleFree). Both are checked against the one
//! object only, so a damaged object never affects its neighbours.
//!
//! Releasing the last object of a pool hands the pool back to the parent.
//! The payloads of the most recently retired pools are remembered, so a
//! second release of such an object is still reported as a double free.
//!
//! # Cost of release
//!
//! Release finds the owning pool by scanning every pool of every class. This
//! is linear in the number of pools.

use core::{
    mem,
    ptr::{self, NonNull},
    slice,
};

use bit_array::{BitArray, storage_size};
use snafu::ensure;
use snafu_utils::Report;

use crate::{
    AllocError, Allocator, CorruptedSnafu, DoubleFreeSnafu, InvalidAddressSnafu,
    InvalidAlignmentSnafu, InvalidSizeSnafu, Range, bit::BitAllocator,
};

/// Value written before and after every guarded object.
pub const SIGNATURE: u32 = 0xf7f7_f7f7;

const PREFIX_SIZE: usize = 8;
const POSTFIX_SIZE: usize = 4;
const PAYLOAD_ALIGN: usize = 16;
const BASE_POOL_BYTES: usize = 16 * 1024;
const HEADER_SIZE: usize = mem::size_of::<Pool>().next_multiple_of(PAYLOAD_ALIGN);
const CLASSES: usize = usize::BITS as usize;
const RETIRED: usize = 8;

/// Tunables of a [`PoolAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Exponent of the smallest size class.
    pub min_power: u32,
    /// Exponent of the largest size class.
    pub max_power: u32,
    /// Bracket every object with signatures.
    pub guards: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_power: 2,
            max_power: 27,
            guards: true,
        }
    }
}

struct Pool {
    next: Option<NonNull<Pool>>,
    block: Range,
    objects: BitAllocator<&'static mut [u8]>,
}

impl Pool {
    /// Bytes needed for a pool of `count` objects of `1 << power` bytes.
    fn bytes_for(power: u32, count: usize) -> Option<usize> {
        let metadata = (HEADER_SIZE + 2 * storage_size(count)).next_multiple_of(PAYLOAD_ALIGN);
        count.checked_mul(1 << power)?.checked_add(metadata)
    }

    /// Lays out a pool inside `block`.
    ///
    /// # Safety
    ///
    /// `block` must be exclusively owned, writable, at least
    /// `bytes_for(power, count)` long and aligned for `Pool`.
    unsafe fn init(block: Range, power: u32, count: usize) -> NonNull<Self> {
        let bitmap = storage_size(count);
        let payload = (block.address + HEADER_SIZE + 2 * bitmap).next_multiple_of(PAYLOAD_ALIGN);
        let bytes = ptr::with_exposed_provenance_mut::<u8>(block.address);
        let header = ptr::with_exposed_provenance_mut::<Self>(block.address);

        unsafe {
            let used = slice::from_raw_parts_mut(bytes.add(HEADER_SIZE), bitmap);
            let heads = slice::from_raw_parts_mut(bytes.add(HEADER_SIZE + bitmap), bitmap);
            let objects = BitAllocator::with_storage(
                Range::new(payload, count << power, 0),
                1 << power,
                BitArray::with_storage(count, used),
                BitArray::with_storage(count, heads),
            );
            header.write(Self {
                next: None,
                block,
                objects,
            });
            NonNull::new_unchecked(header)
        }
    }

    fn object_size(&self) -> usize {
        self.objects.chunk_size()
    }

    fn power(&self) -> u32 {
        self.object_size().trailing_zeros()
    }

    fn payload(&self) -> Range {
        Range::new(self.objects.base(), self.objects.size(), 0)
    }

    fn is_empty(&self) -> bool {
        self.objects.available() == self.objects.size()
    }
}

/// Object area of a pool that went back to the parent.
#[derive(Debug, Clone, Copy)]
struct Retired {
    payload: Range,
    object_size: usize,
}

/// Iterator over one class's chain of pools.
struct Chain {
    next: Option<NonNull<Pool>>,
}

impl Iterator for Chain {
    type Item = NonNull<Pool>;

    fn next(&mut self) -> Option<Self::Item> {
        let pool = self.next?;
        self.next = unsafe { pool.as_ref() }.next;
        Some(pool)
    }
}

/// Allocator of small objects grouped into power-of-two size classes.
pub struct PoolAllocator<P> {
    parent: P,
    config: PoolConfig,
    pools: [Option<NonNull<Pool>>; CLASSES],
    retired: [Option<Retired>; RETIRED],
    next_retired: usize,
}

// Pools are reachable only through the allocator that created them.
unsafe impl<P> Send for PoolAllocator<P> where P: Send {}

impl<P> PoolAllocator<P>
where
    P: Allocator,
{
    /// Creates an allocator growing from `parent` with the default
    /// configuration.
    pub fn new(parent: P) -> Self {
        Self::with_config(parent, PoolConfig::default())
    }

    /// Creates an allocator growing from `parent`.
    ///
    /// # Panics
    ///
    /// Panics if the class range is empty or too large for the address
    /// space.
    pub fn with_config(parent: P, config: PoolConfig) -> Self {
        assert!(
            config.min_power <= config.max_power && config.max_power < usize::BITS - 1,
            "invalid size classes 2^{}..=2^{}",
            config.min_power,
            config.max_power
        );
        Self {
            parent,
            config,
            pools: [None; CLASSES],
            retired: [None; RETIRED],
            next_retired: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.config
    }

    #[must_use]
    pub fn parent(&self) -> &P {
        &self.parent
    }

    /// Replaces the allocator pools are taken from and returns the old one.
    ///
    /// Pools that already exist are handed to the new parent when they
    /// empty, so this is meant to be called before the first allocation.
    pub fn set_parent(&mut self, parent: P) -> P {
        mem::replace(&mut self.parent, parent)
    }

    /// Returns the number of pools currently held.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.classes().map(|power| self.chain(power).count()).sum()
    }

    /// Verifies that `address` is a live object with intact guards.
    pub fn check(&self, address: usize) -> Result<(), AllocError> {
        self.locate(address).map(|_| ())
    }

    fn classes(&self) -> core::ops::RangeInclusive<u32> {
        self.config.min_power..=self.config.max_power
    }

    fn chain(&self, power: u32) -> Chain {
        Chain {
            next: self.pools[power as usize],
        }
    }

    fn prefix(&self) -> usize {
        if self.config.guards { PREFIX_SIZE } else { 0 }
    }

    /// Returns the size class for a request of `size` bytes.
    fn class_of(&self, size: usize) -> Result<u32, AllocError> {
        let footprint = if self.config.guards {
            size.checked_next_multiple_of(4)
                .and_then(|payload| payload.checked_add(PREFIX_SIZE + POSTFIX_SIZE))
        } else {
            Some(size)
        };
        let power = footprint
            .filter(|footprint| *footprint > 0)
            .and_then(usize::checked_next_power_of_two)
            .map(|class| class.trailing_zeros().max(self.config.min_power))
            .filter(|power| *power <= self.config.max_power);
        power.ok_or_else(|| InvalidSizeSnafu { size }.build())
    }

    /// Returns the alignment every object of class `power` is guaranteed.
    fn object_alignment(&self, power: u32) -> usize {
        if self.config.guards {
            PREFIX_SIZE
        } else {
            PAYLOAD_ALIGN.min(1 << power)
        }
    }

    /// Adds a pool to class `power`.
    fn grow(&mut self, power: u32) -> Result<NonNull<Pool>, AllocError> {
        let object_size = 1_usize << power;
        let base_count = (BASE_POOL_BYTES / object_size).max(1);
        let existing = self.chain(power).count();
        let mut count = base_count * existing.max(1);

        let block = loop {
            let request = Pool::bytes_for(power, count).map(|bytes| Range::any(bytes, 0));
            match request.map(|request| self.parent.allocate(request)) {
                Some(Ok(block)) => break block,
                Some(Err(err)) if !err.is_out_of_memory() || count == 1 => return Err(err),
                _ => count = (count / 2).max(1),
            }
        };

        if !block.address.is_multiple_of(mem::align_of::<Pool>()) {
            if let Err(err) = self.parent.release(block.address) {
                log::warn!("failed to return misaligned pool block: {err}");
            }
            return InvalidAddressSnafu {
                address: block.address,
            }
            .fail();
        }

        for retired in &mut self.retired {
            if retired.is_some_and(|stale| overlaps(stale.payload, block)) {
                *retired = None;
            }
        }

        // The parent granted the block to us alone and it is large enough.
        let mut pool = unsafe { Pool::init(block, power, count) };
        unsafe { pool.as_mut() }.next = self.pools[power as usize];
        self.pools[power as usize] = Some(pool);
        log::debug!(
            "new pool of {count} {object_size}-byte objects at {:#x}",
            block.address
        );
        Ok(pool)
    }

    fn unlink(&mut self, power: u32, target: NonNull<Pool>) {
        let mut link = &mut self.pools[power as usize];
        while let Some(mut pool) = *link {
            if pool == target {
                *link = unsafe { pool.as_ref() }.next;
                return;
            }
            link = unsafe { &mut pool.as_mut().next };
        }
    }

    /// Hands an empty pool back to the parent.
    fn retire(&mut self, mut pool: NonNull<Pool>) {
        let (power, block, retired) = {
            let pool = unsafe { pool.as_ref() };
            let retired = Retired {
                payload: pool.payload(),
                object_size: pool.object_size(),
            };
            (pool.power(), pool.block, retired)
        };
        self.unlink(power, pool);
        match self.parent.release(block.address) {
            Ok(()) => {
                self.retired[self.next_retired] = Some(retired);
                self.next_retired = (self.next_retired + 1) % RETIRED;
                log::debug!("released empty pool at {:#x}", block.address);
            }
            Err(err) => {
                log::debug!("parent keeps pool at {:#x}: {err}", block.address);
                unsafe { pool.as_mut() }.next = self.pools[power as usize];
                self.pools[power as usize] = Some(pool);
            }
        }
    }

    /// Finds the pool holding the live object at `address` and returns it
    /// with the start of the object's slot.
    fn locate(&self, address: usize) -> Result<(NonNull<Pool>, usize), AllocError> {
        let pool = self
            .classes()
            .flat_map(|power| self.chain(power))
            .find(|pool| unsafe { pool.as_ref() }.payload().contains(address))
            .ok_or_else(|| self.outside_pools(address))?;

        let pool_ref = unsafe { pool.as_ref() };
        let prefix = self.prefix();
        let offset = address - pool_ref.payload().address;
        ensure!(
            offset % pool_ref.object_size() == prefix,
            InvalidAddressSnafu { address }
        );

        let slot = address - prefix;
        ensure!(
            pool_ref.objects.is_allocated(slot),
            DoubleFreeSnafu { address }
        );
        if self.config.guards {
            ensure!(
                guards_intact(slot, pool_ref.object_size()),
                CorruptedSnafu {
                    address,
                    pool: pool_ref.block.address,
                }
            );
        }
        Ok((pool, slot))
    }

    /// Error for an address no live pool holds. Objects of a recently
    /// retired pool were already released.
    fn outside_pools(&self, address: usize) -> AllocError {
        let prefix = self.prefix();
        let released = self.retired.iter().flatten().any(|retired| {
            retired.payload.contains(address)
                && (address - retired.payload.address) % retired.object_size == prefix
        });
        if released {
            DoubleFreeSnafu { address }.build()
        } else {
            InvalidAddressSnafu { address }.build()
        }
    }
}

fn overlaps(a: Range, b: Range) -> bool {
    a.address < b.end() && b.address < a.end()
}

/// Writes the signatures around an object of `size` bytes in `slot`.
fn write_guards(slot: usize, size: usize) {
    let length = u32::try_from(size).unwrap_or(u32::MAX);
    let postfix = slot + PREFIX_SIZE + size.next_multiple_of(4);
    unsafe {
        ptr::with_exposed_provenance_mut::<u32>(slot).write(SIGNATURE);
        ptr::with_exposed_provenance_mut::<u32>(slot + 4).write(length);
        ptr::with_exposed_provenance_mut::<u32>(postfix).write(SIGNATURE);
    }
}

/// Checks the signatures of the object in `slot`, never reading past the
/// slot.
fn guards_intact(slot: usize, object_size: usize) -> bool {
    let (prefix, length) = unsafe {
        (
            ptr::with_exposed_provenance::<u32>(slot).read(),
            ptr::with_exposed_provenance::<u32>(slot + 4).read(),
        )
    };
    let Some(postfix) = usize::try_from(length)
        .ok()
        .and_then(|length| length.checked_next_multiple_of(4))
        .map(|payload| slot + PREFIX_SIZE + payload)
        .filter(|postfix| postfix + POSTFIX_SIZE <= slot + object_size)
    else {
        return false;
    };
    prefix == SIGNATURE && unsafe { ptr::with_exposed_provenance::<u32>(postfix).read() } == SIGNATURE
}

impl<P> Allocator for PoolAllocator<P>
where
    P: Allocator,
{
    /// Bytes held from the parent, metadata included.
    fn size(&self) -> usize {
        self.classes()
            .flat_map(|power| self.chain(power))
            .map(|pool| unsafe { pool.as_ref() }.block.size)
            .sum()
    }

    /// Bytes of free object slots in existing pools.
    fn available(&self) -> usize {
        self.classes()
            .flat_map(|power| self.chain(power))
            .map(|pool| unsafe { pool.as_ref() }.objects.available())
            .sum()
    }

    fn allocate(&mut self, request: Range) -> Result<Range, AllocError> {
        ensure!(
            request.address == 0,
            InvalidAddressSnafu {
                address: request.address
            }
        );
        let power = self.class_of(request.size)?;
        let guaranteed = self.object_alignment(power);
        ensure!(
            request.alignment == 0
                || (request.alignment.is_power_of_two() && request.alignment <= guaranteed),
            InvalidAlignmentSnafu {
                alignment: request.alignment,
                granularity: guaranteed,
            }
        );

        let free = self
            .chain(power)
            .find(|pool| unsafe { pool.as_ref() }.objects.available() > 0);
        let mut pool = match free {
            Some(pool) => pool,
            None => self.grow(power)?,
        };

        let slot = unsafe { pool.as_mut() }
            .objects
            .allocate(Range::any(1 << power, 0))?;
        if self.config.guards {
            write_guards(slot.address, request.size);
        }

        let address = slot.address + self.prefix();
        log::trace!("pool granted {address:#x} ({} bytes)", request.size);
        Ok(Range::new(address, request.size, request.alignment))
    }

    fn release(&mut self, address: usize) -> Result<(), AllocError> {
        let (mut pool, slot) = self.locate(address).inspect_err(|err| {
            if matches!(
                err,
                AllocError::DoubleFree { .. } | AllocError::Corrupted { .. }
            ) {
                log::error!("{}", Report::new(err));
            }
        })?;

        let pool_ref = unsafe { pool.as_mut() };
        pool_ref.objects.release(slot)?;
        log::trace!("pool released {address:#x}");
        if pool_ref.is_empty() {
            self.retire(pool);
        }
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::alloc::{Layout, alloc, dealloc};

    use super::*;
    use crate::{bit::BitAllocator, bubble::BubbleAllocator};

    const MIB: usize = 1024 * 1024;

    fn with_test_heap<F>(heap_size: usize, test_fn: F)
    where
        F: FnOnce(Range),
    {
        unsafe {
            let layout = Layout::from_size_align(heap_size, 4096).unwrap();
            let heap_start = alloc(layout);
            heap_start.write_bytes(0x11, heap_size);
            test_fn(Range::new(heap_start.expose_provenance(), heap_size, 0));
            dealloc(heap_start, layout);
        }
    }

    fn unguarded() -> PoolConfig {
        PoolConfig {
            guards: false,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn objects_share_a_class() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::with_config(parent, unguarded());
            let a = pool.allocate(Range::any(100, 0)).unwrap();
            let b = pool.allocate(Range::any(128, 0)).unwrap();
            assert_eq!(b.address - a.address, 128);
            assert_eq!(a.size, 100);
            assert_eq!(pool.pool_count(), 1);

            let c = pool.allocate(Range::any(129, 0)).unwrap();
            assert_eq!(pool.pool_count(), 2);
            assert!(c.address.is_multiple_of(16));
        });
    }

    #[test]
    fn guarded_objects_are_aligned_and_usable() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::new(parent);
            let mut objects = Vec::new();
            for size in [1, 7, 16, 20, 64, 200] {
                let object = pool.allocate(Range::any(size, 8)).unwrap();
                assert!(object.address.is_multiple_of(8));
                unsafe {
                    ptr::with_exposed_provenance_mut::<u8>(object.address).write_bytes(0x33, size);
                }
                objects.push(object);
            }
            for object in &objects {
                pool.check(object.address).unwrap();
            }
            for object in objects {
                pool.release(object.address).unwrap();
            }
        });
    }

    #[test]
    fn invalid_requests() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::new(parent);
            let err = pool.allocate(Range::any(0, 0)).unwrap_err();
            assert!(matches!(err, AllocError::InvalidSize { .. }));
            let err = pool.allocate(Range::any(1 << 28, 0)).unwrap_err();
            assert!(matches!(err, AllocError::InvalidSize { .. }));
            let err = pool.allocate(Range::any(32, 16)).unwrap_err();
            assert!(matches!(err, AllocError::InvalidAlignment { .. }));
            let err = pool.allocate(Range::new(heap.address, 32, 0)).unwrap_err();
            assert!(matches!(err, AllocError::InvalidAddress { .. }));
            assert_eq!(pool.pool_count(), 0);
        });
    }

    #[test]
    fn release_rejects_unknown_addresses() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::new(parent);
            let object = pool.allocate(Range::any(24, 0)).unwrap();

            let err = pool.release(heap.address + heap.size - 8).unwrap_err();
            assert!(matches!(err, AllocError::InvalidAddress { .. }));
            let err = pool.release(object.address + 4).unwrap_err();
            assert!(matches!(err, AllocError::InvalidAddress { .. }));
            pool.release(object.address).unwrap();
        });
    }

    #[test]
    fn double_free_is_reported() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::new(parent);
            let keep = pool.allocate(Range::any(24, 0)).unwrap();
            let object = pool.allocate(Range::any(24, 0)).unwrap();
            pool.release(object.address).unwrap();

            let err = pool.release(object.address).unwrap_err();
            assert!(matches!(err, AllocError::DoubleFree { address, .. } if address == object.address));
            pool.release(keep.address).unwrap();
        });
    }

    #[test]
    fn double_free_of_retired_pool_is_reported() {
        with_test_heap(MIB, |heap| {
            let parent = BitAllocator::new(Range::new(heap.address, heap.size, 0), 4096);
            let mut pool = PoolAllocator::new(parent);
            let object = pool.allocate(Range::any(24, 0)).unwrap();
            pool.release(object.address).unwrap();
            assert_eq!(pool.pool_count(), 0);
            assert_eq!(pool.parent().available(), MIB);

            let err = pool.release(object.address).unwrap_err();
            assert!(matches!(err, AllocError::DoubleFree { address, .. } if address == object.address));
            let err = pool.check(object.address).unwrap_err();
            assert!(matches!(err, AllocError::DoubleFree { .. }));
            let err = pool.release(object.address + 4).unwrap_err();
            assert!(matches!(err, AllocError::InvalidAddress { .. }));

            // A new pool over the same block replaces the remembered one.
            pool.allocate(Range::any(24, 0)).unwrap();
            assert!(pool.retired.iter().all(Option::is_none));
        });
    }

    #[test]
    fn overflow_is_detected_locally() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::new(parent);
            let victim = pool.allocate(Range::any(16, 0)).unwrap();
            let neighbour = pool.allocate(Range::any(16, 0)).unwrap();

            // One byte past the payload lands on the trailing signature.
            unsafe {
                ptr::with_exposed_provenance_mut::<u8>(victim.address).write_bytes(0x55, 17);
            }
            let err = pool.check(victim.address).unwrap_err();
            assert!(matches!(err, AllocError::Corrupted { .. }));
            let err = pool.release(victim.address).unwrap_err();
            assert!(matches!(err, AllocError::Corrupted { address, .. } if address == victim.address));

            pool.check(neighbour.address).unwrap();
            pool.release(neighbour.address).unwrap();
        });
    }

    #[test]
    fn smashed_length_is_detected() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::new(parent);
            let object = pool.allocate(Range::any(8, 0)).unwrap();
            unsafe {
                ptr::with_exposed_provenance_mut::<u32>(object.address - 4).write(u32::MAX);
            }
            let err = pool.release(object.address).unwrap_err();
            assert!(matches!(err, AllocError::Corrupted { .. }));
        });
    }

    #[test]
    fn empty_pools_return_to_parent() {
        with_test_heap(MIB, |heap| {
            let parent = BitAllocator::new(Range::new(heap.address, heap.size, 0), 4096);
            let mut pool = PoolAllocator::new(parent);
            let objects: Vec<_> = (0..10)
                .map(|_| pool.allocate(Range::any(48, 0)).unwrap())
                .collect();
            assert_eq!(pool.pool_count(), 1);
            assert!(pool.parent().available() < MIB);
            assert!(pool.size() > 0);

            for object in objects {
                pool.release(object.address).unwrap();
            }
            assert_eq!(pool.pool_count(), 0);
            assert_eq!(pool.parent().available(), MIB);
            assert_eq!(pool.size(), 0);
        });
    }

    #[test]
    fn pools_grow_geometrically() {
        with_test_heap(4 * MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::with_config(parent, unguarded());
            let per_pool = BASE_POOL_BYTES / 256;

            let mut held = 0;
            let mut sizes = Vec::new();
            for _ in 0..4 {
                let before = pool.available();
                pool.allocate(Range::any(256, 0)).unwrap();
                held += 1;
                sizes.push(pool.available() + 256 - before);
                while pool.available() > 0 {
                    pool.allocate(Range::any(256, 0)).unwrap();
                    held += 1;
                }
            }
            assert_eq!(sizes, [per_pool * 256, per_pool * 256, per_pool * 512, per_pool * 768]);
            assert_eq!(held, per_pool * 7);
            assert_eq!(pool.pool_count(), 4);
        });
    }

    #[test]
    fn accounting() {
        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, heap.size, 16));
            let mut pool = PoolAllocator::with_config(parent, unguarded());
            let a = pool.allocate(Range::any(64, 0)).unwrap();
            let per_pool = BASE_POOL_BYTES / 64;
            assert_eq!(pool.available(), (per_pool - 1) * 64);
            assert_eq!(pool.size(), Pool::bytes_for(6, per_pool).unwrap());
            assert_eq!(pool.size(), pool.parent().size() - pool.parent().available());
            pool.release(a.address).unwrap();
            assert_eq!(pool.available(), per_pool * 64);
        });
    }

    #[test]
    fn growth_fills_parent() {
        const METADATA_BUDGET: usize = 16 * 1024;

        with_test_heap(MIB, |heap| {
            let parent = BubbleAllocator::new(Range::new(heap.address, MIB, 16));
            let mut pool = PoolAllocator::with_config(parent, unguarded());
            let mut count = 0;
            let err = loop {
                match pool.allocate(Range::any(64, 0)) {
                    Ok(_) => count += 1,
                    Err(err) => break err,
                }
            };
            assert!(err.is_out_of_memory());
            assert!(count * 64 <= MIB);
            assert!(count >= (MIB - METADATA_BUDGET) / 64, "only {count} objects");
            assert_eq!(pool.available(), 0);
            assert!(pool.size() <= MIB);
        });
    }

    #[test]
    fn set_parent_returns_previous() {
        let mut pool = PoolAllocator::new(BubbleAllocator::new(Range::new(0x1000, 0x1000, 16)));
        let old = pool.set_parent(BubbleAllocator::new(Range::new(0x8000, 0x2000, 16)));
        assert_eq!(old.size(), 0x1000);
        assert_eq!(pool.parent().size(), 0x2000);
    }
}
