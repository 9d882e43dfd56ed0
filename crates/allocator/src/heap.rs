//! Dynamic memory for kernel and user runtimes.
//!
//! [`Heap`] puts a [`PoolAllocator`] behind a spin lock and implements
//! [`GlobalAlloc`] on top of it. It is built from an explicit parent during
//! runtime initialization:
//!
//! ```rust,ignore
//! static PHYSICAL: spin::Once<spin::Mutex<SplitAllocator>> = spin::Once::new();
//!
//! let physical = PHYSICAL.call_once(|| spin::Mutex::new(split));
//! let heap = Heap::new(LowMemory::new(physical));
//! ```
//!
//! Whoever needs memory receives `&heap` (or the physical allocator) from
//! the code that built the chain.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use snafu_utils::Report;
use spin::{Mutex, MutexGuard};

use crate::{
    Allocator, Range,
    pool::{PoolAllocator, PoolConfig},
};

/// Largest alignment a heap object is guaranteed.
pub const MAX_ALIGN: usize = 8;

/// Lock-protected pool allocator usable as a global allocator.
pub struct Heap<P> {
    pool: Mutex<PoolAllocator<P>>,
}

impl<P> Heap<P>
where
    P: Allocator,
{
    pub fn new(parent: P) -> Self {
        Self::with_config(parent, PoolConfig::default())
    }

    pub fn with_config(parent: P, config: PoolConfig) -> Self {
        Self {
            pool: Mutex::new(PoolAllocator::with_config(parent, config)),
        }
    }

    /// Locks the underlying pool allocator.
    pub fn lock(&self) -> MutexGuard<'_, PoolAllocator<P>> {
        self.pool.lock()
    }
}

unsafe impl<P> GlobalAlloc for Heap<P>
where
    P: Allocator + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            log::warn!("heap cannot honor {layout:?}");
            return ptr::null_mut();
        }
        // Objects of a class at least as large as the alignment are aligned.
        let size = layout.size().max(layout.align());
        match self.pool.lock().allocate(Range::any(size, layout.align())) {
            Ok(object) => ptr::with_exposed_provenance_mut(object.address),
            Err(err) => {
                log::debug!("heap allocation of {layout:?} failed: {err}");
                ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(err) = self.pool.lock().release(ptr.expose_provenance()) {
            log::error!("{}", Report::new(err));
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        PhysicalAllocator as _,
        split::{LowMemory, SplitAllocator},
    };

    const PAGE: usize = 4096;

    #[repr(C, align(4096))]
    struct Frame([u8; PAGE]);

    fn memory(pages: usize) -> Vec<Frame> {
        (0..pages).map(|_| Frame([0; PAGE])).collect()
    }

    #[test]
    fn global_alloc_round_trip() {
        let mut frames = memory(32);
        let virt_base = frames.as_mut_ptr().expose_provenance();
        let physical = Mutex::new(SplitAllocator::new(
            Range::new(0x0010_0000, 32 * PAGE, 0),
            Range::new(0x0012_0000, 0, 0),
            PAGE,
            virt_base,
        ));
        let heap = Heap::new(LowMemory::new(&physical));

        unsafe {
            let layout = Layout::from_size_align(40, 8).unwrap();
            let a = heap.alloc(layout);
            let b = heap.alloc(layout);
            assert!(!a.is_null() && !b.is_null());
            assert!(a.addr().is_multiple_of(8) && b.addr().is_multiple_of(8));
            a.write_bytes(0x33, 40);
            b.write_bytes(0x44, 40);
            assert_eq!(a.read(), 0x33);
            heap.dealloc(a, layout);
            heap.dealloc(b, layout);

            let wide = Layout::from_size_align(64, 64).unwrap();
            assert!(heap.alloc(wide).is_null());
        }

        // The empty pool went back to physical memory.
        assert_eq!(heap.lock().pool_count(), 0);
        assert_eq!(physical.lock().available(), 32 * PAGE);
        assert_eq!(
            (&physical).to_physical(virt_base + PAGE),
            0x0010_0000 + PAGE
        );
    }

    #[test]
    fn small_aligned_layouts_use_large_enough_class() {
        let mut frames = memory(16);
        let virt_base = frames.as_mut_ptr().expose_provenance();
        let physical = Mutex::new(SplitAllocator::new(
            Range::new(0x0010_0000, 16 * PAGE, 0),
            Range::new(0x0011_0000, 0, 0),
            PAGE,
            virt_base,
        ));
        let config = PoolConfig {
            guards: false,
            ..PoolConfig::default()
        };
        let heap = Heap::with_config(LowMemory::new(&physical), config);

        unsafe {
            let layout = Layout::from_size_align(1, 8).unwrap();
            let objects: Vec<_> = (0..8).map(|_| heap.alloc(layout)).collect();
            for object in &objects {
                assert!(object.addr().is_multiple_of(8));
            }
            for object in objects {
                heap.dealloc(object, layout);
            }
        }
    }

    #[test]
    fn exhausted_parent_yields_null() {
        let mut frames = memory(4);
        let virt_base = frames.as_mut_ptr().expose_provenance();
        let physical = Mutex::new(SplitAllocator::new(
            Range::new(0x0010_0000, 4 * PAGE, 0),
            Range::new(0x0010_4000, 0, 0),
            PAGE,
            virt_base,
        ));
        let heap = Heap::new(LowMemory::new(&physical));
        unsafe {
            let layout = Layout::from_size_align(8 * PAGE, 8).unwrap();
            assert!(heap.alloc(layout).is_null());
        }
    }
}
