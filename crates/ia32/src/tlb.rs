use alloc::vec::Vec;

use crate::VirtAddr;

/// Translation cache that must be told about page table updates.
pub trait Tlb {
    /// Drops the cached translation of the page containing `virt`.
    fn flush(&mut self, virt: VirtAddr);

    /// Drops every cached translation.
    fn flush_all(&mut self);
}

impl<T> Tlb for &mut T
where
    T: Tlb + ?Sized,
{
    fn flush(&mut self, virt: VirtAddr) {
        (**self).flush(virt);
    }

    fn flush_all(&mut self) {
        (**self).flush_all();
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        /// The TLB of the executing IA-32 processor.
        #[derive(Debug)]
        pub struct HardwareTlb {
            _private: (),
        }

        impl HardwareTlb {
            /// # Safety
            ///
            /// Paging must be enabled and the caller must run in ring 0.
            #[must_use]
            pub unsafe fn new() -> Self {
                Self { _private: () }
            }
        }

        impl Tlb for HardwareTlb {
            fn flush(&mut self, virt: VirtAddr) {
                unsafe {
                    core::arch::asm!("invlpg [{}]", in(reg) virt.value(), options(nostack));
                }
            }

            fn flush_all(&mut self) {
                unsafe {
                    core::arch::asm!(
                        "mov {0}, cr3",
                        "mov cr3, {0}",
                        out(reg) _,
                        options(nostack),
                    );
                }
            }
        }
    }
}

/// A recorded TLB invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFlush {
    Page(VirtAddr),
    All,
}

/// TLB stand-in that records invalidations instead of performing them.
///
/// Used where page tables live in ordinary memory, such as on a host.
#[derive(Debug, Default)]
pub struct SoftTlb {
    flushes: Vec<TlbFlush>,
}

impl SoftTlb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every invalidation in the order it was requested.
    #[must_use]
    pub fn flushes(&self) -> &[TlbFlush] {
        &self.flushes
    }

    #[must_use]
    pub fn full_flushes(&self) -> usize {
        self.flushes
            .iter()
            .filter(|flush| **flush == TlbFlush::All)
            .count()
    }

    /// Returns whether the page containing `virt` was invalidated.
    #[must_use]
    pub fn flushed(&self, virt: VirtAddr) -> bool {
        self.flushes
            .iter()
            .any(|flush| *flush == TlbFlush::Page(virt.page_floor()))
    }

    pub fn clear(&mut self) {
        self.flushes.clear();
    }
}

impl Tlb for SoftTlb {
    fn flush(&mut self, virt: VirtAddr) {
        log::trace!("tlb: flush {virt:#x}");
        self.flushes.push(TlbFlush::Page(virt.page_floor()));
    }

    fn flush_all(&mut self) {
        log::trace!("tlb: flush all");
        self.flushes.push(TlbFlush::All);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn invalidate(mut tlb: impl Tlb) {
        tlb.flush(VirtAddr::new(0x1234));
        tlb.flush_all();
        tlb.flush(VirtAddr::new(0x5000));
    }

    #[test]
    fn records_in_order() {
        let mut tlb = SoftTlb::new();
        invalidate(&mut tlb);

        assert_eq!(
            tlb.flushes(),
            [
                TlbFlush::Page(VirtAddr::new(0x1000)),
                TlbFlush::All,
                TlbFlush::Page(VirtAddr::new(0x5000)),
            ]
        );
        assert_eq!(tlb.full_flushes(), 1);
        assert!(tlb.flushed(VirtAddr::new(0x1fff)));
        assert!(!tlb.flushed(VirtAddr::new(0x2000)));

        tlb.clear();
        assert!(tlb.flushes().is_empty());
    }
}
