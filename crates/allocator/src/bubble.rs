//! Monotonic allocator that never frees.

use snafu::ensure;

use crate::{
    AllocError, Allocator, InvalidAddressSnafu, InvalidAlignmentSnafu, InvalidSizeSnafu,
    OutOfMemorySnafu, Range,
};

/// Bump allocator over a fixed range.
///
/// Every grant moves the offset forward. [`release`](Allocator::release)
/// always fails, so memory handed out here stays in use for the lifetime of
/// the allocator.
#[derive(Debug)]
pub struct BubbleAllocator {
    base: usize,
    size: usize,
    alignment: usize,
    offset: usize,
}

impl BubbleAllocator {
    /// Creates an allocator over `range`.
    ///
    /// `range.alignment` is the minimum alignment of every grant.
    #[must_use]
    pub fn new(range: Range) -> Self {
        Self {
            base: range.address,
            size: range.size,
            alignment: range.alignment.max(1),
            offset: 0,
        }
    }
}

impl Allocator for BubbleAllocator {
    fn size(&self) -> usize {
        self.size
    }

    fn available(&self) -> usize {
        self.size - self.offset
    }

    fn allocate(&mut self, request: Range) -> Result<Range, AllocError> {
        ensure!(request.size > 0, InvalidSizeSnafu { size: request.size });
        ensure!(
            request.address == 0,
            InvalidAddressSnafu {
                address: request.address
            }
        );
        ensure!(
            request.alignment == 0 || request.alignment.is_power_of_two(),
            InvalidAlignmentSnafu {
                alignment: request.alignment,
                granularity: self.alignment,
            }
        );

        let alignment = request.alignment.max(self.alignment);
        let grant = (self.base + self.offset)
            .checked_next_multiple_of(alignment)
            .and_then(|address| {
                (address - self.base)
                    .checked_add(request.size)
                    .filter(|end| *end <= self.size)
                    .map(|end| (address, end))
            });
        let (address, end) = grant.ok_or_else(|| OutOfMemorySnafu { size: request.size }.build())?;
        self.offset = end;

        log::trace!("bubble allocator granted {address:#x}");
        Ok(Range::new(address, request.size, alignment))
    }

    fn release(&mut self, address: usize) -> Result<(), AllocError> {
        InvalidAddressSnafu { address }.fail()
    }
}
