use super::units::{Alignment, Bytes, MemoryRange};

/// Capability shared by every allocator in the crate.
///
/// Allocation failure is never an error value: an allocator that cannot
/// satisfy a request returns [`MemoryRange::empty()`]. A zero-byte request
/// also yields the empty range.
///
/// Every non-empty block must be handed back exactly once, with the same
/// alignment it was requested with, before the allocator is dropped.
pub trait Allocator {
    /// Allocate `size` bytes aligned to [`Alignment::MAX_FUNDAMENTAL`].
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        self.allocate_aligned(size, Alignment::MAX_FUNDAMENTAL)
    }

    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange;

    /// Return a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// - `block` must have been returned by this exact allocator and not yet
    ///   deallocated.
    /// - `block` must not be accessed after this call.
    unsafe fn deallocate(&mut self, block: MemoryRange) {
        // Safety: forwarded caller contract.
        unsafe { self.deallocate_aligned(block, Alignment::MAX_FUNDAMENTAL) }
    }

    /// Return a block obtained from [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// # Safety
    /// Same as [`deallocate`](Self::deallocate), and `alignment` must match the
    /// one used to allocate the block.
    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment);

    /// True when `block` belongs to memory managed by this allocator.
    fn owns(&self, block: MemoryRange) -> bool;

    /// Advisory upper bound for a single request.
    fn max_allocation_size(&self) -> Bytes;
}

impl<A: Allocator + ?Sized> Allocator for &mut A {
    #[inline]
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        (**self).allocate(size)
    }

    #[inline]
    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        (**self).allocate_aligned(size, alignment)
    }

    #[inline]
    unsafe fn deallocate(&mut self, block: MemoryRange) {
        // Safety: forwarded caller contract.
        unsafe { (**self).deallocate(block) }
    }

    #[inline]
    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        // Safety: forwarded caller contract.
        unsafe { (**self).deallocate_aligned(block, alignment) }
    }

    #[inline]
    fn owns(&self, block: MemoryRange) -> bool {
        (**self).owns(block)
    }

    #[inline]
    fn max_allocation_size(&self) -> Bytes {
        (**self).max_allocation_size()
    }
}

impl<A: Allocator + ?Sized> Allocator for Box<A> {
    #[inline]
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        (**self).allocate(size)
    }

    #[inline]
    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        (**self).allocate_aligned(size, alignment)
    }

    #[inline]
    unsafe fn deallocate(&mut self, block: MemoryRange) {
        // Safety: forwarded caller contract.
        unsafe { (**self).deallocate(block) }
    }

    #[inline]
    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        // Safety: forwarded caller contract.
        unsafe { (**self).deallocate_aligned(block, alignment) }
    }

    #[inline]
    fn owns(&self, block: MemoryRange) -> bool {
        (**self).owns(block)
    }

    #[inline]
    fn max_allocation_size(&self) -> Bytes {
        (**self).max_allocation_size()
    }
}

/// Counts outstanding allocations of the wrapped allocator.
pub struct CountingAllocator<A> {
    inner: A,
    allocation_count: usize,
}

impl<A: Allocator> CountingAllocator<A> {
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocation_count: 0,
        }
    }

    /// Blocks handed out and not yet returned.
    #[inline]
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    #[must_use]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    #[must_use]
    pub fn into_inner(self) -> A {
        self.inner
    }
}

impl<A: Allocator> Allocator for CountingAllocator<A> {
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        let block = self.inner.allocate(size);
        if !block.is_empty() {
            self.allocation_count += 1;
        }
        block
    }

    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        let block = self.inner.allocate_aligned(size, alignment);
        if !block.is_empty() {
            self.allocation_count += 1;
        }
        block
    }

    unsafe fn deallocate(&mut self, block: MemoryRange) {
        debug_assert!(self.allocation_count > 0, "deallocate on an allocator with no live blocks");
        // Safety: forwarded caller contract.
        unsafe { self.inner.deallocate(block) };
        self.allocation_count -= 1;
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        debug_assert!(self.allocation_count > 0, "deallocate on an allocator with no live blocks");
        // Safety: forwarded caller contract.
        unsafe { self.inner.deallocate_aligned(block, alignment) };
        self.allocation_count -= 1;
    }

    fn owns(&self, block: MemoryRange) -> bool {
        self.inner.owns(block)
    }

    fn max_allocation_size(&self) -> Bytes {
        self.inner.max_allocation_size()
    }
}
