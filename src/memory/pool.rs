use super::allocator::Allocator;
use super::error::MemoryError;
use super::linear::LinearAllocator;
use super::units::{Alignment, Bytes, MemoryAddress, MemoryRange};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

/// Storage strategy for the addresses of released slots.
pub trait FreeList: Default {
    /// True when the list stores its links inside the released slots.
    const INTRUSIVE: bool;

    /// # Safety
    /// For an intrusive list, `slot` must be writable for at least one `usize`
    /// and must stay untouched until it is popped again.
    unsafe fn push(&mut self, slot: MemoryAddress);

    /// # Safety
    /// For an intrusive list, every slot currently on the list must still be
    /// readable.
    unsafe fn pop(&mut self) -> Option<MemoryAddress>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Singly linked list threaded through the released slots themselves.
pub struct IntrusiveFreeList {
    head: MemoryAddress,
    len: usize,
}

impl Default for IntrusiveFreeList {
    fn default() -> Self {
        Self {
            head: MemoryAddress::NULL,
            len: 0,
        }
    }
}

impl FreeList for IntrusiveFreeList {
    const INTRUSIVE: bool = true;

    unsafe fn push(&mut self, slot: MemoryAddress) {
        // Safety: caller guarantees the slot is writable.
        unsafe { slot.as_ptr::<usize>().write(self.head.get()) };
        self.head = slot;
        self.len += 1;
    }

    unsafe fn pop(&mut self) -> Option<MemoryAddress> {
        if self.head.is_null() {
            return None;
        }
        let slot = self.head;
        // Safety: caller guarantees listed slots are readable.
        self.head = MemoryAddress::new(unsafe { slot.as_ptr::<usize>().read() });
        self.len -= 1;
        Some(slot)
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Released slot addresses kept on the heap, so slots may be decommitted.
#[derive(Default)]
pub struct NonIntrusiveFreeList {
    slots: Vec<MemoryAddress>,
}

impl FreeList for NonIntrusiveFreeList {
    const INTRUSIVE: bool = false;

    unsafe fn push(&mut self, slot: MemoryAddress) {
        self.slots.push(slot);
    }

    unsafe fn pop(&mut self) -> Option<MemoryAddress> {
        self.slots.pop()
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Fixed-size slots carved from a [`LinearAllocator`].
///
/// Released slots are reused last-in first-out. Slots are aligned to the
/// largest power of two dividing the slot size.
pub struct PoolAllocator<F = IntrusiveFreeList> {
    slots: LinearAllocator,
    slot_size: Bytes,
    slot_alignment: Alignment,
    /// Address of slot 0.
    origin: MemoryAddress,
    free_list: F,
    live: usize,
    #[cfg(debug_assertions)]
    live_mask: FixedBitSet,
}

impl<F: FreeList> PoolAllocator<F> {
    /// Pool of `slot_size` slots inside a fresh reservation of `capacity`
    /// bytes. Slots are committed as they are first carved.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails or the slot size is unusable.
    pub fn new(slot_size: Bytes, capacity: Bytes) -> Result<Self, MemoryError> {
        Self::with_slots(LinearAllocator::new(capacity)?, slot_size)
    }

    /// Like [`new`](Self::new) but never commits; the caller backs slots itself.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails or the slot size is unusable.
    pub fn uncommitted(slot_size: Bytes, capacity: Bytes) -> Result<Self, MemoryError> {
        Self::with_slots(LinearAllocator::uncommitted(capacity)?, slot_size)
    }

    /// Pool over caller-owned memory.
    ///
    /// # Safety
    /// Same contract as [`LinearAllocator::over`].
    ///
    /// # Errors
    ///
    /// Returns `MemoryError` if the slot size is unusable.
    pub unsafe fn over(range: MemoryRange, slot_size: Bytes) -> Result<Self, MemoryError> {
        // Safety: forwarded caller contract.
        Self::with_slots(unsafe { LinearAllocator::over(range) }, slot_size)
    }

    fn with_slots(slots: LinearAllocator, slot_size: Bytes) -> Result<Self, MemoryError> {
        if slot_size.is_zero() {
            return Err(MemoryError::configuration("pool slot size must be non-zero"));
        }
        if F::INTRUSIVE && slot_size < Bytes::of::<usize>() {
            return Err(MemoryError::configuration(format!(
                "intrusive pool slots must hold a pointer, got {slot_size}"
            )));
        }
        let slot_alignment = Alignment::largest_dividing(slot_size);
        let range = slots.range();
        let origin = range.begin().align_up(slot_alignment).min(range.end());
        #[cfg(debug_assertions)]
        let capacity = range.end().offset_from(origin) / slot_size;

        Ok(Self {
            slots,
            slot_size,
            slot_alignment,
            origin,
            free_list: F::default(),
            live: 0,
            #[cfg(debug_assertions)]
            live_mask: FixedBitSet::with_capacity(capacity),
        })
    }

    #[inline]
    #[must_use]
    pub fn slot_size(&self) -> Bytes {
        self.slot_size
    }

    #[inline]
    #[must_use]
    pub fn slot_alignment(&self) -> Alignment {
        self.slot_alignment
    }

    /// Slots handed out and not yet returned.
    #[inline]
    #[must_use]
    pub fn live_slots(&self) -> usize {
        self.live
    }

    /// Slots waiting on the free list.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.free_list.len()
    }

    /// Whole range the slots are carved from.
    #[must_use]
    pub fn range(&self) -> MemoryRange {
        self.slots.range()
    }

    fn slot_index(&self, slot: MemoryAddress) -> Option<usize> {
        if slot < self.origin || !self.slots.allocated().contains_address(slot) {
            return None;
        }
        let offset = slot.offset_from(self.origin);
        offset.is_multiple_of(self.slot_size).then(|| offset / self.slot_size)
    }

    fn take_slot(&mut self) -> Option<MemoryAddress> {
        // Safety: intrusive lists only hold slots this pool released, which
        // stay readable while listed.
        if let Some(slot) = unsafe { self.free_list.pop() } {
            return Some(slot);
        }
        let carved = self.slots.allocate_aligned(self.slot_size, self.slot_alignment);
        (!carved.is_empty()).then(|| carved.begin())
    }
}

impl<F: FreeList> Allocator for PoolAllocator<F> {
    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        if size.is_zero() || size > self.slot_size || alignment > self.slot_alignment {
            return MemoryRange::empty();
        }
        let Some(slot) = self.take_slot() else {
            return MemoryRange::empty();
        };
        #[cfg(debug_assertions)]
        if let Some(index) = self.slot_index(slot) {
            self.live_mask.insert(index);
        }
        self.live += 1;
        MemoryRange::from_parts(slot, size)
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, _alignment: Alignment) {
        let Some(_index) = self.slot_index(block.begin()) else {
            debug_assert!(false, "Block {block:?} does not belong to this PoolAllocator");
            return;
        };
        debug_assert!(
            block.size() <= self.slot_size,
            "Block {block:?} is larger than the slot size {}",
            self.slot_size
        );
        #[cfg(debug_assertions)]
        {
            assert!(
                self.live_mask.contains(_index),
                "Double free detected in PoolAllocator for block {block:?}"
            );
            self.live_mask.set(_index, false);
        }
        // Safety: the slot was handed out by this pool and the caller no
        // longer uses it.
        unsafe { self.free_list.push(block.begin()) };
        self.live -= 1;
    }

    fn owns(&self, block: MemoryRange) -> bool {
        if block.is_empty() || block.size() > self.slot_size {
            return false;
        }
        let Some(_index) = self.slot_index(block.begin()) else {
            return false;
        };
        #[cfg(debug_assertions)]
        {
            self.live_mask.contains(_index)
        }
        #[cfg(not(debug_assertions))]
        {
            true
        }
    }

    fn max_allocation_size(&self) -> Bytes {
        self.slot_size
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm;

    #[test]
    fn test_pool_lifo_reuse() {
        let mut pool: PoolAllocator = PoolAllocator::new(Bytes::new(64), vm::page_size()).unwrap();
        let a = pool.allocate(Bytes::new(64));
        let b = pool.allocate(Bytes::new(10));
        assert_ne!(a.begin(), b.begin());
        assert_eq!(b.size(), Bytes::new(10));
        assert_eq!(pool.live_slots(), 2);

        // Safety: Test code.
        unsafe {
            pool.deallocate(a);
            pool.deallocate(b);
        }
        assert_eq!(pool.free_slots(), 2);
        assert_eq!(pool.allocate(Bytes::new(8)).begin(), b.begin());
        assert_eq!(pool.allocate(Bytes::new(8)).begin(), a.begin());
    }

    #[test]
    fn test_pool_rejects_oversized_and_overaligned() {
        let mut pool: PoolAllocator = PoolAllocator::new(Bytes::new(48), vm::page_size()).unwrap();
        assert_eq!(pool.slot_alignment(), Alignment::new(16).unwrap());
        assert!(pool.allocate(Bytes::new(49)).is_empty());
        assert!(
            pool.allocate_aligned(Bytes::new(8), Alignment::new(32).unwrap())
                .is_empty()
        );
        assert_eq!(pool.live_slots(), 0);
    }

    #[test]
    fn test_pool_exhaustion() {
        let page = vm::page_size();
        let mut pool: PoolAllocator<NonIntrusiveFreeList> =
            PoolAllocator::new(page / 4, page).unwrap();
        let blocks: Vec<_> = (0..4).map(|_| pool.allocate(page / 4)).collect();
        assert!(blocks.iter().all(|b| !b.is_empty()));
        assert!(pool.allocate(Bytes::new(1)).is_empty());

        // Safety: Test code.
        unsafe { pool.deallocate(blocks[2]) };
        assert_eq!(pool.allocate(Bytes::new(1)).begin(), blocks[2].begin());
    }

    #[test]
    fn test_pool_owns_tracks_live_slots() {
        let mut pool: PoolAllocator = PoolAllocator::new(Bytes::new(32), vm::page_size()).unwrap();
        let a = pool.allocate(Bytes::new(32));
        assert!(pool.owns(a));
        let misaligned = MemoryRange::from_parts(a.begin() + Bytes::new(8), Bytes::new(8));
        assert!(!pool.owns(misaligned));

        // Safety: Test code.
        unsafe { pool.deallocate(a) };
        #[cfg(debug_assertions)]
        assert!(!pool.owns(a));
    }

    #[test]
    fn test_pool_over_borrowed_range() {
        let mut storage = vec![0u64; 64];
        let range = MemoryRange::from_parts(
            MemoryAddress::from_ptr(storage.as_mut_ptr()),
            Bytes::new(storage.len() * 8),
        );
        // Safety: storage outlives the pool.
        let mut pool: PoolAllocator =
            unsafe { PoolAllocator::over(range, Bytes::new(64)) }.unwrap();
        let mut count = 0;
        while !pool.allocate_aligned(Bytes::new(64), Alignment::new(64).unwrap()).is_empty() {
            count += 1;
        }
        // The slice is only 8-aligned, so the first slot may be pushed forward.
        assert!((7..=8).contains(&count));
        drop(pool);
        drop(storage);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Double free detected")]
    fn test_pool_double_free_panics() {
        let mut pool: PoolAllocator = PoolAllocator::new(Bytes::new(32), vm::page_size()).unwrap();
        let a = pool.allocate(Bytes::new(32));
        // Safety: Test code; the second call is the violation under test.
        unsafe {
            pool.deallocate(a);
            pool.deallocate(a);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "must hold a pointer")]
    fn test_pool_intrusive_slot_too_small() {
        let _ = PoolAllocator::<IntrusiveFreeList>::new(Bytes::new(4), vm::page_size());
    }

    #[test]
    fn test_pool_non_intrusive_allows_tiny_slots() {
        let mut pool: PoolAllocator<NonIntrusiveFreeList> =
            PoolAllocator::new(Bytes::new(4), vm::page_size()).unwrap();
        let a = pool.allocate_aligned(Bytes::new(4), Alignment::new(4).unwrap());
        assert!(!a.is_empty());
        // Safety: Test code.
        unsafe { pool.deallocate_aligned(a, Alignment::new(4).unwrap()) };
    }
}
