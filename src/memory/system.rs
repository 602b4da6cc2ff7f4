use super::allocator::Allocator;
use super::units::{Alignment, Bytes, MemoryAddress, MemoryRange};
use std::alloc::Layout;
use std::collections::HashMap;

/// Leaf allocator over the Rust global heap.
///
/// Keeps a table of live blocks so that `owns` can answer exactly and so that
/// `deallocate` can rebuild the original layout without trusting the caller's
/// range size.
pub struct SystemAllocator {
    /// Keyed by block address, value is the allocated size.
    live: HashMap<usize, usize>,
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
        }
    }

    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }
}

impl Allocator for SystemAllocator {
    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        if size.is_zero() {
            return MemoryRange::empty();
        }
        let Ok(layout) = Layout::from_size_align(size.get(), alignment.get()) else {
            return MemoryRange::empty();
        };
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return MemoryRange::empty();
        }
        self.live.insert(ptr as usize, size.get());
        MemoryRange::from_parts(MemoryAddress::from_ptr(ptr), size)
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        let Some(size) = self.live.remove(&block.begin().get()) else {
            debug_assert!(false, "Block {block:?} does not belong to this SystemAllocator");
            return;
        };
        debug_assert!(
            block.size().get() <= size,
            "Block {block:?} is larger than its allocation ({size} bytes)"
        );
        // Safety: the layout matches the allocation (caller passes the same alignment).
        unsafe {
            std::alloc::dealloc(
                block.as_ptr(),
                Layout::from_size_align_unchecked(size, alignment.get()),
            );
        }
    }

    fn owns(&self, block: MemoryRange) -> bool {
        self.live
            .get(&block.begin().get())
            .is_some_and(|&size| block.size().get() <= size)
    }

    fn max_allocation_size(&self) -> Bytes {
        Bytes::new(isize::MAX as usize)
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        debug_assert!(
            self.live.is_empty(),
            "SystemAllocator dropped with {} live blocks",
            self.live.len()
        );
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_system_alloc_aligned() {
        let mut system = SystemAllocator::new();
        let align = Alignment::new(4096).unwrap();
        let block = system.allocate_aligned(Bytes::new(100), align);
        assert!(!block.is_empty());
        assert!(block.begin().is_aligned_to(align));
        assert_eq!(block.size(), Bytes::new(100));
        assert!(system.owns(block));

        // Safety: Test code.
        unsafe {
            block.as_ptr().write_bytes(0xCD, 100);
            system.deallocate_aligned(block, align);
        }
        assert!(!system.owns(block));
        assert_eq!(system.live_blocks(), 0);
    }

    #[test]
    fn test_system_zero_size_is_empty() {
        let mut system = SystemAllocator::new();
        assert!(system.allocate(Bytes::ZERO).is_empty());
    }

    #[test]
    fn test_system_owns_rejects_foreign() {
        let system = SystemAllocator::new();
        let foreign = MemoryRange::from_parts(MemoryAddress::new(0x1000), Bytes::new(8));
        assert!(!system.owns(foreign));
    }
}
