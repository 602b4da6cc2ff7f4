use super::allocator::Allocator;
use super::error::MemoryError;
use super::stats;
use super::units::{Alignment, Bytes, MemoryAddress, MemoryRange};
use super::vm::{self, VirtualBuffer};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr;

/// Free-list node stored inside a released page. The page addresses follow
/// the header and fill the rest of the page.
#[repr(C)]
struct FreeListNode {
    next: *mut FreeListNode,
    count: usize,
}

const NODE_HEADER: Bytes = Bytes::of::<FreeListNode>();

impl FreeListNode {
    /// # Safety
    /// `node` must be a live node page.
    unsafe fn pages(node: *mut FreeListNode) -> *mut usize {
        // Safety: the page array starts right after the header, inside the page.
        unsafe { node.cast::<u8>().add(NODE_HEADER.get()).cast::<usize>() }
    }
}

/// Hands out one OS page per allocation from a fixed reservation.
///
/// Released pages form a LIFO cache. A released page is either recorded in
/// the current free-list node and decommitted, or, when that node is full or
/// missing, becomes the next node itself and stays committed.
pub struct VirtualMemoryResource {
    buffer: VirtualBuffer,
    /// Start of the never-used tail of the reservation.
    cursor: MemoryAddress,
    free_list: *mut FreeListNode,
    page_size: Bytes,
    page_alignment: Alignment,
    node_capacity: usize,
    committed: Bytes,
    #[cfg(debug_assertions)]
    live_mask: FixedBitSet,
}

// Safety: the free-list nodes live in the owned reservation.
unsafe impl Send for VirtualMemoryResource {}

impl VirtualMemoryResource {
    /// Reserve `capacity` bytes, rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails.
    pub fn new(capacity: Bytes) -> Result<Self, MemoryError> {
        let buffer = VirtualBuffer::reserve(capacity)?;
        let page_size = vm::page_size();
        #[cfg(debug_assertions)]
        let pages = buffer.range().size() / page_size;
        Ok(Self {
            cursor: buffer.range().begin(),
            buffer,
            free_list: ptr::null_mut(),
            page_size,
            page_alignment: vm::page_alignment(),
            node_capacity: (page_size - NODE_HEADER) / Bytes::of::<usize>(),
            committed: Bytes::ZERO,
            #[cfg(debug_assertions)]
            live_mask: FixedBitSet::with_capacity(pages),
        })
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> Bytes {
        self.page_size
    }

    /// Pages currently backed: live pages plus free-list node pages.
    #[must_use]
    pub fn committed_bytes(&self) -> Bytes {
        self.committed
    }

    #[must_use]
    pub fn range(&self) -> MemoryRange {
        self.buffer.range()
    }

    #[cfg(debug_assertions)]
    fn page_index(&self, page: MemoryAddress) -> usize {
        page.offset_from(self.buffer.range().begin()) / self.page_size
    }

    /// `block` lies on a page taken from the reservation at some point.
    fn is_carved(&self, block: MemoryRange) -> bool {
        !block.is_empty()
            && block.size() <= self.page_size
            && block.begin().is_aligned_to(self.page_alignment)
            && MemoryRange::new(self.buffer.range().begin(), self.cursor).contains(&block)
    }

    fn commit_page(&mut self, page: MemoryAddress) -> bool {
        let window = MemoryRange::from_parts(page, self.page_size);
        // Safety: page is a page-aligned page of the owned reservation.
        match unsafe { vm::commit(window, &stats::RESOURCE_COMMITTED) } {
            Ok(()) => {
                self.committed += self.page_size;
                true
            }
            Err(e) => {
                log::warn!("VirtualMemoryResource failed to commit {window:?}: {e}");
                false
            }
        }
    }

    fn take_page(&mut self) -> Option<MemoryAddress> {
        let node = self.free_list;
        if !node.is_null() {
            // Safety: free_list points at a live node page.
            unsafe {
                let count = (*node).count;
                if count == 0 {
                    // Nothing recorded: the node page itself goes out, still committed.
                    self.free_list = (*node).next;
                    return Some(MemoryAddress::from_ptr(node));
                }
                let page = MemoryAddress::new(FreeListNode::pages(node).add(count - 1).read());
                if !self.commit_page(page) {
                    return None;
                }
                (*node).count = count - 1;
                return Some(page);
            }
        }

        if self.cursor >= self.buffer.range().end() {
            return None;
        }
        let page = self.cursor;
        if !self.commit_page(page) {
            return None;
        }
        self.cursor += self.page_size;
        Some(page)
    }
}

impl Allocator for VirtualMemoryResource {
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        self.allocate_aligned(size, self.page_alignment)
    }

    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        if size.is_zero() || size > self.page_size || alignment > self.page_alignment {
            return MemoryRange::empty();
        }
        let Some(page) = self.take_page() else {
            return MemoryRange::empty();
        };
        #[cfg(debug_assertions)]
        {
            let index = self.page_index(page);
            self.live_mask.insert(index);
        }
        MemoryRange::from_parts(page, size)
    }

    unsafe fn deallocate(&mut self, block: MemoryRange) {
        // Safety: forwarded caller contract.
        unsafe { self.deallocate_aligned(block, self.page_alignment) }
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, _alignment: Alignment) {
        debug_assert!(
            self.is_carved(block),
            "Block {block:?} does not belong to this VirtualMemoryResource"
        );
        let page = block.begin();
        #[cfg(debug_assertions)]
        {
            let index = self.page_index(page);
            assert!(
                self.live_mask.contains(index),
                "Double free detected in VirtualMemoryResource for block {block:?}"
            );
            self.live_mask.set(index, false);
        }
        let node = self.free_list;

        // Safety: node (when non-null) is a live node page; `page` is a live
        // page the caller no longer uses.
        unsafe {
            if !node.is_null() && (*node).count < self.node_capacity {
                let count = (*node).count;
                FreeListNode::pages(node).add(count).write(page.get());
                (*node).count = count + 1;

                let window = MemoryRange::from_parts(page, self.page_size);
                match vm::decommit(window, &stats::RESOURCE_COMMITTED) {
                    Ok(()) => self.committed = self.committed.saturating_sub(self.page_size),
                    Err(e) => log::warn!("VirtualMemoryResource failed to decommit {window:?}: {e}"),
                }
                return;
            }

            let fresh = page.as_ptr::<FreeListNode>();
            fresh.write(FreeListNode {
                next: node,
                count: 0,
            });
            self.free_list = fresh;
        }
    }

    /// Release builds only check that `block` is a page carved from the
    /// reservation; debug builds also reject released pages.
    fn owns(&self, block: MemoryRange) -> bool {
        let carved = self.is_carved(block);
        #[cfg(debug_assertions)]
        {
            carved && self.live_mask.contains(self.page_index(block.begin()))
        }
        #[cfg(not(debug_assertions))]
        {
            carved
        }
    }

    fn max_allocation_size(&self) -> Bytes {
        self.page_size
    }
}

impl Drop for VirtualMemoryResource {
    fn drop(&mut self) {
        let committed = self.committed.get();
        if committed > 0 {
            stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
            stats::sub_saturating(&stats::RESOURCE_COMMITTED, committed);
        }
    }
}
