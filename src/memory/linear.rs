use super::allocator::Allocator;
use super::error::MemoryError;
use super::stats;
use super::units::{Alignment, Bytes, MemoryAddress, MemoryRange};
use super::vm::{self, VirtualBuffer};

/// A bump allocator over one contiguous range.
///
/// Memory is handed out in address order. Only the most recent block can be
/// given back (stack order); any other deallocation is a no-op and the space
/// is recovered by [`reset`](Self::reset).
pub struct LinearAllocator {
    range: MemoryRange,
    cursor: MemoryAddress,
    /// Commit frontier. Everything in `[range.begin, committed)` is backed.
    committed: MemoryAddress,
    commit_on_demand: bool,
    /// Owned reservation, `None` when the range is borrowed.
    buffer: Option<VirtualBuffer>,
}

// Safety: LinearAllocator exclusively owns (or was handed exclusive use of) its range.
unsafe impl Send for LinearAllocator {}

impl LinearAllocator {
    /// Reserve `capacity` bytes and commit pages as the cursor reaches them.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails.
    pub fn new(capacity: Bytes) -> Result<Self, MemoryError> {
        let buffer = VirtualBuffer::reserve(capacity)?;
        Ok(Self::from_buffer(buffer, true))
    }

    /// Reserve `capacity` bytes and never commit them.
    ///
    /// Used when a layer above decides which pages get physical backing.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails.
    pub fn uncommitted(capacity: Bytes) -> Result<Self, MemoryError> {
        let buffer = VirtualBuffer::reserve(capacity)?;
        Ok(Self::from_buffer(buffer, false))
    }

    /// Bump-allocate inside memory owned by the caller.
    ///
    /// # Safety
    /// `range` must be readable and writable for the lifetime of the
    /// allocator and must not be used by anyone else meanwhile.
    #[must_use]
    pub unsafe fn over(range: MemoryRange) -> Self {
        Self {
            range,
            cursor: range.begin(),
            committed: range.end(),
            commit_on_demand: false,
            buffer: None,
        }
    }

    fn from_buffer(buffer: VirtualBuffer, commit_on_demand: bool) -> Self {
        let range = buffer.range();
        Self {
            range,
            cursor: range.begin(),
            committed: range.begin(),
            commit_on_demand,
            buffer: Some(buffer),
        }
    }

    /// Whole range managed by this allocator, allocated or not.
    #[must_use]
    pub fn range(&self) -> MemoryRange {
        self.range
    }

    /// Prefix of the range handed out so far.
    #[must_use]
    pub fn allocated(&self) -> MemoryRange {
        MemoryRange::new(self.range.begin(), self.cursor)
    }

    /// Bytes this allocator committed itself (zero for borrowed or
    /// uncommitted ranges).
    #[must_use]
    pub fn committed_bytes(&self) -> Bytes {
        if self.commit_on_demand {
            self.committed.offset_from(self.range.begin())
        } else {
            Bytes::ZERO
        }
    }

    /// Rewind to the beginning. Every block handed out so far is invalidated.
    pub fn reset(&mut self) {
        self.cursor = self.range.begin();
    }

    /// Decommit pages past the cursor. No-op unless pages are committed on demand.
    pub fn trim(&mut self) {
        if !self.commit_on_demand {
            return;
        }
        let retain = self.cursor.align_up(vm::page_alignment());
        if retain < self.committed {
            let window = MemoryRange::new(retain, self.committed);
            // Safety: window is page-aligned, committed, and past every live block.
            match unsafe { vm::decommit(window, &stats::LINEAR_COMMITTED) } {
                Ok(()) => self.committed = retain,
                Err(e) => log::warn!("LinearAllocator::trim failed to decommit {window:?}: {e}"),
            }
        }
    }

    fn ensure_committed(&mut self, end: MemoryAddress) -> bool {
        if !self.commit_on_demand || end <= self.committed {
            return true;
        }
        let target = end.align_up(vm::page_alignment()).min(self.range.end());
        let window = MemoryRange::new(self.committed, target);
        // Safety: window is page-aligned and inside the owned reservation.
        match unsafe { vm::commit(window, &stats::LINEAR_COMMITTED) } {
            Ok(()) => {
                self.committed = target;
                true
            }
            Err(e) => {
                log::warn!("LinearAllocator failed to commit {window:?}: {e}");
                false
            }
        }
    }
}

impl Allocator for LinearAllocator {
    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        if size.is_zero() {
            return MemoryRange::empty();
        }
        let start = self.cursor.align_up(alignment);
        let Some(end) = start.checked_add(size) else {
            return MemoryRange::empty();
        };
        if start < self.cursor || end > self.range.end() {
            return MemoryRange::empty();
        }
        if !self.ensure_committed(end) {
            return MemoryRange::empty();
        }
        self.cursor = end;
        MemoryRange::new(start, end)
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, _alignment: Alignment) {
        debug_assert!(
            self.owns(block),
            "Block {block:?} does not belong to this LinearAllocator"
        );
        if block.end() == self.cursor {
            self.cursor = block.begin();
        }
    }

    fn owns(&self, block: MemoryRange) -> bool {
        self.allocated().contains(&block)
    }

    fn max_allocation_size(&self) -> Bytes {
        self.range.end().offset_from(self.cursor)
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        // The reservation itself is released by `buffer`; only the commit
        // accounting is ours.
        if self.buffer.is_some() {
            let committed = self.committed_bytes().get();
            if committed > 0 {
                stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
                stats::sub_saturating(&stats::LINEAR_COMMITTED, committed);
            }
        }
    }
}
