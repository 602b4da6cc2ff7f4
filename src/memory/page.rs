use super::allocator::Allocator;
use super::error::MemoryError;
use super::pool::{FreeList, IntrusiveFreeList, NonIntrusiveFreeList, PoolAllocator};
use super::stats;
use super::units::{Alignment, Bytes, MemoryAddress, MemoryRange};
use super::vm;

/// Default reservation for a page allocator: 64 MiB.
const DEFAULT_CAPACITY: Bytes = Bytes::mib(64);

pub struct PageAllocatorConfig {
    /// Address space reserved up front. Default: 64 MiB.
    pub capacity: Bytes,

    /// Slot size handed out per allocation. Must be a multiple of the OS page
    /// size. Default: 0 (= OS page size).
    pub page_size: Bytes,
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            page_size: Bytes::ZERO,
        }
    }
}

impl PageAllocatorConfig {
    fn resolved_page_size(&self) -> Bytes {
        if self.page_size.is_zero() {
            vm::page_size()
        } else {
            self.page_size
        }
    }
}

/// Decides when the pages behind a block get physical backing.
pub trait PageAllocatorPolicy: Default {
    /// Free-list strategy of the underlying pool. Must be non-intrusive when
    /// released pages may be decommitted.
    type FreeList: FreeList;

    /// Back `block` before it is handed out.
    ///
    /// # Safety
    /// `block` must lie inside a reservation owned by the caller.
    unsafe fn commit(&mut self, block: MemoryRange, page_size: Bytes) -> Result<(), MemoryError>;

    /// Called before `block` goes back to the pool.
    ///
    /// # Safety
    /// `block` must have been committed through [`commit`](Self::commit) and
    /// hold nothing still in use.
    unsafe fn decommit(&mut self, block: MemoryRange, page_size: Bytes)
    -> Result<(), MemoryError>;

    /// Kernel commit calls issued so far.
    fn commit_count(&self) -> usize;

    /// Kernel decommit calls issued so far.
    fn decommit_count(&self) -> usize;

    /// Bytes currently committed through this policy.
    fn committed_bytes(&self) -> Bytes;
}

/// Commit window for `block`: the block widened to the largest power of two
/// dividing the slot size, so never past the slot. Power-of-two slots are
/// committed whole; other multi-page slots only on the pages the block
/// touches.
fn commit_window(block: MemoryRange, page_size: Bytes) -> MemoryRange {
    block.align_outward(Alignment::largest_dividing(page_size))
}

/// Commits each page once, the first time an allocation reaches it, and
/// never decommits.
///
/// Everything below the high-water mark stays committed, so repeated
/// allocate/deallocate cycles cost no kernel calls.
pub struct FastPageAllocatorPolicy {
    base: MemoryAddress,
    high_water: MemoryAddress,
    commits: usize,
}

impl Default for FastPageAllocatorPolicy {
    fn default() -> Self {
        Self {
            base: MemoryAddress::NULL,
            high_water: MemoryAddress::NULL,
            commits: 0,
        }
    }
}

impl PageAllocatorPolicy for FastPageAllocatorPolicy {
    type FreeList = IntrusiveFreeList;

    unsafe fn commit(&mut self, block: MemoryRange, page_size: Bytes) -> Result<(), MemoryError> {
        let window = commit_window(block, page_size);
        if self.high_water.is_null() {
            // Slots are carved in address order: the first block is the lowest.
            self.base = window.begin();
            self.high_water = window.begin();
        }
        if window.end() <= self.high_water {
            return Ok(());
        }
        let grow = MemoryRange::new(self.high_water, window.end());
        // Safety: grow lies inside the caller's reservation.
        unsafe { vm::commit(grow, &stats::PAGE_ALLOCATOR_COMMITTED)? };
        self.high_water = window.end();
        self.commits += 1;
        Ok(())
    }

    unsafe fn decommit(
        &mut self,
        _block: MemoryRange,
        _page_size: Bytes,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    fn commit_count(&self) -> usize {
        self.commits
    }

    fn decommit_count(&self) -> usize {
        0
    }

    fn committed_bytes(&self) -> Bytes {
        self.high_water.offset_from(self.base)
    }
}

/// Commits the pages covering a block on every allocation and decommits them
/// on every deallocation.
#[derive(Default)]
pub struct CompactPageAllocatorPolicy {
    commits: usize,
    decommits: usize,
    committed: Bytes,
}

impl PageAllocatorPolicy for CompactPageAllocatorPolicy {
    type FreeList = NonIntrusiveFreeList;

    unsafe fn commit(&mut self, block: MemoryRange, page_size: Bytes) -> Result<(), MemoryError> {
        let window = commit_window(block, page_size);
        // Safety: window lies inside the caller's reservation.
        unsafe { vm::commit(window, &stats::PAGE_ALLOCATOR_COMMITTED)? };
        self.commits += 1;
        self.committed += window.size();
        Ok(())
    }

    unsafe fn decommit(&mut self, block: MemoryRange, page_size: Bytes) -> Result<(), MemoryError> {
        let window = commit_window(block, page_size);
        // Safety: same window that `commit` backed for this block.
        unsafe { vm::decommit(window, &stats::PAGE_ALLOCATOR_COMMITTED)? };
        self.decommits += 1;
        self.committed = self.committed.saturating_sub(window.size());
        Ok(())
    }

    fn commit_count(&self) -> usize {
        self.commits
    }

    fn decommit_count(&self) -> usize {
        self.decommits
    }

    fn committed_bytes(&self) -> Bytes {
        self.committed
    }
}

/// Page-quantized allocator over one fixed reservation.
///
/// Each allocation takes a whole `page_size` slot from the pool; the policy
/// decides when the slot's pages are backed. The returned block is
/// `[slot, slot + size)`.
pub struct PageAllocator<P: PageAllocatorPolicy = FastPageAllocatorPolicy> {
    pool: PoolAllocator<P::FreeList>,
    policy: P,
    page_size: Bytes,
}

impl<P: PageAllocatorPolicy> PageAllocator<P> {
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails.
    pub fn new() -> Result<Self, MemoryError> {
        Self::with_config(PageAllocatorConfig::default())
    }

    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if `page_size` is not a multiple of
    /// the OS page size or `capacity` cannot hold a single page, and
    /// reservation errors otherwise.
    pub fn with_config(config: PageAllocatorConfig) -> Result<Self, MemoryError> {
        let page_size = config.resolved_page_size();
        if !page_size.is_multiple_of(vm::page_size()) {
            return Err(MemoryError::configuration(format!(
                "page size {page_size} is not a multiple of the OS page size {}",
                vm::page_size()
            )));
        }
        if config.capacity < page_size {
            return Err(MemoryError::configuration(format!(
                "capacity {} cannot hold a single {page_size} page",
                config.capacity
            )));
        }
        let pool = PoolAllocator::uncommitted(page_size, config.capacity)?;
        Ok(Self {
            pool,
            policy: P::default(),
            page_size,
        })
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> Bytes {
        self.page_size
    }

    #[must_use]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Pages handed out and not yet returned.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.pool.live_slots()
    }
}

impl<P: PageAllocatorPolicy> Allocator for PageAllocator<P> {
    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        let block = self.pool.allocate_aligned(size, alignment);
        if block.is_empty() {
            return block;
        }
        // Safety: the block is a slot of the pool's reservation.
        if let Err(e) = unsafe { self.policy.commit(block, self.page_size) } {
            log::warn!("PageAllocator failed to commit {block:?}: {e}");
            if P::FreeList::INTRUSIVE {
                // The list would write its link into the uncommitted slot.
                log::warn!("PageAllocator abandons slot {block:?}");
            } else {
                // Safety: the slot was never handed out.
                unsafe { self.pool.deallocate_aligned(block, alignment) };
            }
            return MemoryRange::empty();
        }
        block
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        debug_assert!(
            self.pool.owns(block),
            "Block {block:?} does not belong to this PageAllocator"
        );
        // Safety: caller guarantees the block is ours and no longer used.
        if let Err(e) = unsafe { self.policy.decommit(block, self.page_size) } {
            log::warn!("PageAllocator failed to decommit {block:?}: {e}");
        }
        // Safety: forwarded caller contract.
        unsafe { self.pool.deallocate_aligned(block, alignment) };
    }

    fn owns(&self, block: MemoryRange) -> bool {
        self.pool.owns(block)
    }

    fn max_allocation_size(&self) -> Bytes {
        self.page_size
    }
}

impl<P: PageAllocatorPolicy> Drop for PageAllocator<P> {
    fn drop(&mut self) {
        // The pool's reservation goes away with it; drop the policy's share of
        // the commit accounting here.
        let committed = self.policy.committed_bytes().get();
        if committed > 0 {
            stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
            stats::sub_saturating(&stats::PAGE_ALLOCATOR_COMMITTED, committed);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn small_config(pages: usize) -> PageAllocatorConfig {
        PageAllocatorConfig {
            capacity: vm::page_size() * pages,
            ..PageAllocatorConfig::default()
        }
    }

    #[test]
    fn test_fast_policy_commits_once() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pages: PageAllocator<FastPageAllocatorPolicy> =
            PageAllocator::with_config(small_config(4)).unwrap();
        let page = pages.page_size();

        let a = pages.allocate(page);
        assert_eq!(pages.policy().commit_count(), 1);
        // Safety: Test code.
        unsafe {
            a.as_ptr().write_bytes(0x5A, page.get());
            pages.deallocate(a);
        }

        let again = pages.allocate(page);
        assert_eq!(again.begin(), a.begin());
        assert_eq!(pages.policy().commit_count(), 1);
        assert_eq!(pages.policy().decommit_count(), 0);

        // Safety: Test code.
        unsafe { pages.deallocate(again) };
    }

    #[test]
    fn test_compact_policy_commits_every_time() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pages: PageAllocator<CompactPageAllocatorPolicy> =
            PageAllocator::with_config(small_config(4)).unwrap();
        let page = pages.page_size();

        for round in 1..=3 {
            let block = pages.allocate(page);
            assert!(!block.is_empty());
            assert_eq!(pages.policy().commit_count(), round);
            assert_eq!(pages.policy().committed_bytes(), page);
            // Safety: Test code.
            unsafe {
                block.as_ptr().write(round as u8);
                pages.deallocate(block);
            }
            assert_eq!(pages.policy().decommit_count(), round);
            assert_eq!(pages.policy().committed_bytes(), Bytes::ZERO);
        }
    }

    #[test]
    fn test_block_is_slot_prefix() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pages: PageAllocator = PageAllocator::with_config(small_config(2)).unwrap();
        let block = pages.allocate(Bytes::new(100));
        assert_eq!(block.size(), Bytes::new(100));
        assert!(block.begin().is_aligned_to(vm::page_alignment()));
        assert!(pages.owns(block));
        // Safety: Test code.
        unsafe { pages.deallocate(block) };
        assert_eq!(pages.live_pages(), 0);
    }

    #[test]
    fn test_page_allocator_exhaustion_and_limits() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pages: PageAllocator = PageAllocator::with_config(small_config(2)).unwrap();
        let page = pages.page_size();
        assert_eq!(pages.max_allocation_size(), page);
        assert!(pages.allocate(page + Bytes::new(1)).is_empty());

        let a = pages.allocate(page);
        let b = pages.allocate(page);
        assert!(!a.is_empty() && !b.is_empty());
        assert!(pages.allocate(Bytes::new(1)).is_empty());

        // Safety: Test code.
        unsafe {
            pages.deallocate(b);
            pages.deallocate(a);
        }
    }

    #[test]
    fn test_multi_page_slots() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = PageAllocatorConfig {
            capacity: vm::page_size() * 8,
            page_size: vm::page_size() * 2,
        };
        let mut pages: PageAllocator<CompactPageAllocatorPolicy> =
            PageAllocator::with_config(config).unwrap();
        // Two pages are a power of two, so the whole slot is backed even for
        // a small block.
        let small = pages.allocate(Bytes::new(16));
        assert_eq!(pages.policy().committed_bytes(), vm::page_size() * 2);
        // Safety: Test code.
        unsafe { pages.deallocate(small) };
    }

    #[test]
    fn test_non_power_of_two_slots_commit_touched_pages() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = vm::page_size();
        let config = PageAllocatorConfig {
            capacity: page * 9,
            page_size: page * 3,
        };
        let mut pages: PageAllocator<CompactPageAllocatorPolicy> =
            PageAllocator::with_config(config).unwrap();
        let small = pages.allocate(Bytes::new(16));
        assert_eq!(pages.policy().committed_bytes(), page);
        // Safety: Test code.
        unsafe { pages.deallocate(small) };

        let spanning = pages.allocate(page + Bytes::new(16));
        assert_eq!(pages.policy().committed_bytes(), page * 2);
        // Safety: Test code.
        unsafe { pages.deallocate(spanning) };
        assert_eq!(pages.policy().committed_bytes(), Bytes::ZERO);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not a multiple of the OS page size")]
    fn test_page_size_must_match_os_pages() {
        let config = PageAllocatorConfig {
            capacity: Bytes::mib(1),
            page_size: vm::page_size() + Bytes::new(1),
        };
        let _ = PageAllocator::<FastPageAllocatorPolicy>::with_config(config);
    }
}
