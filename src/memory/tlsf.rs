//! Two-level segregated fit.
//!
//! Free blocks are binned by a first-level index (power-of-two size class)
//! and a second-level index (16 linear subdivisions of that class). Two
//! bitmaps mark the non-empty bins so the smallest sufficient bin is found
//! with two bit scans, independent of the number of free blocks.
//!
//! Blocks carry boundary tags (see `block_header`) so that a released block
//! merges with free physical neighbours in O(1). The pool grows from a
//! [`LinearAllocator`] in address order; the highest block carries the
//! `last` flag.

use super::allocator::Allocator;
use super::block_header::{
    self, BlockHeader, FreeBlockHeader, GRANULARITY, HEADER_SIZE, MIN_BLOCK_SIZE,
};
use super::error::MemoryError;
use super::linear::LinearAllocator;
use super::units::{Alignment, Bytes, MemoryRange};
use crate::sync::{Mutex, MutexGuard, PoisonError};
use std::ptr;

const SL_LOG2: u32 = 4;
const SL_COUNT: usize = 1 << SL_LOG2;

/// Sizes below this live in first level 0, in linear `GRANULARITY` steps.
const SMALL_LOG2: u32 = 8;
const SMALL_BLOCK_SIZE: usize = 1 << SMALL_LOG2;
const _: () = assert!(SMALL_BLOCK_SIZE == SL_COUNT * GRANULARITY);

/// Largest first-level class is `[2^40, 2^41)`.
const MAX_FL_LOG2: u32 = 40;
const FL_COUNT: usize = (MAX_FL_LOG2 - SMALL_LOG2 + 2) as usize;
const MAX_POOL_SIZE: usize = 1 << MAX_FL_LOG2;

const DEFAULT_CAPACITY: Bytes = Bytes::mib(64);
const DEFAULT_GROW_SIZE: Bytes = Bytes::kib(64);

const BLOCK_ALIGNMENT: Alignment = Alignment::from_log2(GRANULARITY.trailing_zeros());

pub struct TlsfConfig {
    /// Address space reserved for the pool. Default: 64 MiB.
    pub capacity: Bytes,

    /// Minimum bytes taken from the reservation each time the pool grows; the
    /// part not needed by the triggering request becomes a free block.
    /// Default: 64 KiB.
    pub grow_size: Bytes,
}

impl Default for TlsfConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            grow_size: DEFAULT_GROW_SIZE,
        }
    }
}

/// Bin holding free blocks of exactly `size` bytes.
fn mapping_insert(size: usize) -> Option<(usize, usize)> {
    if size < SMALL_BLOCK_SIZE {
        return Some((0, size / GRANULARITY));
    }
    let log2 = usize::BITS - 1 - size.leading_zeros();
    if log2 > MAX_FL_LOG2 {
        return None;
    }
    let fl = (log2 - SMALL_LOG2 + 1) as usize;
    let sl = (size >> (log2 - SL_LOG2)) & (SL_COUNT - 1);
    Some((fl, sl))
}

/// First bin whose every block holds at least `size` bytes.
fn mapping_search(size: usize) -> Option<(usize, usize)> {
    if size < SMALL_BLOCK_SIZE {
        return mapping_insert(size);
    }
    let log2 = usize::BITS - 1 - size.leading_zeros();
    let round = (1usize << (log2 - SL_LOG2)) - 1;
    mapping_insert(size.checked_add(round)?)
}

#[inline]
fn bin(fl: usize, sl: usize) -> usize {
    fl * SL_COUNT + sl
}

struct TlsfState {
    backing: LinearAllocator,
    grow_size: Bytes,
    fl_bitmap: u64,
    sl_bitmap: [u16; FL_COUNT],
    heads: [*mut FreeBlockHeader; FL_COUNT * SL_COUNT],
    /// Highest-addressed block, null until the pool first grows.
    last: *mut BlockHeader,
    free_blocks: usize,
}

// Safety: the raw pointers only reference memory inside `backing`, which the
// state owns; all access goes through the outer Mutex.
unsafe impl Send for TlsfState {}

impl TlsfState {
    /// # Safety
    /// `block` must be a free block of this pool that is not on any list.
    unsafe fn insert(&mut self, block: *mut FreeBlockHeader) {
        // Safety: caller guarantees the header is valid.
        let size = unsafe { (*block).header.size() };
        let Some((fl, sl)) = mapping_insert(size.get()) else {
            debug_assert!(false, "free block of {size} has no bin");
            return;
        };
        let index = bin(fl, sl);
        let head = self.heads[index];
        // Safety: block and head are free blocks of this pool.
        unsafe {
            (*block).previous_free = ptr::null_mut();
            (*block).next_free = head;
            if !head.is_null() {
                (*head).previous_free = block;
            }
        }
        self.heads[index] = block;
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
        self.free_blocks += 1;
    }

    /// # Safety
    /// `block` must currently be on the free list matching its size.
    unsafe fn remove(&mut self, block: *mut FreeBlockHeader) {
        // Safety: caller guarantees the header is valid and listed.
        let (size, previous, next) =
            unsafe { ((*block).header.size(), (*block).previous_free, (*block).next_free) };
        let Some((fl, sl)) = mapping_insert(size.get()) else {
            debug_assert!(false, "free block of {size} has no bin");
            return;
        };
        // Safety: neighbours on the list are valid free blocks.
        unsafe {
            if !next.is_null() {
                (*next).previous_free = previous;
            }
            if previous.is_null() {
                let index = bin(fl, sl);
                debug_assert_eq!(self.heads[index], block);
                self.heads[index] = next;
                if next.is_null() {
                    self.sl_bitmap[fl] &= !(1 << sl);
                    if self.sl_bitmap[fl] == 0 {
                        self.fl_bitmap &= !(1 << fl);
                    }
                }
            } else {
                (*previous).next_free = next;
            }
        }
        self.free_blocks -= 1;
    }

    fn find_suitable(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        let sl_map = self.sl_bitmap[fl] & (u16::MAX << sl);
        if sl_map != 0 {
            return Some((fl, sl_map.trailing_zeros() as usize));
        }
        let fl_map = self.fl_bitmap & (u64::MAX << (fl + 1));
        if fl_map == 0 {
            return None;
        }
        let fl = fl_map.trailing_zeros() as usize;
        Some((fl, self.sl_bitmap[fl].trailing_zeros() as usize))
    }

    /// Unlink a free block of at least `size` bytes.
    fn take_free(&mut self, size: Bytes) -> Option<*mut BlockHeader> {
        // The head of the exact bin is tried first: rounding up for the
        // bitmap search would skip a just-released block of the same size.
        let (fl, sl) = mapping_insert(size.get())?;
        let head = self.heads[bin(fl, sl)];
        // Safety: listed heads are valid free blocks.
        if !head.is_null() && unsafe { (*head).header.size() } >= size {
            // Safety: head is listed.
            unsafe { self.remove(head) };
            return Some(head.cast());
        }

        let (fl, sl) = mapping_search(size.get())?;
        let (fl, sl) = self.find_suitable(fl, sl)?;
        let head = self.heads[bin(fl, sl)];
        debug_assert!(!head.is_null(), "bitmap marks empty bin ({fl}, {sl})");
        // Safety: the bitmap says the bin is non-empty.
        unsafe { self.remove(head) };
        Some(head.cast())
    }

    /// Grow the pool so that a free block of at least `size` bytes sits at its
    /// end and return that block, unlinked. A free last block counts towards
    /// `size` and is merged with the new chunk.
    fn extend(&mut self, size: Bytes) -> Option<*mut BlockHeader> {
        let remaining = self.backing.max_allocation_size().round_down(BLOCK_ALIGNMENT);
        // Safety: last is null or the header of the pool's last block.
        let tail = match unsafe { self.last.as_ref() } {
            Some(last) if !last.is_busy() => last.size(),
            _ => Bytes::ZERO,
        };
        let shortfall = size.saturating_sub(tail).max(MIN_BLOCK_SIZE);
        let chunk = shortfall.max(self.grow_size).min(remaining);
        if chunk < shortfall {
            return None;
        }
        let range = self.backing.allocate_aligned(chunk, BLOCK_ALIGNMENT);
        if range.is_empty() {
            return None;
        }
        log::debug!("TLSF pool grew by {chunk} at {:?}", range.begin());

        let previous = self.last;
        // Safety: range is fresh committed memory of at least MIN_BLOCK_SIZE.
        let block = unsafe { block_header::write_free(range.begin(), chunk, previous, true) }
            .cast::<BlockHeader>();
        self.last = block;
        if previous.is_null() {
            return Some(block);
        }
        // Safety: previous is the former last block of this pool.
        unsafe {
            debug_assert_eq!(block_header::next(previous), block, "pool is not contiguous");
            (*previous).set_last(false);
            if (*previous).is_busy() {
                return Some(block);
            }
            self.remove(previous.cast());
            self.absorb_next(previous, block);
        }
        Some(previous)
    }

    /// Merge `next` into `block`. Both must be unlinked.
    ///
    /// # Safety
    /// `next` must be the physical successor of `block`.
    unsafe fn absorb_next(&mut self, block: *mut BlockHeader, next: *mut BlockHeader) {
        // Safety: both headers are valid and adjacent.
        unsafe {
            (*block).set_size((*block).size() + (*next).size());
            if (*next).is_last() {
                (*block).set_last(true);
                self.last = block;
            } else {
                (*block_header::next(block)).set_previous(block);
            }
        }
    }

    /// Cut `block` at `at` bytes. The tail becomes a new free block and is
    /// returned; `block` keeps its flags.
    ///
    /// # Safety
    /// `block` must be unlinked and at least `at + MIN_BLOCK_SIZE` large.
    unsafe fn split(&mut self, block: *mut BlockHeader, at: Bytes) -> *mut BlockHeader {
        // Safety: caller guarantees the sizes; the tail lies inside `block`.
        unsafe {
            let tail_size = (*block).size() - at;
            let was_last = (*block).is_last();
            let tail = block_header::write_free(
                block_header::address_of(block) + at,
                tail_size,
                block,
                was_last,
            )
            .cast::<BlockHeader>();
            (*block).set_size(at);
            if was_last {
                (*block).set_last(false);
                self.last = tail;
            } else {
                (*block_header::next(tail)).set_previous(tail);
            }
            tail
        }
    }

    fn allocate(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        if size.is_zero() || size.get() > MAX_POOL_SIZE || alignment.get() > MAX_POOL_SIZE {
            return MemoryRange::empty();
        }
        let needed = (size.round_up(BLOCK_ALIGNMENT) + HEADER_SIZE).max(MIN_BLOCK_SIZE);
        let over_aligned = alignment > BLOCK_ALIGNMENT;
        let search = if over_aligned {
            needed + alignment.as_bytes() + MIN_BLOCK_SIZE
        } else {
            needed
        };

        let Some(mut block) = self.take_free(search).or_else(|| self.extend(search)) else {
            return MemoryRange::empty();
        };

        // Safety: block is an unlinked free block of at least `search` bytes.
        unsafe {
            if over_aligned {
                let payload = block_header::payload(block);
                let aligned = payload.align_up(alignment);
                if aligned != payload {
                    let mut gap = aligned.offset_from(payload);
                    if gap < MIN_BLOCK_SIZE {
                        gap += alignment.as_bytes();
                    }
                    let front = block;
                    block = self.split(front, gap);
                    self.insert(front.cast());
                }
            }
            if (*block).size() >= needed + MIN_BLOCK_SIZE {
                let tail = self.split(block, needed);
                self.insert(tail.cast());
            }
            (*block).set_busy(true);
        }

        let payload = block_header::payload(block);
        debug_assert!(payload.is_aligned_to(alignment));
        MemoryRange::from_parts(payload, size)
    }

    /// # Safety
    /// `block` must be a live allocation of this pool.
    unsafe fn deallocate(&mut self, block: MemoryRange) {
        let mut header = block_header::from_payload(block.begin());
        // Safety: caller guarantees the header belongs to a busy block.
        unsafe {
            debug_assert!(
                (*header).is_busy(),
                "Block {block:?} is not allocated from this allocator"
            );
            (*header).set_busy(false);

            if !(*header).is_last() {
                let next = block_header::next(header);
                if !(*next).is_busy() {
                    self.remove(next.cast());
                    self.absorb_next(header, next);
                }
            }

            let previous = (*header).previous();
            if !previous.is_null() && !(*previous).is_busy() {
                self.remove(previous.cast());
                self.absorb_next(previous, header);
                header = previous;
            }

            self.insert(header.cast());
        }
    }
}

/// O(1) best-fit allocator over one growable pool.
///
/// Internally synchronized: the inherent methods take `&self` and may be
/// called from several threads at once.
pub struct TwoLevelSegregatedFitAllocator {
    state: Mutex<TlsfState>,
    capacity: Bytes,
}

impl TwoLevelSegregatedFitAllocator {
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails or `capacity` is out of range.
    pub fn new(capacity: Bytes) -> Result<Self, MemoryError> {
        Self::with_config(TlsfConfig {
            capacity,
            ..TlsfConfig::default()
        })
    }

    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if `capacity` cannot hold one
    /// block or exceeds the largest size class, and reservation errors
    /// otherwise.
    pub fn with_config(config: TlsfConfig) -> Result<Self, MemoryError> {
        if config.capacity < MIN_BLOCK_SIZE || config.capacity.get() > MAX_POOL_SIZE {
            return Err(MemoryError::configuration(format!(
                "TLSF capacity {} outside [{MIN_BLOCK_SIZE}, {MAX_POOL_SIZE}]",
                config.capacity
            )));
        }
        let backing = LinearAllocator::new(config.capacity)?;
        let capacity = backing.range().size();
        let grow_size = config.grow_size.round_up(BLOCK_ALIGNMENT).max(MIN_BLOCK_SIZE);

        Ok(Self {
            state: Mutex::new(TlsfState {
                backing,
                grow_size,
                fl_bitmap: 0,
                sl_bitmap: [0; FL_COUNT],
                heads: [ptr::null_mut(); FL_COUNT * SL_COUNT],
                last: ptr::null_mut(),
                free_blocks: 0,
            }),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TlsfState> {
        // No user code runs while the lists are half-linked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn allocate(&self, size: Bytes) -> MemoryRange {
        self.lock().allocate(size, Alignment::MAX_FUNDAMENTAL)
    }

    #[must_use]
    pub fn allocate_aligned(&self, size: Bytes, alignment: Alignment) -> MemoryRange {
        self.lock().allocate(size, alignment)
    }

    /// # Safety
    /// `block` must have been returned by this allocator and not yet
    /// deallocated. It must not be used afterwards.
    pub unsafe fn deallocate(&self, block: MemoryRange) {
        if block.is_empty() {
            return;
        }
        debug_assert!(self.owns(block), "Block {block:?} does not belong to this allocator");
        // Safety: forwarded caller contract.
        unsafe { self.lock().deallocate(block) };
    }

    /// # Safety
    /// Same as [`deallocate`](Self::deallocate). The block header records the
    /// layout, so `alignment` is not consulted.
    pub unsafe fn deallocate_aligned(&self, block: MemoryRange, _alignment: Alignment) {
        // Safety: forwarded caller contract.
        unsafe { self.deallocate(block) }
    }

    /// True when `block` lies inside the part of the pool grown so far.
    #[must_use]
    pub fn owns(&self, block: MemoryRange) -> bool {
        !block.is_empty() && self.lock().backing.allocated().contains(&block)
    }

    /// Free blocks across all bins.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.lock().free_blocks
    }

    /// Bytes taken from the reservation so far.
    #[must_use]
    pub fn pool_size(&self) -> Bytes {
        self.lock().backing.allocated().size()
    }

    #[must_use]
    pub fn capacity(&self) -> Bytes {
        self.capacity
    }
}

impl Allocator for TwoLevelSegregatedFitAllocator {
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        Self::allocate(self, size)
    }

    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        Self::allocate_aligned(self, size, alignment)
    }

    unsafe fn deallocate(&mut self, block: MemoryRange) {
        // Safety: forwarded caller contract.
        unsafe { Self::deallocate(self, block) }
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        // Safety: forwarded caller contract.
        unsafe { Self::deallocate_aligned(self, block, alignment) }
    }

    fn owns(&self, block: MemoryRange) -> bool {
        Self::owns(self, block)
    }

    fn max_allocation_size(&self) -> Bytes {
        self.capacity - HEADER_SIZE
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm;

    #[test]
    fn test_mapping() {
        assert_eq!(mapping_insert(32), Some((0, 2)));
        assert_eq!(mapping_insert(240), Some((0, 15)));
        assert_eq!(mapping_insert(256), Some((1, 0)));
        assert_eq!(mapping_insert(511), Some((1, 15)));
        assert_eq!(mapping_insert(1040), Some((3, 0)));
        assert_eq!(mapping_insert(1 << 40), Some((FL_COUNT - 1, 0)));
        assert_eq!(mapping_insert(1 << 41), None);

        // Rounds into the next bin unless the size is a bin boundary.
        assert_eq!(mapping_search(256), Some((1, 0)));
        assert_eq!(mapping_search(257), Some((1, 1)));
        assert_eq!(mapping_search(1040), Some((3, 1)));
        assert_eq!(mapping_search(1023), Some((3, 0)));
    }

    #[test]
    fn test_same_size_reuse() {
        let tlsf = TwoLevelSegregatedFitAllocator::new(Bytes::mib(1)).unwrap();
        let a = tlsf.allocate(Bytes::new(1024));
        let guard = tlsf.allocate(Bytes::new(16));
        assert_eq!(a.size(), Bytes::new(1024));

        // Safety: Test code.
        unsafe { tlsf.deallocate(a) };
        let b = tlsf.allocate(Bytes::new(1024));
        assert_eq!(a.begin(), b.begin());

        // Safety: Test code.
        unsafe {
            tlsf.deallocate(b);
            tlsf.deallocate(guard);
        }
        assert_eq!(tlsf.free_block_count(), 1);
    }

    #[test]
    fn test_repeated_churn_does_not_grow() {
        let tlsf = TwoLevelSegregatedFitAllocator::new(Bytes::mib(1)).unwrap();
        let first = tlsf.allocate(Bytes::new(300));
        // Safety: Test code.
        unsafe { tlsf.deallocate(first) };
        let pool = tlsf.pool_size();
        for _ in 0..100 {
            let block = tlsf.allocate(Bytes::new(300));
            assert_eq!(block.begin(), first.begin());
            // Safety: Test code.
            unsafe { tlsf.deallocate(block) };
        }
        assert_eq!(tlsf.pool_size(), pool);
    }

    #[test]
    fn test_coalescing_adjacent_blocks() {
        let tlsf = TwoLevelSegregatedFitAllocator::new(Bytes::mib(1)).unwrap();
        let a = tlsf.allocate(Bytes::new(112));
        let b = tlsf.allocate(Bytes::new(112));
        let guard = tlsf.allocate(Bytes::new(112));
        assert_eq!(b.begin(), a.begin() + Bytes::new(128));
        let pool = tlsf.pool_size();
        assert_eq!(tlsf.free_block_count(), 1);

        // Safety: Test code.
        unsafe {
            tlsf.deallocate(a);
            tlsf.deallocate(b);
        }
        assert_eq!(tlsf.free_block_count(), 2);

        // Two 128-byte blocks merged into one 256-byte block: 240 bytes of payload.
        let merged = tlsf.allocate(Bytes::new(240));
        assert_eq!(merged.begin(), a.begin());
        assert_eq!(tlsf.pool_size(), pool);
        assert_eq!(tlsf.free_block_count(), 1);

        // Safety: Test code.
        unsafe {
            tlsf.deallocate(merged);
            tlsf.deallocate(guard);
        }
        assert_eq!(tlsf.free_block_count(), 1);
    }

    #[test]
    fn test_alignment_property() {
        let tlsf = TwoLevelSegregatedFitAllocator::new(Bytes::mib(4)).unwrap();
        let mut blocks = Vec::new();
        for log2 in 0..=12 {
            let alignment = Alignment::from_log2(log2);
            for size in [1, 24, 100, 4000] {
                let block = tlsf.allocate_aligned(Bytes::new(size), alignment);
                assert!(!block.is_empty());
                assert!(block.begin().is_aligned_to(alignment), "{block:?} vs {alignment}");
                assert!(block.size() >= Bytes::new(size));
                assert!(tlsf.owns(block));
                // Safety: Test code.
                unsafe { block.as_ptr().write_bytes(0xEE, size) };
                blocks.push(block);
            }
        }
        for block in blocks {
            // Safety: Test code.
            unsafe { tlsf.deallocate(block) };
        }
        // Every padding and tail block merged back.
        assert_eq!(tlsf.free_block_count(), 1);
    }

    #[test]
    fn test_exhaustion_returns_empty() {
        let page = vm::page_size();
        let tlsf = TwoLevelSegregatedFitAllocator::with_config(TlsfConfig {
            capacity: page,
            grow_size: Bytes::new(256),
        })
        .unwrap();
        assert!(tlsf.allocate(page).is_empty());

        let half = tlsf.allocate(page / 2);
        assert!(!half.is_empty());
        assert!(tlsf.allocate(page / 2).is_empty());

        // Safety: Test code.
        unsafe { tlsf.deallocate(half) };
        assert!(!tlsf.allocate(page / 2).is_empty());
    }

    #[test]
    fn test_grow_size_leaves_free_remainder() {
        let tlsf = TwoLevelSegregatedFitAllocator::with_config(TlsfConfig {
            capacity: Bytes::mib(1),
            grow_size: Bytes::kib(4),
        })
        .unwrap();
        let a = tlsf.allocate(Bytes::new(64));
        assert_eq!(tlsf.pool_size(), Bytes::kib(4));
        assert_eq!(tlsf.free_block_count(), 1);

        // Larger than the free tail: the pool grows only by what the tail is
        // missing, and the merged block fits the request exactly.
        let big = tlsf.allocate(Bytes::kib(8));
        assert_eq!(big.begin(), a.begin() + Bytes::new(80));
        assert_eq!(tlsf.pool_size(), Bytes::new(8288));
        assert_eq!(tlsf.free_block_count(), 0);

        // Safety: Test code.
        unsafe {
            tlsf.deallocate(big);
            tlsf.deallocate(a);
        }
        assert_eq!(tlsf.free_block_count(), 1);
    }

    #[test]
    fn test_extension_counts_free_last_block() {
        let tlsf = TwoLevelSegregatedFitAllocator::with_config(TlsfConfig {
            capacity: Bytes::kib(128),
            grow_size: Bytes::kib(64),
        })
        .unwrap();
        let first = tlsf.allocate(Bytes::kib(62));
        assert!(!first.is_empty());
        assert_eq!(tlsf.pool_size(), Bytes::kib(64));
        assert_eq!(tlsf.free_block_count(), 1);

        // Only 64 KiB of reservation remain, less than the request, but the
        // 2032-byte free tail makes up the difference.
        let second = tlsf.allocate(Bytes::kib(64));
        assert!(!second.is_empty());
        assert_eq!(second.begin(), first.begin() + Bytes::new(63504));
        assert_eq!(tlsf.pool_size(), Bytes::kib(128));

        // Safety: Test code.
        unsafe {
            tlsf.deallocate(first);
            tlsf.deallocate(second);
        }
        assert_eq!(tlsf.free_block_count(), 1);
    }

    #[test]
    fn test_aligned_deallocate_through_shared_reference() {
        use crate::sync::Arc;
        let tlsf = Arc::new(TwoLevelSegregatedFitAllocator::new(Bytes::mib(1)).unwrap());
        let alignment = Alignment::new(256).unwrap();
        let block = tlsf.allocate_aligned(Bytes::new(100), alignment);
        assert!(block.begin().is_aligned_to(alignment));

        let shared = Arc::clone(&tlsf);
        // Safety: Test code.
        unsafe { shared.deallocate_aligned(block, alignment) };
        assert_eq!(tlsf.free_block_count(), 1);
    }

    #[test]
    fn test_owns() {
        let tlsf = TwoLevelSegregatedFitAllocator::new(Bytes::mib(1)).unwrap();
        let a = tlsf.allocate(Bytes::new(40));
        assert!(tlsf.owns(a));
        assert!(!tlsf.owns(MemoryRange::empty()));
        let mut outside = [0u8; 16];
        let foreign = MemoryRange::from_parts(
            crate::memory::units::MemoryAddress::from_ptr(outside.as_mut_ptr()),
            Bytes::new(16),
        );
        assert!(!tlsf.owns(foreign));
    }

    #[test]
    fn test_concurrent_allocate_deallocate() {
        use crate::sync::Arc;
        let tlsf = Arc::new(TwoLevelSegregatedFitAllocator::new(Bytes::mib(16)).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tlsf = Arc::clone(&tlsf);
                crate::sync::thread::spawn(move || {
                    for i in 0..500 {
                        let size = Bytes::new(16 + (i * 37 + t * 11) % 2000);
                        let block = tlsf.allocate(size);
                        assert!(!block.is_empty());
                        // Safety: Test code.
                        unsafe {
                            block.as_ptr().write_bytes(t as u8, size.get());
                            tlsf.deallocate(block);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tlsf.free_block_count(), 1);
    }
}
