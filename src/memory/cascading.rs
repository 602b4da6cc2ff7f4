use super::allocator::{Allocator, CountingAllocator};
use super::error::MemoryError;
use super::stats;
use super::units::{Alignment, Bytes, MemoryAddress, MemoryRange};
use std::collections::HashSet;
use std::ptr;

/// Builds the allocator of a freshly spawned cascade over `range`.
pub trait CascadeConstructor<C> {
    fn construct(&mut self, range: MemoryRange) -> C;
}

impl<C, F: FnMut(MemoryRange) -> C> CascadeConstructor<C> for F {
    fn construct(&mut self, range: MemoryRange) -> C {
        self(range)
    }
}

/// Node written at the start of each cascade's storage. The cascade's own
/// allocator manages the bytes after it.
struct Cascade<C> {
    allocator: CountingAllocator<C>,
    next: *mut Cascade<C>,
    previous: *mut Cascade<C>,
    /// On the available list.
    linked: bool,
}

/// Unbounded allocator made of fixed-capacity cascades spawned on demand.
///
/// Every cascade is placed at an address aligned to
/// `cascade_capacity.next_power_of_two()`, so the owner of a block is found
/// by masking the block address. A cascade whose last block is returned is
/// destroyed and its storage goes back to the underlying allocator.
pub struct CascadingAllocator<A: Allocator, C: Allocator, K: CascadeConstructor<C>> {
    allocator: A,
    constructor: K,
    cascade_capacity: Bytes,
    cascade_alignment: Alignment,
    header_size: Bytes,
    /// Head of the available list.
    head: *mut Cascade<C>,
    /// Storage base of every live cascade.
    live: HashSet<MemoryAddress>,
}

// Safety: cascades live in storage exclusively owned by this value.
unsafe impl<A, C, K> Send for CascadingAllocator<A, C, K>
where
    A: Allocator + Send,
    C: Allocator + Send,
    K: CascadeConstructor<C> + Send,
{
}

impl<A: Allocator, C: Allocator, K: CascadeConstructor<C>> CascadingAllocator<A, C, K> {
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if a cascade of `cascade_capacity`
    /// cannot hold its own node or exceeds what `allocator` serves.
    pub fn new(
        allocator: A,
        cascade_capacity: Bytes,
        constructor: K,
    ) -> Result<Self, MemoryError> {
        let header_size = Bytes::of::<Cascade<C>>().round_up(Alignment::MAX_FUNDAMENTAL);
        if cascade_capacity <= header_size {
            return Err(MemoryError::configuration(format!(
                "cascade capacity {cascade_capacity} cannot hold its {header_size} node"
            )));
        }
        if cascade_capacity > allocator.max_allocation_size() {
            return Err(MemoryError::configuration(format!(
                "cascade capacity {cascade_capacity} exceeds the underlying limit {}",
                allocator.max_allocation_size()
            )));
        }
        let Some(cascade_alignment) = Alignment::new(cascade_capacity.next_power_of_two().get())
        else {
            return Err(MemoryError::configuration(format!(
                "cascade capacity {cascade_capacity} has no power-of-two alignment"
            )));
        };
        debug_assert!(Alignment::of::<Cascade<C>>() <= cascade_alignment);

        Ok(Self {
            allocator,
            constructor,
            cascade_capacity,
            cascade_alignment,
            header_size,
            head: ptr::null_mut(),
            live: HashSet::new(),
        })
    }

    /// Live cascades, available or exhausted.
    #[inline]
    #[must_use]
    pub fn cascade_count(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn cascade_alignment(&self) -> Alignment {
        self.cascade_alignment
    }

    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    fn create_cascade(&mut self) -> *mut Cascade<C> {
        let storage = self
            .allocator
            .allocate_aligned(self.cascade_capacity, self.cascade_alignment);
        if storage.is_empty() {
            return ptr::null_mut();
        }
        if !storage.begin().is_aligned_to(self.cascade_alignment) {
            debug_assert!(
                false,
                "cascade storage {storage:?} is not aligned to {}",
                self.cascade_alignment
            );
            // Safety: storage was just allocated with this alignment.
            unsafe {
                self.allocator
                    .deallocate_aligned(storage, self.cascade_alignment);
            }
            return ptr::null_mut();
        }

        let range = MemoryRange::new(storage.begin() + self.header_size, storage.end());
        let cascade = storage.begin().as_ptr::<Cascade<C>>();
        let allocator = CountingAllocator::new(self.constructor.construct(range));
        // Safety: the node fits in front of `range` and is suitably aligned.
        unsafe {
            cascade.write(Cascade {
                allocator,
                next: ptr::null_mut(),
                previous: ptr::null_mut(),
                linked: false,
            });
        }
        self.live.insert(storage.begin());
        stats::LIVE_CASCADES.add(1);
        log::debug!("spawned cascade at {:?} ({} live)", storage.begin(), self.live.len());
        cascade
    }

    /// # Safety
    /// `cascade` must be a live, unlinked cascade with no outstanding blocks.
    unsafe fn destroy_cascade(&mut self, cascade: *mut Cascade<C>) {
        let storage = self.storage_of(cascade);
        // Safety: the node was written in `create_cascade` and is dropped once.
        unsafe {
            debug_assert!(!(*cascade).linked);
            ptr::drop_in_place(cascade);
            self.allocator
                .deallocate_aligned(storage, self.cascade_alignment);
        }
        self.live.remove(&storage.begin());
        stats::sub_saturating(&stats::LIVE_CASCADES, 1);
        log::debug!("retired cascade at {:?} ({} live)", storage.begin(), self.live.len());
    }

    /// # Safety
    /// `cascade` must be live and unlinked.
    unsafe fn link_front(&mut self, cascade: *mut Cascade<C>) {
        // Safety: cascade and the current head are live nodes.
        unsafe {
            (*cascade).previous = ptr::null_mut();
            (*cascade).next = self.head;
            (*cascade).linked = true;
            if !self.head.is_null() {
                (*self.head).previous = cascade;
            }
        }
        self.head = cascade;
    }

    /// # Safety
    /// `cascade` must be live and linked.
    unsafe fn unlink(&mut self, cascade: *mut Cascade<C>) {
        // Safety: cascade and its list neighbours are live nodes.
        unsafe {
            let (next, previous) = ((*cascade).next, (*cascade).previous);
            if previous.is_null() {
                self.head = next;
            } else {
                (*previous).next = next;
            }
            if !next.is_null() {
                (*next).previous = previous;
            }
            (*cascade).next = ptr::null_mut();
            (*cascade).previous = ptr::null_mut();
            (*cascade).linked = false;
        }
    }

    fn allocate_on_cascade<F>(&mut self, mut allocate: F) -> MemoryRange
    where
        F: FnMut(&mut CountingAllocator<C>) -> MemoryRange,
    {
        let mut cascade = self.head;
        while !cascade.is_null() {
            // Safety: nodes on the available list are live.
            unsafe {
                let next = (*cascade).next;
                let block = allocate(&mut (*cascade).allocator);
                if !block.is_empty() {
                    return block;
                }
                if (*cascade).allocator.allocation_count() == 0 {
                    // An empty cascade cannot fit it; no other cascade will.
                    return MemoryRange::empty();
                }
                self.unlink(cascade);
                cascade = next;
            }
        }

        let cascade = self.create_cascade();
        if cascade.is_null() {
            return MemoryRange::empty();
        }
        // Safety: cascade was just created.
        unsafe {
            let block = allocate(&mut (*cascade).allocator);
            if block.is_empty() {
                self.destroy_cascade(cascade);
                return MemoryRange::empty();
            }
            self.link_front(cascade);
            block
        }
    }

    /// # Safety
    /// `block` must be a live allocation of this allocator.
    unsafe fn deallocate_on_cascade<F>(&mut self, block: MemoryRange, deallocate: F)
    where
        F: FnOnce(&mut CountingAllocator<C>, MemoryRange),
    {
        let cascade = self.owner(block);
        // Safety: caller guarantees the block lives in one of our cascades.
        unsafe {
            deallocate(&mut (*cascade).allocator, block);
            if (*cascade).allocator.allocation_count() == 0 {
                if (*cascade).linked {
                    self.unlink(cascade);
                }
                self.destroy_cascade(cascade);
            } else if !(*cascade).linked {
                self.link_front(cascade);
            }
        }
    }

    fn storage_of(&self, cascade: *mut Cascade<C>) -> MemoryRange {
        MemoryRange::from_parts(MemoryAddress::from_ptr(cascade), self.cascade_capacity)
    }

    fn owner(&self, block: MemoryRange) -> *mut Cascade<C> {
        block.begin().align_down(self.cascade_alignment).as_ptr()
    }
}

impl<A, C, K> Allocator for CascadingAllocator<A, C, K>
where
    A: Allocator,
    C: Allocator,
    K: CascadeConstructor<C>,
{
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        self.allocate_on_cascade(|cascade| cascade.allocate(size))
    }

    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        self.allocate_on_cascade(|cascade| cascade.allocate_aligned(size, alignment))
    }

    unsafe fn deallocate(&mut self, block: MemoryRange) {
        debug_assert!(self.owns(block), "Block {block:?} does not belong to this allocator");
        // Safety: forwarded caller contract.
        unsafe {
            self.deallocate_on_cascade(block, |cascade, block| cascade.deallocate(block));
        }
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        debug_assert!(self.owns(block), "Block {block:?} does not belong to this allocator");
        // Safety: forwarded caller contract.
        unsafe {
            self.deallocate_on_cascade(block, |cascade, block| {
                cascade.deallocate_aligned(block, alignment);
            });
        }
    }

    fn owns(&self, block: MemoryRange) -> bool {
        if block.is_empty() {
            return false;
        }
        // Retired storage may be decommitted; only live nodes are read.
        let cascade = self.owner(block);
        // Safety: the node of a live cascade stays valid until it is retired.
        self.live.contains(&MemoryAddress::from_ptr(cascade))
            && unsafe { (*cascade).allocator.owns(block) }
    }

    fn max_allocation_size(&self) -> Bytes {
        self.cascade_capacity - self.header_size
    }
}

impl<A, C, K> Drop for CascadingAllocator<A, C, K>
where
    A: Allocator,
    C: Allocator,
    K: CascadeConstructor<C>,
{
    fn drop(&mut self) {
        debug_assert!(
            self.live.is_empty(),
            "CascadingAllocator dropped with {} live cascades",
            self.live.len()
        );
    }
}
