use super::allocator::Allocator;
use super::error::MemoryError;
use super::units::{Alignment, Bytes, MemoryRange};
use std::ptr::{self, NonNull};

/// Maps requests to size classes and back.
pub trait ClusterPolicy {
    /// Largest size served by cluster `index`.
    fn size(&self, index: usize) -> Bytes;

    /// Smallest cluster whose class holds `size` bytes.
    fn index(&self, size: Bytes) -> usize;

    fn index_aligned(&self, size: Bytes, alignment: Alignment) -> usize {
        self.index(size.max(alignment.as_bytes()))
    }
}

/// Classes `base, base << r, base << 2r, ...` with `r = log2_ratio`.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialClusterPolicy {
    pub base: Bytes,
    pub log2_ratio: u32,
}

impl ClusterPolicy for ExponentialClusterPolicy {
    fn size(&self, index: usize) -> Bytes {
        let shift = u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(self.log2_ratio))
            .unwrap_or(u32::MAX);
        if shift >= self.base.get().leading_zeros() {
            return Bytes::new(usize::MAX);
        }
        Bytes::new(self.base.get() << shift)
    }

    fn index(&self, size: Bytes) -> usize {
        if size <= self.base {
            return 0;
        }
        // size(i) >= size  <=>  2^(i * r) >= ceil(size / base)
        let ratio = size.get().div_ceil(self.base.get());
        let bits = usize::BITS - (ratio - 1).leading_zeros();
        bits.div_ceil(self.log2_ratio.max(1)) as usize
    }
}

/// Classes `step, 2 * step, 3 * step, ...`.
#[derive(Clone, Copy, Debug)]
pub struct LinearClusterPolicy {
    pub step: Bytes,
}

impl ClusterPolicy for LinearClusterPolicy {
    fn size(&self, index: usize) -> Bytes {
        Bytes::new(self.step.get().saturating_mul(index.saturating_add(1)))
    }

    fn index(&self, size: Bytes) -> usize {
        size.get().div_ceil(self.step.get()).saturating_sub(1)
    }
}

/// Routes each request to one of `order` fixed size-class allocators.
///
/// All clusters are built up front inside one block taken from the
/// underlying allocator. A request is served by exactly one cluster; there is
/// no fallback when that cluster is exhausted.
pub struct ClusteringAllocator<A: Allocator, C: Allocator, P: ClusterPolicy> {
    allocator: A,
    policy: P,
    storage: MemoryRange,
    clusters: NonNull<C>,
    order: usize,
}

// Safety: the clusters live in storage exclusively owned by this value.
unsafe impl<A, C, P> Send for ClusteringAllocator<A, C, P>
where
    A: Allocator + Send,
    C: Allocator + Send,
    P: ClusterPolicy + Send,
{
}

impl<A: Allocator, C: Allocator, P: ClusterPolicy> ClusteringAllocator<A, C, P> {
    /// Build `order` clusters, cluster `i` from `factory(i, policy.size(i))`.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` for a zero order or when the
    /// cluster storage exceeds what `allocator` can serve,
    /// `MemoryError::OutOfMemory` when that storage cannot be allocated, and
    /// the first error returned by `factory`. Clusters built before a failure
    /// are dropped and the storage is returned.
    pub fn new<F>(
        mut allocator: A,
        policy: P,
        order: usize,
        mut factory: F,
    ) -> Result<Self, MemoryError>
    where
        F: FnMut(usize, Bytes) -> Result<C, MemoryError>,
    {
        if order == 0 {
            return Err(MemoryError::configuration("cluster order must be non-zero"));
        }
        let Some(storage_size) = Bytes::of::<C>().get().checked_mul(order) else {
            return Err(MemoryError::configuration(format!("{order} clusters overflow")));
        };
        let storage_size = Bytes::new(storage_size.max(1));
        if storage_size > allocator.max_allocation_size() {
            return Err(MemoryError::configuration(format!(
                "{order} clusters need {storage_size}, the underlying allocator serves at most {}",
                allocator.max_allocation_size()
            )));
        }

        let storage = allocator.allocate_aligned(storage_size, Alignment::of::<C>());
        if storage.is_empty() {
            return Err(MemoryError::OutOfMemory("cluster storage"));
        }
        let clusters = storage.begin().as_ptr::<C>();

        for index in 0..order {
            match factory(index, policy.size(index)) {
                // Safety: slot `index` lies inside storage and is uninitialized.
                Ok(cluster) => unsafe { clusters.add(index).write(cluster) },
                Err(e) => {
                    // Safety: exactly the first `index` slots are initialized.
                    unsafe {
                        ptr::drop_in_place(ptr::slice_from_raw_parts_mut(clusters, index));
                        allocator.deallocate_aligned(storage, Alignment::of::<C>());
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            allocator,
            policy,
            storage,
            // Safety: storage is non-empty.
            clusters: unsafe { NonNull::new_unchecked(clusters) },
            order,
        })
    }

    #[inline]
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    #[must_use]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// # Panics
    ///
    /// Panics if `index >= order`.
    #[must_use]
    pub fn cluster(&self, index: usize) -> &C {
        &self.clusters()[index]
    }

    fn clusters(&self) -> &[C] {
        // Safety: all `order` slots were initialized in `new`.
        unsafe { std::slice::from_raw_parts(self.clusters.as_ptr(), self.order) }
    }

    fn cluster_mut(&mut self, index: usize) -> Option<&mut C> {
        // Safety: all `order` slots were initialized in `new`.
        let clusters =
            unsafe { std::slice::from_raw_parts_mut(self.clusters.as_ptr(), self.order) };
        clusters.get_mut(index)
    }
}

impl<A: Allocator, C: Allocator, P: ClusterPolicy> Allocator for ClusteringAllocator<A, C, P> {
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        let index = self.policy.index(size);
        match self.cluster_mut(index) {
            Some(cluster) => cluster.allocate(size),
            None => MemoryRange::empty(),
        }
    }

    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        let index = self.policy.index_aligned(size, alignment);
        match self.cluster_mut(index) {
            Some(cluster) => cluster.allocate_aligned(size, alignment),
            None => MemoryRange::empty(),
        }
    }

    unsafe fn deallocate(&mut self, block: MemoryRange) {
        let index = self.policy.index(block.size());
        let Some(cluster) = self.cluster_mut(index) else {
            debug_assert!(false, "Block {block:?} maps to no cluster");
            return;
        };
        // Safety: the same size maps to the cluster that served the block.
        unsafe { cluster.deallocate(block) };
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        let index = self.policy.index_aligned(block.size(), alignment);
        let Some(cluster) = self.cluster_mut(index) else {
            debug_assert!(false, "Block {block:?} maps to no cluster");
            return;
        };
        // Safety: the same size and alignment map to the serving cluster.
        unsafe { cluster.deallocate_aligned(block, alignment) };
    }

    fn owns(&self, block: MemoryRange) -> bool {
        self.clusters().iter().any(|cluster| cluster.owns(block))
    }

    fn max_allocation_size(&self) -> Bytes {
        self.policy.size(self.order)
    }
}

impl<A: Allocator, C: Allocator, P: ClusterPolicy> Drop for ClusteringAllocator<A, C, P> {
    fn drop(&mut self) {
        // Safety: every slot is initialized and dropped exactly once, in order;
        // the storage came from `allocator` with this alignment.
        unsafe {
            for index in 0..self.order {
                ptr::drop_in_place(self.clusters.as_ptr().add(index));
            }
            self.allocator.deallocate_aligned(self.storage, Alignment::of::<C>());
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::pool::{NonIntrusiveFreeList, PoolAllocator};
    use crate::memory::system::SystemAllocator;
    use std::cell::RefCell;
    use std::rc::Rc;

    const CLASSES: ExponentialClusterPolicy = ExponentialClusterPolicy {
        base: Bytes::new(16),
        log2_ratio: 2,
    };

    #[test]
    fn test_exponential_policy() {
        let sizes: Vec<_> = (0..4).map(|i| CLASSES.size(i).get()).collect();
        assert_eq!(sizes, [16, 64, 256, 1024]);
        assert_eq!(CLASSES.index(Bytes::new(1)), 0);
        assert_eq!(CLASSES.index(Bytes::new(16)), 0);
        assert_eq!(CLASSES.index(Bytes::new(17)), 1);
        assert_eq!(CLASSES.index(Bytes::new(64)), 1);
        assert_eq!(CLASSES.index(Bytes::new(100)), 2);
        assert_eq!(CLASSES.index(Bytes::new(1024)), 3);
        assert_eq!(CLASSES.index(Bytes::new(1025)), 4);
        assert_eq!(
            CLASSES.index_aligned(Bytes::new(8), Alignment::new(256).unwrap()),
            2
        );
        assert_eq!(CLASSES.size(64), Bytes::new(usize::MAX));
    }

    #[test]
    fn test_linear_policy() {
        let policy = LinearClusterPolicy { step: Bytes::new(8) };
        assert_eq!(policy.size(0), Bytes::new(8));
        assert_eq!(policy.size(3), Bytes::new(32));
        assert_eq!(policy.index(Bytes::new(1)), 0);
        assert_eq!(policy.index(Bytes::new(8)), 0);
        assert_eq!(policy.index(Bytes::new(9)), 1);
        assert_eq!(policy.index(Bytes::new(32)), 3);
    }

    fn pool_factory(
        _index: usize,
        size: Bytes,
    ) -> Result<PoolAllocator<NonIntrusiveFreeList>, MemoryError> {
        PoolAllocator::new(size, Bytes::kib(64))
    }

    #[test]
    fn test_routes_to_smallest_fitting_cluster() {
        let mut system = SystemAllocator::new();
        {
            let mut clustering =
                ClusteringAllocator::new(&mut system, CLASSES, 4, pool_factory).unwrap();
            assert_eq!(clustering.order(), 4);
            assert_eq!(clustering.max_allocation_size(), Bytes::new(4096));

            let block = clustering.allocate(Bytes::new(100));
            assert!(!block.is_empty());
            for index in 0..4 {
                assert_eq!(clustering.cluster(index).owns(block), index == 2);
            }
            assert!(clustering.owns(block));

            let small = clustering.allocate(Bytes::new(10));
            assert!(clustering.cluster(0).owns(small));

            // Safety: Test code.
            unsafe {
                clustering.deallocate(block);
                clustering.deallocate(small);
            }
            assert_eq!(clustering.cluster(2).live_slots(), 0);
            assert_eq!(clustering.cluster(0).live_slots(), 0);
        }
        assert_eq!(system.live_blocks(), 0);
    }

    #[test]
    fn test_no_fallback_between_clusters() {
        let mut clustering =
            ClusteringAllocator::new(SystemAllocator::new(), CLASSES, 4, |_, size| {
                PoolAllocator::<NonIntrusiveFreeList>::new(size, Bytes::kib(4))
            })
            .unwrap();
        // Oversized: one class beyond the largest cluster.
        assert!(clustering.allocate(Bytes::new(2000)).is_empty());

        // Exhaust the 1 KiB cluster; the request is not served elsewhere.
        let slots = clustering.cluster(3).range().size() / Bytes::new(1024);
        let blocks: Vec<_> = (0..slots).map(|_| clustering.allocate(Bytes::new(1000))).collect();
        assert!(blocks.iter().all(|b| !b.is_empty()));
        assert!(clustering.allocate(Bytes::new(1000)).is_empty());

        // Other classes are unaffected.
        let other = clustering.allocate(Bytes::new(200));
        assert!(clustering.cluster(2).owns(other));
        // Safety: Test code.
        unsafe { clustering.deallocate(other) };

        for block in blocks {
            // Safety: Test code.
            unsafe { clustering.deallocate(block) };
        }
    }

    #[test]
    fn test_aligned_round_trip_uses_same_cluster() {
        let mut clustering =
            ClusteringAllocator::new(SystemAllocator::new(), CLASSES, 4, pool_factory).unwrap();
        let alignment = Alignment::new(64).unwrap();
        let block = clustering.allocate_aligned(Bytes::new(8), alignment);
        assert!(block.begin().is_aligned_to(alignment));
        assert!(clustering.cluster(1).owns(block));
        // Safety: Test code.
        unsafe { clustering.deallocate_aligned(block, alignment) };
        assert_eq!(clustering.cluster(1).live_slots(), 0);
    }

    struct Tracked {
        inner: SystemAllocator,
        drops: Rc<RefCell<Vec<usize>>>,
        index: usize,
    }

    impl Allocator for Tracked {
        fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
            self.inner.allocate_aligned(size, alignment)
        }

        unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
            // Safety: Test code.
            unsafe { self.inner.deallocate_aligned(block, alignment) }
        }

        fn owns(&self, block: MemoryRange) -> bool {
            self.inner.owns(block)
        }

        fn max_allocation_size(&self) -> Bytes {
            self.inner.max_allocation_size()
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.borrow_mut().push(self.index);
        }
    }

    #[test]
    fn test_clusters_dropped_in_order() {
        let drops = Rc::new(RefCell::new(Vec::new()));
        let mut system = SystemAllocator::new();
        {
            let _clustering = ClusteringAllocator::new(&mut system, CLASSES, 3, |index, _| {
                Ok(Tracked {
                    inner: SystemAllocator::new(),
                    drops: Rc::clone(&drops),
                    index,
                })
            })
            .unwrap();
        }
        assert_eq!(*drops.borrow(), [0, 1, 2]);
        assert_eq!(system.live_blocks(), 0);
    }

    #[test]
    fn test_failing_factory_cleans_up() {
        let drops = Rc::new(RefCell::new(Vec::new()));
        let mut system = SystemAllocator::new();
        let result = ClusteringAllocator::new(&mut system, CLASSES, 4, |index, _| {
            if index == 2 {
                return Err(MemoryError::OutOfMemory("test factory"));
            }
            Ok(Tracked {
                inner: SystemAllocator::new(),
                drops: Rc::clone(&drops),
                index,
            })
        });
        assert!(matches!(result, Err(MemoryError::OutOfMemory("test factory"))));
        drop(result);
        assert_eq!(*drops.borrow(), [0, 1]);
        assert_eq!(system.live_blocks(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "cluster order must be non-zero")]
    fn test_zero_order_rejected() {
        let _ = ClusteringAllocator::new(SystemAllocator::new(), CLASSES, 0, pool_factory);
    }
}
