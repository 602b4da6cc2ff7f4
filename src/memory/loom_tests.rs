/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Cover the shared state that more than one thread touches: the global
/// counters, the segregated-fit allocator's mutex and registry handles.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Two threads per model, one or two operations each.
///   - Every model builds fresh allocators (reservations go through the
///     heap-backed `VmOps` mock under cfg(loom)).
///   - Counters are created per model instead of using the global statics,
///     which do not reset between loom iterations.
#[cfg(loom)]
mod tests {
    use crate::memory::allocator::Allocator;
    use crate::memory::pool::{IntrusiveFreeList, PoolAllocator};
    use crate::memory::registry::AllocatorRegistry;
    use crate::memory::stats::Counter;
    use crate::memory::tlsf::{TlsfConfig, TwoLevelSegregatedFitAllocator};
    use crate::memory::units::{Alignment, Bytes};
    use crate::sync::Arc;
    use crate::sync::atomic::Ordering;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    fn small_tlsf() -> TwoLevelSegregatedFitAllocator {
        TwoLevelSegregatedFitAllocator::with_config(TlsfConfig {
            capacity: Bytes::kib(64),
            grow_size: Bytes::kib(4),
        })
        .unwrap()
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();
            assert_eq!(counter.get(), 20);
        });
    }

    #[test]
    fn loom_counter_fetch_add_is_unique() {
        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();

            let t1 = loom::thread::spawn(move || c1.fetch_add(1, Ordering::Relaxed));
            let mine = counter.fetch_add(1, Ordering::Relaxed);
            let theirs = t1.join().unwrap();

            assert_ne!(mine, theirs);
            assert_eq!(counter.get(), 2);
        });
    }

    // =====================================================================
    // 2. TwoLevelSegregatedFitAllocator
    // =====================================================================

    #[test]
    fn loom_tlsf_concurrent_allocate() {
        bounded(2).check(|| {
            let tlsf = Arc::new(small_tlsf());
            let t = tlsf.clone();

            let t1 = loom::thread::spawn(move || {
                let block = t.allocate(Bytes::new(100));
                assert!(!block.is_empty());
                block
            });
            let mine = tlsf.allocate(Bytes::new(200));
            let theirs = t1.join().unwrap();

            assert!(!mine.is_empty());
            assert!(mine.intersection(&theirs).is_empty());

            // Safety: Test code.
            unsafe {
                tlsf.deallocate(mine);
                tlsf.deallocate(theirs);
            }
            assert_eq!(tlsf.free_block_count(), 1);
        });
    }

    #[test]
    fn loom_tlsf_free_while_allocating() {
        bounded(2).check(|| {
            let tlsf = Arc::new(small_tlsf());
            let alignment = Alignment::new(64).unwrap();
            let first = tlsf.allocate_aligned(Bytes::new(128), alignment);
            let t = tlsf.clone();

            let t1 = loom::thread::spawn(move || {
                // Safety: Test code; `first` is handed over to this thread.
                unsafe { t.deallocate_aligned(first, alignment) };
            });
            let second = tlsf.allocate(Bytes::new(128));
            t1.join().unwrap();

            assert!(!second.is_empty());
            // Safety: Test code.
            unsafe { tlsf.deallocate(second) };
            assert_eq!(tlsf.free_block_count(), 1);
        });
    }

    // =====================================================================
    // 3. Registry handles
    // =====================================================================

    #[test]
    fn loom_registry_shared_pool() {
        bounded(2).check(|| {
            let mut registry = AllocatorRegistry::new();
            let pool = registry
                .register(
                    "particles",
                    PoolAllocator::<IntrusiveFreeList>::new(Bytes::new(64), Bytes::kib(4)).unwrap(),
                )
                .unwrap();
            let other = registry.get("particles").unwrap();

            let t1 = loom::thread::spawn(move || {
                let block = other.lock().unwrap().allocate(Bytes::new(32));
                assert!(!block.is_empty());
                block
            });
            let mine = pool.lock().unwrap().allocate(Bytes::new(32));
            let theirs = t1.join().unwrap();

            assert_ne!(mine.begin(), theirs.begin());
            let mut guard = pool.lock().unwrap();
            // Safety: Test code.
            unsafe {
                guard.deallocate(mine);
                guard.deallocate(theirs);
            }
        });
    }
}
