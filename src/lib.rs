#[cfg(not(target_pointer_width = "64"))]
compile_error!("stratum supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// core vocabulary
pub use memory::allocator::{Allocator, CountingAllocator};
pub use memory::units::{Alignment, Bytes, MemoryAddress, MemoryRange};

// leaf allocators
pub use memory::linear::LinearAllocator;
pub use memory::pool::{FreeList, IntrusiveFreeList, NonIntrusiveFreeList, PoolAllocator};
pub use memory::resource::VirtualMemoryResource;
pub use memory::system::SystemAllocator;
pub use memory::tlsf::{TlsfConfig, TwoLevelSegregatedFitAllocator};

// page commit policies
pub use memory::page::{
    CompactPageAllocatorPolicy, FastPageAllocatorPolicy, PageAllocator, PageAllocatorConfig,
    PageAllocatorPolicy,
};

// composition
pub use memory::cascading::{CascadeConstructor, CascadingAllocator};
pub use memory::clustering::{
    ClusterPolicy, ClusteringAllocator, ExponentialClusterPolicy, LinearClusterPolicy,
};
pub use memory::registry::{AllocatorRegistry, NamedAllocator, SharedAllocator};

// vm/stats
pub use memory::stats::MemoryStats;
pub use memory::vm::{VirtualBuffer, page_alignment, page_size};

// errors
pub use memory::error::MemoryError;
