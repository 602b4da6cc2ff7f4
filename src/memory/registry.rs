use super::allocator::Allocator;
use super::error::MemoryError;
use super::units::{Alignment, Bytes, MemoryRange};
use crate::sync::{Arc, Mutex};
use std::collections::BTreeMap;

/// Wraps an allocator with a name and traces every call through `log`.
pub struct NamedAllocator<A> {
    name: String,
    inner: A,
}

impl<A: Allocator> NamedAllocator<A> {
    #[must_use]
    pub fn new(name: impl Into<String>, inner: A) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    #[must_use]
    pub fn into_inner(self) -> A {
        self.inner
    }
}

impl<A: Allocator> Allocator for NamedAllocator<A> {
    fn allocate(&mut self, size: Bytes) -> MemoryRange {
        let block = self.inner.allocate(size);
        log::trace!("[{}] allocate {size} -> {block:?}", self.name);
        block
    }

    fn allocate_aligned(&mut self, size: Bytes, alignment: Alignment) -> MemoryRange {
        let block = self.inner.allocate_aligned(size, alignment);
        log::trace!("[{}] allocate {size} align {alignment} -> {block:?}", self.name);
        block
    }

    unsafe fn deallocate(&mut self, block: MemoryRange) {
        log::trace!("[{}] deallocate {block:?}", self.name);
        // Safety: forwarded caller contract.
        unsafe { self.inner.deallocate(block) }
    }

    unsafe fn deallocate_aligned(&mut self, block: MemoryRange, alignment: Alignment) {
        log::trace!("[{}] deallocate {block:?} align {alignment}", self.name);
        // Safety: forwarded caller contract.
        unsafe { self.inner.deallocate_aligned(block, alignment) }
    }

    fn owns(&self, block: MemoryRange) -> bool {
        self.inner.owns(block)
    }

    fn max_allocation_size(&self) -> Bytes {
        self.inner.max_allocation_size()
    }
}

/// Allocator shared between the owners that looked it up by name.
pub type SharedAllocator = Arc<Mutex<Box<dyn Allocator + Send>>>;

/// Named shared allocators, built once at the application root and handed
/// to whoever needs them.
#[derive(Default)]
pub struct AllocatorRegistry {
    entries: BTreeMap<String, SharedAllocator>,
}

impl AllocatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `allocator` under `name` and return the shared handle.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if the name is already taken.
    pub fn register<A>(
        &mut self,
        name: impl Into<String>,
        allocator: A,
    ) -> Result<SharedAllocator, MemoryError>
    where
        A: Allocator + Send + 'static,
    {
        let boxed: Box<dyn Allocator + Send> = Box::new(allocator);
        let shared: SharedAllocator = Arc::new(Mutex::new(boxed));
        self.register_shared(name, shared.clone())?;
        Ok(shared)
    }

    /// Register an existing handle, so one allocator can be reachable under
    /// several names.
    ///
    /// # Errors
    ///
    /// Returns `MemoryError::Configuration` if the name is already taken.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        allocator: SharedAllocator,
    ) -> Result<(), MemoryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(MemoryError::configuration(format!(
                "allocator {name:?} is already registered"
            )));
        }
        log::debug!("registered allocator {name:?}");
        self.entries.insert(name, allocator);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<SharedAllocator> {
        self.entries.get(name).cloned()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
