pub(crate) mod allocator;
pub(crate) mod block_header;
pub(crate) mod cascading;
pub(crate) mod clustering;
pub(crate) mod error;
pub(crate) mod linear;
pub(crate) mod loom_tests;
pub(crate) mod page;
pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod resource;
pub(crate) mod stats;
pub(crate) mod system;
pub(crate) mod tlsf;
pub(crate) mod units;
pub(crate) mod vm;

// Tests that assert exact values of the per-allocator commit gauges take the
// write side; tests that move those gauges take the read side.
#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
