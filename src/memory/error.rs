use std::io;

/// Errors raised while *building* an allocator.
///
/// `allocate` never returns this type: an exhausted allocator answers with an
/// empty [`MemoryRange`](super::units::MemoryRange).
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
    #[error("invalid allocator configuration: {0}")]
    Configuration(String),
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
}

impl MemoryError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        debug_assert!(false, "invalid allocator configuration: {msg}");
        Self::Configuration(msg)
    }
}
