use super::error::MemoryError;
use super::stats::{self, Counter};
use super::units::{Alignment, Bytes, MemoryAddress, MemoryRange};
use crate::sync::atomic::Ordering;
use std::ptr::NonNull;

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, MemoryError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError>;

    /// OS page size (commit granularity).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{MemoryError, NonNull, PlatformVmOps, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, MemoryError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(MemoryError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(MemoryError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(MemoryError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise.
            unsafe {
                // Committed pages are handed out immediately; ask for physical
                // backing now instead of taking a minor fault per page.
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
            };

            // NOTE: no zeroing here. Recommitted pages may hold stale data.
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
            // MADV_FREE marks pages for lazy reclamation, then PROT_NONE removes
            // access so a stray read of a decommitted page faults instead of
            // silently observing stale data.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(MemoryError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(MemoryError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(MemoryError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::*;
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, MemoryError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                libc::VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    libc::MEM_RESERVE,
                    libc::PAGE_NOACCESS,
                )
            };

            match NonNull::new(ptr as *mut u8) {
                Some(p) => Ok(p),
                None => Err(MemoryError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                libc::VirtualAlloc(
                    ptr.as_ptr() as *mut libc::c_void,
                    size,
                    libc::MEM_COMMIT,
                    libc::PAGE_READWRITE,
                )
            };

            if result.is_null() {
                return Err(MemoryError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
            // Safety: FFI call to VirtualFree.
            if unsafe {
                libc::VirtualFree(ptr.as_ptr() as *mut libc::c_void, size, libc::MEM_DECOMMIT)
            } == 0
            {
                return Err(MemoryError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
            // MEM_RELEASE requires size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { libc::VirtualFree(ptr.as_ptr() as *mut libc::c_void, 0, libc::MEM_RELEASE) }
                == 0
            {
                return Err(MemoryError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *PAGE_SIZE.get_or_init(|| unsafe {
                let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
                libc::GetSystemInfo(&mut info);
                info.dwPageSize as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom / Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// loom runs inside a single OS process with its own scheduler and Miri cannot
// model mprotect, so every "reservation" is a plain heap allocation. `commit`
// and `decommit` are no-ops: the memory is always accessible once reserved.
// Enough to check the synchronization logic (loom) and the unsafe pointer code
// (Miri); real page protection is covered by the platform tests below.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| MemoryError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            MemoryError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| MemoryError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

// ---------------------------------------------------------------------------
// Typed layer
// ---------------------------------------------------------------------------

/// OS page size: the granularity of every commit/decommit.
#[must_use]
pub fn page_size() -> Bytes {
    Bytes::new(PlatformVmOps::page_size())
}

#[must_use]
pub fn page_alignment() -> Alignment {
    Alignment::largest_dividing(page_size())
}

/// Commit `range` and account it against `counter`.
///
/// # Safety
/// `range` must be page-aligned and lie inside a live reservation.
pub(crate) unsafe fn commit(range: MemoryRange, counter: &Counter) -> Result<(), MemoryError> {
    if range.is_empty() {
        return Ok(());
    }
    debug_assert!(
        range.begin().is_aligned_to(page_alignment()) && range.size().is_multiple_of(page_size()),
        "commit of unaligned range {range:?}"
    );
    // Safety: non-empty range, caller guarantees it is reserved.
    let ptr = unsafe { NonNull::new_unchecked(range.as_ptr()) };
    // Safety: FFI call to commit memory.
    unsafe { PlatformVmOps::commit(ptr, range.size().get())? };
    stats::TOTAL_COMMITTED.fetch_add(range.size().get(), Ordering::Relaxed);
    counter.fetch_add(range.size().get(), Ordering::Relaxed);
    Ok(())
}

/// Decommit `range` and remove it from `counter`.
///
/// # Safety
/// `range` must be page-aligned, committed, and hold nothing still in use.
pub(crate) unsafe fn decommit(range: MemoryRange, counter: &Counter) -> Result<(), MemoryError> {
    if range.is_empty() {
        return Ok(());
    }
    debug_assert!(
        range.begin().is_aligned_to(page_alignment()) && range.size().is_multiple_of(page_size()),
        "decommit of unaligned range {range:?}"
    );
    // Safety: non-empty range, caller guarantees it is reserved.
    let ptr = unsafe { NonNull::new_unchecked(range.as_ptr()) };
    // Safety: FFI call to decommit memory.
    unsafe { PlatformVmOps::decommit(ptr, range.size().get())? };
    stats::sub_saturating(&stats::TOTAL_COMMITTED, range.size().get());
    stats::sub_saturating(counter, range.size().get());
    Ok(())
}

/// An owned, page-aligned reservation of virtual address space.
///
/// Nothing is committed on creation. Pages committed through
/// [`commit`] inside the buffer are released together with it on drop.
pub struct VirtualBuffer {
    range: MemoryRange,
}

// Safety: VirtualBuffer exclusively owns its reservation.
unsafe impl Send for VirtualBuffer {}

impl VirtualBuffer {
    /// Reserve at least `capacity` bytes (rounded up to whole pages).
    ///
    /// # Errors
    ///
    /// Returns `MemoryError` if the reservation fails or `capacity` is zero.
    pub fn reserve(capacity: Bytes) -> Result<Self, MemoryError> {
        if capacity.is_zero() {
            return Err(MemoryError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let capacity = capacity.round_up_to(page_size());
        // Safety: FFI call to reserve memory.
        let ptr = unsafe { PlatformVmOps::reserve(capacity.get())? };
        stats::TOTAL_RESERVED.fetch_add(capacity.get(), Ordering::Relaxed);

        Ok(Self {
            range: MemoryRange::from_parts(MemoryAddress::from_ptr(ptr.as_ptr()), capacity),
        })
    }

    #[must_use]
    pub fn range(&self) -> MemoryRange {
        self.range
    }
}

impl Drop for VirtualBuffer {
    fn drop(&mut self) {
        // Safety: the range is the exact reservation made in `reserve`.
        let ptr = unsafe { NonNull::new_unchecked(self.range.as_ptr()) };
        // Safety: FFI call to release memory; nothing may point into it anymore.
        if let Err(e) = unsafe { PlatformVmOps::release(ptr, self.range.size().get()) } {
            log::warn!("failed to release reservation {:?}: {e}", self.range);
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.range.size().get());
    }
}
