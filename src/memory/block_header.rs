//! Boundary tags of the segregated-fit allocator.
//!
//! Every block starts with a [`BlockHeader`]: its total size (header
//! included) with two status bits packed into the low bits, and a pointer to
//! the physically preceding block. While a block is free the header is
//! extended into a [`FreeBlockHeader`] whose list links overlap the payload,
//! which is why no block may be smaller than [`MIN_BLOCK_SIZE`].
//!
//! Nothing here reads a block's payload region while the block is busy.

use super::units::{Bytes, MemoryAddress};
use std::ptr;

/// Block sizes and payload addresses are multiples of this.
pub(crate) const GRANULARITY: usize = 16;

const BUSY: usize = 0b01;
const LAST: usize = 0b10;
const FLAGS: usize = BUSY | LAST;

#[repr(C)]
pub(crate) struct BlockHeader {
    size_and_flags: usize,
    previous: *mut BlockHeader,
}

#[repr(C)]
pub(crate) struct FreeBlockHeader {
    pub(crate) header: BlockHeader,
    pub(crate) next_free: *mut FreeBlockHeader,
    pub(crate) previous_free: *mut FreeBlockHeader,
}

pub(crate) const HEADER_SIZE: Bytes = Bytes::of::<BlockHeader>();
pub(crate) const MIN_BLOCK_SIZE: Bytes = Bytes::of::<FreeBlockHeader>();

const _: () = assert!(HEADER_SIZE.get() == GRANULARITY);
const _: () = assert!(MIN_BLOCK_SIZE.get() == 2 * GRANULARITY);

impl BlockHeader {
    pub(crate) fn new(size: Bytes, previous: *mut BlockHeader) -> Self {
        debug_assert!(
            size.get().is_multiple_of(GRANULARITY),
            "block size {size} is not a multiple of {GRANULARITY}"
        );
        Self {
            size_and_flags: size.get(),
            previous,
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> Bytes {
        Bytes::new(self.size_and_flags & !FLAGS)
    }

    #[inline]
    pub(crate) fn set_size(&mut self, size: Bytes) {
        debug_assert!(size.get().is_multiple_of(GRANULARITY));
        self.size_and_flags = size.get() | (self.size_and_flags & FLAGS);
    }

    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.size_and_flags & BUSY != 0
    }

    #[inline]
    pub(crate) fn set_busy(&mut self, busy: bool) {
        if busy {
            self.size_and_flags |= BUSY;
        } else {
            self.size_and_flags &= !BUSY;
        }
    }

    /// Highest-addressed block of the pool.
    #[inline]
    pub(crate) fn is_last(&self) -> bool {
        self.size_and_flags & LAST != 0
    }

    #[inline]
    pub(crate) fn set_last(&mut self, last: bool) {
        if last {
            self.size_and_flags |= LAST;
        } else {
            self.size_and_flags &= !LAST;
        }
    }

    #[inline]
    pub(crate) fn previous(&self) -> *mut BlockHeader {
        self.previous
    }

    #[inline]
    pub(crate) fn set_previous(&mut self, previous: *mut BlockHeader) {
        self.previous = previous;
    }
}

/// Header address of the block at `address`.
#[inline]
pub(crate) fn at(address: MemoryAddress) -> *mut BlockHeader {
    address.as_ptr()
}

#[inline]
pub(crate) fn address_of(block: *mut BlockHeader) -> MemoryAddress {
    MemoryAddress::from_ptr(block)
}

/// First payload byte of `block`.
#[inline]
pub(crate) fn payload(block: *mut BlockHeader) -> MemoryAddress {
    address_of(block) + HEADER_SIZE
}

/// Header of the block whose payload starts at `payload`.
#[inline]
pub(crate) fn from_payload(payload: MemoryAddress) -> *mut BlockHeader {
    at(payload - HEADER_SIZE)
}

/// Physically following block.
///
/// # Safety
/// `block` must be a valid, non-last header.
#[inline]
pub(crate) unsafe fn next(block: *mut BlockHeader) -> *mut BlockHeader {
    // Safety: caller guarantees the header is valid.
    let size = unsafe { (*block).size() };
    at(address_of(block) + size)
}

/// Write a fresh free header at `address`.
///
/// # Safety
/// `address` must be writable for [`MIN_BLOCK_SIZE`] bytes.
pub(crate) unsafe fn write_free(
    address: MemoryAddress,
    size: Bytes,
    previous: *mut BlockHeader,
    last: bool,
) -> *mut FreeBlockHeader {
    let block = address.as_ptr::<FreeBlockHeader>();
    let mut header = BlockHeader::new(size, previous);
    header.set_last(last);
    // Safety: caller guarantees the memory is writable.
    unsafe {
        block.write(FreeBlockHeader {
            header,
            next_free: ptr::null_mut(),
            previous_free: ptr::null_mut(),
        });
    }
    block
}
