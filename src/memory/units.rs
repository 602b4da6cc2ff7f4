//! Unit-safe wrappers for sizes, alignments and raw address ranges.
//!
//! None of these types touch memory. They exist so that a byte count can
//! never be passed where an address is expected, and so that every
//! alignment in the crate is known to be a power of two.

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::{Add, AddAssign, Div, Mul, Sub};

// ----------------------------------------------------------------------------
// Bytes
// ----------------------------------------------------------------------------

/// A non-negative amount of memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes(usize);

impl Bytes {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(count: usize) -> Self {
        Self(count)
    }

    #[must_use]
    pub const fn kib(count: usize) -> Self {
        Self(count * 1024)
    }

    #[must_use]
    pub const fn mib(count: usize) -> Self {
        Self(count * 1024 * 1024)
    }

    #[must_use]
    pub const fn of<T>() -> Self {
        Self(std::mem::size_of::<T>())
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
        match self.0.checked_sub(rhs.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: Self) -> Option<Self> {
        match self.0.checked_add(rhs.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Round up to the next multiple of `alignment`.
    #[inline]
    #[must_use]
    pub const fn round_up(self, alignment: Alignment) -> Self {
        let mask = alignment.get() - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Round down to the previous multiple of `alignment`.
    #[inline]
    #[must_use]
    pub const fn round_down(self, alignment: Alignment) -> Self {
        Self(self.0 & !(alignment.get() - 1))
    }

    /// Round up to a multiple of an arbitrary non-zero quantum.
    #[inline]
    #[must_use]
    pub const fn round_up_to(self, quantum: Self) -> Self {
        Self(self.0.next_multiple_of(quantum.0))
    }

    #[inline]
    #[must_use]
    pub const fn is_multiple_of(self, quantum: Self) -> bool {
        quantum.0 != 0 && self.0.is_multiple_of(quantum.0)
    }

    #[inline]
    #[must_use]
    pub const fn next_power_of_two(self) -> Self {
        Self(self.0.next_power_of_two())
    }
}

impl Add for Bytes {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Bytes {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

/// Panics on underflow: sizes are never negative.
impl Sub for Bytes {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        match self.0.checked_sub(rhs.0) {
            Some(v) => Self(v),
            None => panic!("Bytes underflow: {} - {}", self.0, rhs.0),
        }
    }
}

impl Mul<usize> for Bytes {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: usize) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<usize> for Bytes {
    type Output = Self;

    #[inline]
    fn div(self, rhs: usize) -> Self {
        Self(self.0 / rhs)
    }
}

impl Div for Bytes {
    type Output = usize;

    #[inline]
    fn div(self, rhs: Self) -> usize {
        self.0 / rhs.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

// ----------------------------------------------------------------------------
// Alignment
// ----------------------------------------------------------------------------

/// A power-of-two alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Alignment(NonZeroUsize);

impl Alignment {
    /// Alignment every allocator in the crate honours without padding.
    pub const MAX_FUNDAMENTAL: Self = Self::from_log2(4);

    pub const BYTE: Self = Self::from_log2(0);

    /// Returns `None` unless `value` is a power of two.
    #[must_use]
    pub const fn new(value: usize) -> Option<Self> {
        if value.is_power_of_two() {
            // Safety: powers of two are non-zero.
            Some(Self(unsafe { NonZeroUsize::new_unchecked(value) }))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn from_log2(log2: u32) -> Self {
        // Safety: a shifted one is never zero for log2 < usize::BITS.
        Self(unsafe { NonZeroUsize::new_unchecked(1usize << log2) })
    }

    #[must_use]
    pub const fn of<T>() -> Self {
        Self::from_log2(std::mem::align_of::<T>().trailing_zeros())
    }

    /// Largest power of two dividing `size` (`size` must be non-zero).
    #[must_use]
    pub const fn largest_dividing(size: Bytes) -> Self {
        debug_assert!(size.get() != 0, "largest_dividing(0) is undefined");
        Self::from_log2(size.get().trailing_zeros())
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }

    #[inline]
    #[must_use]
    pub const fn log2(self) -> u32 {
        self.0.get().trailing_zeros()
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(self) -> Bytes {
        Bytes(self.0.get())
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Self::MAX_FUNDAMENTAL
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "align({})", self.0)
    }
}

// ----------------------------------------------------------------------------
// MemoryAddress
// ----------------------------------------------------------------------------

/// A raw address. Carries no provenance and is never dereferenced directly;
/// convert with [`MemoryAddress::as_ptr`] inside an `unsafe` block.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryAddress(usize);

impl MemoryAddress {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self, alignment: Alignment) -> Self {
        let mask = alignment.get() - 1;
        Self((self.0 + mask) & !mask)
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, alignment: Alignment) -> Self {
        Self(self.0 & !(alignment.get() - 1))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, alignment: Alignment) -> bool {
        self.0 & (alignment.get() - 1) == 0
    }

    /// Distance from `origin` up to `self`. Panics if `origin > self`.
    #[inline]
    #[must_use]
    pub fn offset_from(self, origin: Self) -> Bytes {
        debug_assert!(origin.0 <= self.0, "{origin:?} is past {self:?}");
        Bytes(self.0 - origin.0)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: Bytes) -> Option<Self> {
        match self.0.checked_add(bytes.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Add<Bytes> for MemoryAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Bytes) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign<Bytes> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: Bytes) {
        self.0 += rhs.0;
    }
}

impl Sub<Bytes> for MemoryAddress {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Bytes) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// MemoryRange
// ----------------------------------------------------------------------------

/// Half-open address range `[begin, end)`. Empty iff `begin == end`.
///
/// An empty range is also the universal "allocation failed" value.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    begin: MemoryAddress,
    end: MemoryAddress,
}

impl MemoryRange {
    #[inline]
    #[must_use]
    pub fn new(begin: MemoryAddress, end: MemoryAddress) -> Self {
        assert!(begin <= end, "MemoryRange begin {begin} is past end {end}");
        Self { begin, end }
    }

    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            begin: MemoryAddress::NULL,
            end: MemoryAddress::NULL,
        }
    }

    #[inline]
    #[must_use]
    pub fn from_parts(begin: MemoryAddress, size: Bytes) -> Self {
        Self {
            begin,
            end: begin + size,
        }
    }

    #[inline]
    #[must_use]
    pub const fn begin(&self) -> MemoryAddress {
        self.begin
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> MemoryAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin.0 == self.end.0
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> Bytes {
        Bytes(self.end.0 - self.begin.0)
    }

    /// True when `other` lies entirely inside `self`. An empty `other` is
    /// contained only if its address falls inside `self`.
    #[inline]
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        if other.is_empty() {
            return self.contains_address(other.begin);
        }
        other.begin >= self.begin && other.end <= self.end
    }

    #[inline]
    #[must_use]
    pub fn contains_address(&self, address: MemoryAddress) -> bool {
        address >= self.begin && address < self.end
    }

    /// Smallest `alignment`-aligned window covering this range.
    #[inline]
    #[must_use]
    pub fn align_outward(&self, alignment: Alignment) -> Self {
        Self {
            begin: self.begin.align_down(alignment),
            end: self.end.align_up(alignment),
        }
    }

    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        if begin < end {
            Self { begin, end }
        } else {
            Self::empty()
        }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.begin.as_ptr()
    }
}

impl fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}
