use crate::page_size::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// A virtual address within **one aperture's** VA space.
///
/// Each aperture roots its own translation tree, and its VA space starts at
/// zero. A `GpuVirtualAddress` therefore identifies a location only together
/// with the aperture it was allocated from; the type exists so device-local
/// and virtual offsets cannot be swapped silently.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GpuVirtualAddress(u64);

impl GpuVirtualAddress {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// `true` if the address is aligned to page size `S`.
    #[inline]
    #[must_use]
    pub fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    /// Extract the table index for the VA bit span `[hi:lo]` (inclusive).
    ///
    /// This is the generic form of the per-level index extraction; the
    /// bit span comes from the level format in use.
    #[inline]
    #[must_use]
    pub const fn level_index(self, lo_bit: u32, hi_bit: u32) -> u64 {
        (self.0 >> lo_bit) & ((1 << (hi_bit - lo_bit + 1)) - 1)
    }
}

impl Add<u64> for GpuVirtualAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("GpuVirtualAddress add"))
    }
}

impl AddAssign<u64> for GpuVirtualAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<Self> for GpuVirtualAddress {
    type Output = u64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("GpuVirtualAddress sub")
    }
}

impl fmt::Display for GpuVirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

impl fmt::Debug for GpuVirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x} (virtual)", self.0)
    }
}

impl From<u64> for GpuVirtualAddress {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}
