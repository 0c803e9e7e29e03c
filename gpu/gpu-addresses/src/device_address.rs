use crate::page_size::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// A **device-local** physical address: an offset into the device's own
/// memory (VRAM).
///
/// Newtype over `u64` to prevent mixing with bus or virtual addresses.
/// No alignment guarantees by itself.
///
/// ### Notes
/// - When stored in a page-table entry, the low `S::SHIFT` bits must be zero
///   for the page size `S` governed by the entry's level.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceAddress(u64);

/// A **host bus** physical address: system memory as seen by the device over
/// the bus.
///
/// Newtype over `u64` to prevent mixing with device-local addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BusAddress(u64);

impl DeviceAddress {
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

    /// Offset within a page of size `S`.
    #[inline]
    #[must_use]
    pub fn page_offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Align down to a multiple of `a` (non-zero power of two).
    #[inline]
    #[must_use]
    pub const fn align_down(self, a: u64) -> Self {
        Self(self.0 & !(a - 1))
    }

    /// Checked addition; `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl BusAddress {
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
}

impl Add<u64> for DeviceAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("DeviceAddress add"))
    }
}

impl AddAssign<u64> for DeviceAddress {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<Self> for DeviceAddress {
    type Output = u64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("DeviceAddress sub")
    }
}

impl Add<u64> for BusAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.checked_add(rhs).expect("BusAddress add"))
    }
}

impl Sub<Self> for BusAddress {
    type Output = u64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0.checked_sub(rhs.0).expect("BusAddress sub")
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x} (device)", self.0)
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x}", self.0)
    }
}

impl fmt::Debug for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012x} (bus)", self.0)
    }
}

impl From<u64> for DeviceAddress {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

impl From<u64> for BusAddress {
    fn from(addr: u64) -> Self {
        Self::new(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_size::{Size4K, Size64K};

    #[test]
    fn device_address_arithmetic() {
        let a = DeviceAddress::new(0x1_0000);
        assert_eq!((a + 0x200).as_u64(), 0x1_0200);
        assert_eq!((a + 0x200) - a, 0x200);
        assert_eq!(a.align_down(0x1_0000), a);
        assert_eq!(DeviceAddress::new(0x1_2345).align_down(0x1_0000), a);
    }

    #[test]
    fn alignment_checks() {
        assert!(DeviceAddress::new(0x3000).is_aligned::<Size4K>());
        assert!(!DeviceAddress::new(0x3000).is_aligned::<Size64K>());
        assert_eq!(DeviceAddress::new(0x3456).page_offset::<Size4K>(), 0x456);
    }
}
