//! # Typed Addresses for the GPU Aperture Subsystem
//!
//! The driver juggles three distinct address kinds and mixing them up is the
//! classic way to write a page-table entry that points at garbage:
//!
//! - [`DeviceAddress`] — an offset into **device-local memory** (VRAM). This
//!   is what page-table entries and the indirect register window operate on.
//! - [`BusAddress`] — a **host bus** physical address (system memory as the
//!   device sees it over the bus). Used for host-coherent backing pages.
//! - [`GpuVirtualAddress`] — a virtual address inside **one aperture's**
//!   VA space. Each aperture owns an independent space starting at zero;
//!   a `GpuVirtualAddress` is only meaningful together with its aperture.
//!
//! All three are `u64` newtypes with no implicit conversions between them.
//!
//! [`PageSize`] marker types ([`Size4K`], [`Size64K`], [`Size2M`]) carry the
//! page sizes the translation formats can govern; alignment checks go through
//! them so the page size in use is visible at the call site.

#![cfg_attr(not(test), no_std)]

mod device_address;
mod page_size;
mod virtual_address;

pub use crate::device_address::{BusAddress, DeviceAddress};
pub use crate::page_size::{PageSize, Size2M, Size4K, Size64K};
pub use crate::virtual_address::GpuVirtualAddress;

/// Page size of the host CPU. Dynamic aperture mappings never fragment below
/// this granularity.
pub const HOST_PAGE_SIZE: u64 = 4096;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; the bit trick is meaningless
/// otherwise. No runtime checks are performed.
///
/// ```rust
/// # use gpu_addresses::align_down;
/// assert_eq!(align_down(0x1_2345, 0x1_0000), 0x1_0000);
/// assert_eq!(align_down(0x2_0000, 0x1_0000), 0x2_0000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use gpu_addresses::align_up;
/// assert_eq!(align_up(0x1_2345, 0x1_0000), 0x2_0000);
/// assert_eq!(align_up(0x2_0000, 0x1_0000), 0x2_0000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// `true` if `x` is a multiple of `a` (`a` a non-zero power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert!(is_aligned(0x10000, Size64K::SIZE));
        assert!(!is_aligned(0x10800, Size64K::SIZE));
    }

    #[test]
    fn address_kinds_do_not_compare_equal_by_accident() {
        let d = DeviceAddress::new(0x1000);
        let d2 = DeviceAddress::new(0x1000);
        assert_eq!(d, d2);
        // DeviceAddress and GpuVirtualAddress are distinct types; the
        // following would not compile:
        // assert_eq!(d, GpuVirtualAddress::new(0x1000));
        let _ = d;
    }
}
