//! # Physical Page Sources
//!
//! The physical memory allocator is an external collaborator; the walker
//! only ever sees it through [`PhysicalSource`]: a contiguous-or-not flag,
//! an accessor for the Nth page's physical address, and a page-aligned total
//! length. Contiguous sources let the walker advance by plain addition;
//! page-array sources are indexed per page.

use crate::entry::TargetAperture;
use alloc::vec::Vec;
use gpu_addresses::{BusAddress, DeviceAddress};

/// Supplier of physical backing pages for a mapping.
pub trait PhysicalSource {
    /// Aperture the backing pages live in.
    fn target(&self) -> TargetAperture;

    /// `true` if the pages form one physically contiguous run.
    fn is_contiguous(&self) -> bool;

    /// Physical address of the `n`th page of size `page_size`, or `None` if
    /// the source cannot supply that page (out of range, or its granularity
    /// does not match `page_size`).
    fn page(&self, n: u64, page_size: u64) -> Option<u64>;

    /// Total length in bytes. Page-size aligned.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peer slot index for [`TargetAperture::Peer`] sources. Zero otherwise.
    fn peer_index(&self) -> u8 {
        0
    }
}

/// One physically contiguous run of pages.
#[derive(Debug, Clone, Copy)]
pub struct ContiguousSource {
    base: u64,
    len: u64,
    target: TargetAperture,
}

impl ContiguousSource {
    /// A run in device-local memory.
    #[must_use]
    pub const fn device_local(base: DeviceAddress, len: u64) -> Self {
        Self {
            base: base.as_u64(),
            len,
            target: TargetAperture::DeviceLocal,
        }
    }

    /// A run in host-coherent system memory.
    #[must_use]
    pub const fn host(base: BusAddress, len: u64) -> Self {
        Self {
            base: base.as_u64(),
            len,
            target: TargetAperture::HostCoherent,
        }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl PhysicalSource for ContiguousSource {
    fn target(&self) -> TargetAperture {
        self.target
    }

    fn is_contiguous(&self) -> bool {
        true
    }

    fn page(&self, n: u64, page_size: u64) -> Option<u64> {
        let offset = n.checked_mul(page_size)?;
        if offset.checked_add(page_size)? > self.len {
            return None;
        }
        Some(self.base + offset)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// A scatter list of equally sized pages (the allocator's page granularity).
///
/// `page()` only answers for the source's own granularity; a caller asking
/// for a different stride is mixing page sizes and gets `None`.
#[derive(Debug, Clone)]
pub struct PageArraySource {
    pages: Vec<u64>,
    page_size: u64,
    target: TargetAperture,
}

impl PageArraySource {
    #[must_use]
    pub const fn new(pages: Vec<u64>, page_size: u64, target: TargetAperture) -> Self {
        Self {
            pages,
            page_size,
            target,
        }
    }

    #[must_use]
    pub fn device_local(pages: Vec<DeviceAddress>, page_size: u64) -> Self {
        Self {
            pages: pages.into_iter().map(DeviceAddress::as_u64).collect(),
            page_size,
            target: TargetAperture::DeviceLocal,
        }
    }
}

impl PhysicalSource for PageArraySource {
    fn target(&self) -> TargetAperture {
        self.target
    }

    fn is_contiguous(&self) -> bool {
        false
    }

    fn page(&self, n: u64, page_size: u64) -> Option<u64> {
        if page_size != self.page_size {
            return None;
        }
        self.pages.get(usize::try_from(n).ok()?).copied()
    }

    fn len(&self) -> u64 {
        self.pages.len() as u64 * self.page_size
    }
}

/// A contiguous window into another device's memory, reached through an
/// established peer slot.
#[derive(Debug, Clone, Copy)]
pub struct PeerSource {
    base: u64,
    len: u64,
    peer: u8,
}

impl PeerSource {
    #[must_use]
    pub const fn new(peer: u8, base: DeviceAddress, len: u64) -> Self {
        Self {
            base: base.as_u64(),
            len,
            peer,
        }
    }
}

impl PhysicalSource for PeerSource {
    fn target(&self) -> TargetAperture {
        TargetAperture::Peer
    }

    fn is_contiguous(&self) -> bool {
        true
    }

    fn page(&self, n: u64, page_size: u64) -> Option<u64> {
        let offset = n.checked_mul(page_size)?;
        if offset.checked_add(page_size)? > self.len {
            return None;
        }
        Some(self.base + offset)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn peer_index(&self) -> u8 {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_pages_advance_by_addition() {
        let s = ContiguousSource::device_local(DeviceAddress::new(0x10_0000), 0x3000);
        assert!(s.is_contiguous());
        assert_eq!(s.page(0, 0x1000), Some(0x10_0000));
        assert_eq!(s.page(2, 0x1000), Some(0x10_2000));
        assert_eq!(s.page(3, 0x1000), None);
    }

    #[test]
    fn page_array_rejects_foreign_stride() {
        let s = PageArraySource::device_local(
            alloc::vec![DeviceAddress::new(0x7000), DeviceAddress::new(0x3000)],
            0x1000,
        );
        assert!(!s.is_contiguous());
        assert_eq!(s.page(0, 0x1000), Some(0x7000));
        assert_eq!(s.page(1, 0x1000), Some(0x3000));
        assert_eq!(s.page(2, 0x1000), None);
        assert_eq!(s.page(0, 0x10000), None);
        assert_eq!(s.len(), 0x2000);
    }

    #[test]
    fn peer_source_carries_slot_index() {
        let s = PeerSource::new(5, DeviceAddress::new(0x4_0000), 0x2000);
        assert_eq!(s.target(), TargetAperture::Peer);
        assert_eq!(s.peer_index(), 5);
        assert_eq!(s.page(1, 0x1000), Some(0x4_1000));
    }
}
