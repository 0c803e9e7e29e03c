//! # Table Entry Encoding
//!
//! One 64-bit entry layout is shared by every level of both formats; levels
//! differ only in which virtual-address bits index them. An entry is in one
//! of four states (see [`EntryState`]): invalid, sparse, a pointer to the
//! next level's table, or a leaf mapping.

use bitfield_struct::bitfield;
use gpu_addresses::DeviceAddress;

/// Which address space a leaf page (or next-level table) lives in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TargetAperture {
    /// Device-local memory (VRAM); addresses are [`DeviceAddress`]es.
    DeviceLocal,
    /// Host-coherent system memory reached over the bus.
    HostCoherent,
    /// Another device's memory, reached through a peer slot. The entry's
    /// peer-index field selects the slot.
    Peer,
}

impl TargetAperture {
    const fn into_bits(self) -> u8 {
        match self {
            Self::DeviceLocal => 0,
            Self::HostCoherent => 1,
            Self::Peer => 2,
        }
    }

    const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::HostCoherent,
            2 => Self::Peer,
            _ => Self::DeviceLocal,
        }
    }
}

/// Decoded state of a table entry.
///
/// `Sparse` is the deliberate middle ground between mapped and unmapped:
/// the entry is structurally valid, translates to nothing, and is read as
/// zero by hardware instead of faulting. Speculative prefetch over a sparse
/// range is harmless; over an `Invalid` range it faults.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryState {
    Invalid,
    Sparse,
    /// Points at the next level's table instance.
    Table,
    /// Maps one page of the size governed by the entry's level.
    Leaf,
}

bitflags::bitflags! {
    /// Caller-selected attributes of a leaf mapping.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Writes through this mapping fault.
        const READ_ONLY = 1 << 0;
        /// Bypass device caches (e.g. buffers also read over the bus).
        const VOLATILE  = 1 << 1;
    }
}

/// Raw 64-bit table entry, identical at every level.
///
/// ### Bit layout
///
/// | Bits   | Name        | Meaning |
/// |--------|-------------|---------|
/// | 0      | `valid`     | Entry participates in translation |
/// | 1      | `sparse`    | When invalid: reads-as-zero, never faults |
/// | 2      | `table`     | When valid: points at the next level |
/// | 3–4    | `target`    | Aperture of the pointed-to memory |
/// | 5–7    | `peer`      | Peer slot index (leaf, `target == Peer`) |
/// | 8      | `volatile`  | Bypass device caches (leaf) |
/// | 9      | `read_only` | Write protection (leaf) |
/// | 10–11  | —           | Reserved |
/// | 12–51  | `page_number` | Physical address bits `[51:12]` |
/// | 52–63  | —           | Reserved |
#[bitfield(u64)]
pub struct PageEntryBits {
    pub valid: bool,
    pub sparse: bool,
    pub table: bool,
    #[bits(2)]
    target_bits: u8,
    #[bits(3)]
    pub peer: u8,
    pub volatile: bool,
    pub read_only: bool,
    #[bits(2)]
    reserved_low: u8,
    #[bits(40)]
    page_number: u64,
    #[bits(12)]
    reserved_high: u16,
}

impl PageEntryBits {
    /// A non-present entry. Accesses through it fault.
    #[inline]
    #[must_use]
    pub const fn invalid() -> Self {
        Self::new()
    }

    /// A structurally valid entry that maps nothing (reads-as-zero).
    #[inline]
    #[must_use]
    pub const fn make_sparse() -> Self {
        Self::new().with_sparse(true)
    }

    /// A pointer to the next level's table instance.
    #[inline]
    #[must_use]
    pub const fn make_table(table: DeviceAddress, target: TargetAperture) -> Self {
        Self::new()
            .with_valid(true)
            .with_table(true)
            .with_target_bits(target.into_bits())
            .with_page_number(table.as_u64() >> 12)
    }

    /// A leaf mapping one page at `addr` (device-local, bus, or peer
    /// address, per `target`).
    #[inline]
    #[must_use]
    pub const fn make_leaf(addr: u64, target: TargetAperture, peer: u8, flags: MapFlags) -> Self {
        Self::new()
            .with_valid(true)
            .with_table(false)
            .with_target_bits(target.into_bits())
            .with_peer(peer)
            .with_read_only(flags.contains(MapFlags::READ_ONLY))
            .with_volatile(flags.contains(MapFlags::VOLATILE))
            .with_page_number(addr >> 12)
    }

    /// Decode the entry state.
    #[inline]
    #[must_use]
    pub const fn state(self) -> EntryState {
        if self.valid() {
            if self.table() {
                EntryState::Table
            } else {
                EntryState::Leaf
            }
        } else if self.sparse() {
            EntryState::Sparse
        } else {
            EntryState::Invalid
        }
    }

    /// Physical address stored in the entry (page-aligned).
    #[inline]
    #[must_use]
    pub const fn address(self) -> u64 {
        self.page_number() << 12
    }

    /// Aperture of the pointed-to memory.
    #[inline]
    #[must_use]
    pub const fn target(self) -> TargetAperture {
        TargetAperture::from_bits(self.target_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_and_sparse_are_distinct() {
        assert_eq!(PageEntryBits::invalid().state(), EntryState::Invalid);
        assert_eq!(PageEntryBits::make_sparse().state(), EntryState::Sparse);
        assert_ne!(
            PageEntryBits::invalid().into_bits(),
            PageEntryBits::make_sparse().into_bits()
        );
    }

    #[test]
    fn table_entry_round_trip() {
        let e = PageEntryBits::make_table(DeviceAddress::new(0x40_5000), TargetAperture::DeviceLocal);
        assert_eq!(e.state(), EntryState::Table);
        assert_eq!(e.address(), 0x40_5000);
        assert_eq!(e.target(), TargetAperture::DeviceLocal);
    }

    #[test]
    fn leaf_entry_round_trip() {
        let e = PageEntryBits::make_leaf(
            0x1234_5000,
            TargetAperture::Peer,
            3,
            MapFlags::READ_ONLY | MapFlags::VOLATILE,
        );
        assert_eq!(e.state(), EntryState::Leaf);
        assert_eq!(e.address(), 0x1234_5000);
        assert_eq!(e.target(), TargetAperture::Peer);
        assert_eq!(e.peer(), 3);
        assert!(e.read_only());
        assert!(e.volatile());
    }

    #[test]
    fn survives_byte_round_trip() {
        let e = PageEntryBits::make_leaf(0xabc_d000, TargetAperture::HostCoherent, 0, MapFlags::empty());
        let bytes = e.into_bits().to_le_bytes();
        let back = PageEntryBits::from_bits(u64::from_le_bytes(bytes));
        assert_eq!(back.state(), EntryState::Leaf);
        assert_eq!(back.address(), 0xabc_d000);
        assert_eq!(back.target(), TargetAperture::HostCoherent);
    }
}
