//! # Per-Device Peer Slot Table
//!
//! Each device has a fixed array of [`MAX_PEERS`] peer slots. A slot, once
//! programmed, carries traffic to one remote device over one transport; the
//! slot index is what leaf page-table entries store in their peer field.
//! The table is pure bookkeeping; hardware programming happens at the link
//! layer.

/// Peer slots per device, fixed by the entry encoding's 3-bit peer field.
pub const MAX_PEERS: usize = 8;

/// How peer traffic reaches the remote device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Transport {
    /// Bus mailbox path.
    Mailbox,
    /// Switched fabric path.
    Fabric,
}

/// One programmed slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PeerSlot {
    pub(crate) remote: usize,
    pub(crate) transport: Transport,
    /// Mappings alive through this slot. Saturating: once it hits the
    /// ceiling the slot is pinned for the device's lifetime.
    pub(crate) refcount: u32,
}

/// Slot bookkeeping for one device.
#[derive(Debug)]
pub struct PeerTable {
    device: usize,
    pub(crate) slots: [Option<PeerSlot>; MAX_PEERS],
}

impl PeerTable {
    /// An empty table for the device with the given index.
    #[must_use]
    pub const fn new(device: usize) -> Self {
        Self {
            device,
            slots: [None; MAX_PEERS],
        }
    }

    #[must_use]
    pub const fn device(&self) -> usize {
        self.device
    }

    /// Slot already carrying (`remote`, `transport`), if any. The two
    /// transports are tracked independently.
    #[must_use]
    pub fn find(&self, remote: usize, transport: Transport) -> Option<u8> {
        self.slots.iter().position(|s| {
            s.is_some_and(|s| s.remote == remote && s.transport == transport)
        }).map(|i| i as u8)
    }

    /// Lowest free slot index.
    #[must_use]
    pub fn first_free(&self) -> Option<u8> {
        self.slots.iter().position(Option::is_none).map(|i| i as u8)
    }

    #[must_use]
    pub fn is_free(&self, index: u8) -> bool {
        (index as usize) < MAX_PEERS && self.slots[index as usize].is_none()
    }

    /// Number of programmed slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Refcount of a programmed slot.
    #[must_use]
    pub fn refcount(&self, index: u8) -> Option<u32> {
        self.slots.get(index as usize)?.map(|s| s.refcount)
    }

    pub(crate) fn occupy(&mut self, index: u8, remote: usize, transport: Transport) {
        self.slots[index as usize] = Some(PeerSlot {
            remote,
            transport,
            refcount: 1,
        });
    }

    /// Saturating increment.
    pub(crate) fn retain(&mut self, index: u8) {
        if let Some(slot) = &mut self.slots[index as usize] {
            slot.refcount = slot.refcount.saturating_add(1);
        }
    }

    /// Decrement; returns the new count. A saturated slot stays saturated.
    pub(crate) fn release(&mut self, index: u8) -> u32 {
        match &mut self.slots[index as usize] {
            Some(slot) if slot.refcount == u32::MAX => u32::MAX,
            Some(slot) => {
                slot.refcount -= 1;
                slot.refcount
            }
            None => 0,
        }
    }

    pub(crate) fn clear(&mut self, index: u8) {
        self.slots[index as usize] = None;
    }
}
