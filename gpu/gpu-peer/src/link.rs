//! # Peer Link Establishment
//!
//! Cross-device operations over two slot tables. Every call locks both
//! tables in ascending device-index order (the shared two-lock helper), so
//! concurrent establishment between the same pair cannot deadlock, and the
//! mirrored invariant holds: whenever device A has a slot for (B, transport),
//! B has one for (A, transport) with the same refcount.

use crate::table::{PeerTable, Transport};
use gpu_sync::{SpinLock, lock_pair};
use log::{error, info};

/// Hardware programming seam for peer slots. One implementation serves all
/// devices; tests record the calls.
pub trait PeerHw {
    /// Point `device`'s slot `index` at `remote` over `transport`.
    fn enable(&mut self, device: usize, index: u8, remote: usize, transport: Transport);

    /// Unprogram `device`'s slot `index`.
    fn disable(&mut self, device: usize, index: u8);
}

/// The pair of slot indices a mapping occupies, one per side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PeerIds {
    pub local: u8,
    pub remote: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    /// Recoverable: one of the two devices has all slots in use. Nothing
    /// was modified.
    #[error("no free peer slots between devices {local} and {remote}")]
    NoFreeSlots { local: usize, remote: usize },
    /// A pinned slot index is already programmed for something else.
    #[error("peer slot {index} on device {device} already in use")]
    SlotBusy { device: usize, index: u8 },
    #[error("devices {local} and {remote} share no {transport:?} mapping")]
    NotMapped {
        local: usize,
        remote: usize,
        transport: Transport,
    },
    /// A device cannot peer with itself.
    #[error("device {device} cannot peer with itself")]
    InvalidPair { device: usize },
}

/// Establish (or join) a peer mapping between two devices over `transport`.
///
/// Joining an existing (remote, transport) pair is idempotent: both
/// refcounts go up and the existing indices come back. A fresh mapping uses
/// `pinned` indices when given (local, remote order), otherwise the lowest
/// free index on each side; both sides are checked for a free slot **before
/// either is modified**, so exhaustion leaves no trace.
///
/// # Errors
/// See [`PeerError`].
pub fn create_mapping(
    local: (usize, &SpinLock<PeerTable>),
    remote: (usize, &SpinLock<PeerTable>),
    transport: Transport,
    pinned: Option<PeerIds>,
    hw: &mut dyn PeerHw,
) -> Result<PeerIds, PeerError> {
    let (local_dev, remote_dev) = (local.0, remote.0);
    if local_dev == remote_dev {
        return Err(PeerError::InvalidPair { device: local_dev });
    }
    let (mut lt, mut rt) = lock_pair(local, remote);
    debug_assert_eq!(lt.device(), local_dev);
    debug_assert_eq!(rt.device(), remote_dev);

    // Idempotent join.
    let existing = (
        lt.find(remote_dev, transport),
        rt.find(local_dev, transport),
    );
    match existing {
        (Some(li), Some(ri)) => {
            lt.retain(li);
            rt.retain(ri);
            return Ok(PeerIds {
                local: li,
                remote: ri,
            });
        }
        (None, None) => {}
        // One-sided residue from an earlier fault; clear it and start over.
        (li, ri) => {
            error!(
                "one-sided peer state between devices {local_dev} and {remote_dev} \
                 ({transport:?}): local slot {li:?}, remote slot {ri:?}; clearing"
            );
            if let Some(i) = li {
                hw.disable(local_dev, i);
                lt.clear(i);
            }
            if let Some(i) = ri {
                hw.disable(remote_dev, i);
                rt.clear(i);
            }
        }
    }

    // Pick both indices before touching either table.
    let (li, ri) = match pinned {
        Some(ids) => {
            if !lt.is_free(ids.local) {
                return Err(PeerError::SlotBusy {
                    device: local_dev,
                    index: ids.local,
                });
            }
            if !rt.is_free(ids.remote) {
                return Err(PeerError::SlotBusy {
                    device: remote_dev,
                    index: ids.remote,
                });
            }
            (ids.local, ids.remote)
        }
        None => {
            let li = lt.first_free();
            let ri = rt.first_free();
            match (li, ri) {
                (Some(li), Some(ri)) => (li, ri),
                _ => {
                    return Err(PeerError::NoFreeSlots {
                        local: local_dev,
                        remote: remote_dev,
                    });
                }
            }
        }
    };

    lt.occupy(li, remote_dev, transport);
    rt.occupy(ri, local_dev, transport);
    hw.enable(local_dev, li, remote_dev, transport);
    hw.enable(remote_dev, ri, local_dev, transport);
    info!(
        "peer mapping established: device {local_dev} slot {li} <-> device {remote_dev} slot {ri} ({transport:?})"
    );
    Ok(PeerIds {
        local: li,
        remote: ri,
    })
}

/// Drop one reference to the (local, remote, transport) mapping; the last
/// reference unprograms both sides and frees the slots.
///
/// Mirrored-state damage (one-sided slots, diverged refcounts) is logged,
/// forcibly normalized, and does not fail the call: teardown must make
/// progress on a device that already misbehaved once.
///
/// # Errors
/// [`PeerError::NotMapped`] when neither side knows the pair.
pub fn remove_mapping(
    local: (usize, &SpinLock<PeerTable>),
    remote: (usize, &SpinLock<PeerTable>),
    transport: Transport,
    hw: &mut dyn PeerHw,
) -> Result<(), PeerError> {
    let (local_dev, remote_dev) = (local.0, remote.0);
    if local_dev == remote_dev {
        return Err(PeerError::InvalidPair { device: local_dev });
    }
    let (mut lt, mut rt) = lock_pair(local, remote);

    let (li, ri) = match (
        lt.find(remote_dev, transport),
        rt.find(local_dev, transport),
    ) {
        (Some(li), Some(ri)) => (li, ri),
        (None, None) => {
            return Err(PeerError::NotMapped {
                local: local_dev,
                remote: remote_dev,
                transport,
            });
        }
        (li, ri) => {
            error!(
                "one-sided peer state between devices {local_dev} and {remote_dev} \
                 ({transport:?}) during teardown: local slot {li:?}, remote slot {ri:?}; \
                 clearing the stale side"
            );
            if let Some(i) = li {
                hw.disable(local_dev, i);
                lt.clear(i);
            }
            if let Some(i) = ri {
                hw.disable(remote_dev, i);
                rt.clear(i);
            }
            return Ok(());
        }
    };

    // Mirrored refcounts are an invariant; diverged counts get pulled to the
    // larger value so a stale low count cannot free a slot early.
    let (lc, rc) = (lt.refcount(li).unwrap_or(0), rt.refcount(ri).unwrap_or(0));
    if lc != rc {
        error!(
            "peer refcount divergence between devices {local_dev} (slot {li}: {lc}) and \
             {remote_dev} (slot {ri}: {rc}); normalizing to {max}",
            max = lc.max(rc)
        );
        let target = lc.max(rc);
        while lt.refcount(li).unwrap_or(target) < target {
            lt.retain(li);
        }
        while rt.refcount(ri).unwrap_or(target) < target {
            rt.retain(ri);
        }
    }

    let after = lt.release(li);
    rt.release(ri);
    if after == 0 {
        hw.disable(local_dev, li);
        hw.disable(remote_dev, ri);
        lt.clear(li);
        rt.clear(ri);
        info!(
            "peer mapping removed: device {local_dev} slot {li} <-> device {remote_dev} slot {ri} ({transport:?})"
        );
    }
    Ok(())
}
