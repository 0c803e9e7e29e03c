//! # Peer Mapping Table
//!
//! Device-to-device memory access bookkeeping. Each device owns a fixed
//! table of eight peer slots; a leaf page-table entry targeting peer memory
//! names the slot that carries its traffic. Mappings are established
//! pairwise and mirrored: both devices hold a slot for the pair, with equal
//! refcounts, for each transport in use.
//!
//! The slot tables are the bookkeeping layer ([`PeerTable`]); establishment
//! and teardown, including both-sided locking and hardware programming
//! through the [`PeerHw`] seam, live in the link layer
//! ([`create_mapping`] / [`remove_mapping`]).

#![cfg_attr(not(test), no_std)]

mod link;
mod table;

pub use crate::link::{PeerError, PeerHw, PeerIds, create_mapping, remove_mapping};
pub use crate::table::{MAX_PEERS, PeerTable, Transport};
