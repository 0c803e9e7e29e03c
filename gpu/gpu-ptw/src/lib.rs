//! # Page Table Walker
//!
//! A format-parameterized, multi-level radix-tree walker that maps virtual
//! ranges of an aperture's address space to physical pages. The walker knows
//! nothing about apertures: where its table bytes live and how they are
//! written is behind the [`TableMemory`] seam, and table backing storage
//! comes from the [`TableAlloc`] seam. The aperture layer decides whether
//! edits go through the indirect register window (bootstrap) or through the
//! aperture's own CPU pointer (steady state).
//!
//! ## Virtual Address → Physical Address Walk
//!
//! A virtual address is cut into per-level indices by the active
//! [`TableFormat`]. For the current three-level format:
//!
//! ```text
//! | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L0   |  L1   |  L2   | Offset |
//! ```
//!
//! Each level's table holds 2⁹ eight-byte entries. A **table entry** points
//! at the next level's instance; a **leaf entry** maps one page of the size
//! governed by the leaf level (4 KiB here, 64 KiB in the legacy two-level
//! format). A third entry state, **sparse**, is structurally valid but maps
//! nothing: hardware reads it as zero instead of faulting, which keeps
//! speculative prefetch away from genuinely unmapped memory.
//!
//! ## Structural operations
//!
//! - [`PageTableWalker::reserve_entries`] — create (idempotently) every table
//!   instance needed to later map a range.
//! - [`PageTableWalker::map`] — write leaf entries for a range, pulling pages
//!   from a [`PhysicalSource`] in page-size strides.
//! - [`PageTableWalker::sparsify`] — mark leaf entries sparse.
//! - [`PageTableWalker::unmap`] / [`PageTableWalker::release_entries`] —
//!   inverses; table instances are freed once nothing references them.
//! - [`PageTableWalker::commit_pdes`] — rewrite intermediate entries only,
//!   for flows that populate leaves through another path.
//! - [`PageTableWalker::translate`] — decode a single address from the table
//!   bytes actually in device memory (diagnostics; read-only).
//!
//! All structural operations are synchronous, not internally thread-safe
//! (the owning device lock serializes them), and leave previously written
//! entries valid on failure: the caller unwinds explicitly.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod entry;
mod format;
mod source;
mod walker;

pub use crate::entry::{EntryState, MapFlags, PageEntryBits, TargetAperture};
pub use crate::format::{FormatError, FormatKind, LevelFormat, TableFormat};
pub use crate::source::{ContiguousSource, PageArraySource, PeerSource, PhysicalSource};
pub use crate::walker::{
    AddressingMode, MapTarget, PageTableWalker, TableAlloc, TableMemory, Translation, WalkContext,
    WalkError,
};
