//! # Aperture Management
//!
//! Everything between the page-table walker and the device registers: the
//! indirect register window, the self-hosted aperture's staged bring-up, the
//! user-visible external aperture with its static and dynamic mapping
//! policies, and the per-device context that owns all of it.
//!
//! ## Bring-up at a glance
//!
//! ```text
//! Cold ──bind physical──▶ Physical bootstrap ──relocate──▶ Migrating
//!                         (tables via window)               (re-bind root)
//!                                                               │
//!                          Virtual steady state ◀──self-test────┘
//!                          (tables via aperture)
//! ```
//!
//! The self-hosted aperture translates the very tables that define it, so
//! bring-up builds a provisional table set in scratch memory first, writes
//! every entry through the [`window`], then migrates the set into the region
//! the tables already map and re-binds. Only after a bidirectional write/read
//! self-test does the aperture hand out mappings.
//!
//! Hardware is reached exclusively through the [`bus::DeviceBus`] seam; the
//! physical memory allocator is consumed through `TableAlloc` and
//! `PhysicalSource` from the walker crate. Tests fake both.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bus;
pub mod device;
pub mod external;
pub mod self_hosted;
pub mod va_alloc;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::bus::{ApertureKind, Binding, DeviceBus};
pub use crate::device::{AttachError, DeviceContext, SharedDevice};
pub use crate::external::{
    ApertureGeometry, ExternalAperture, MapError, MappingSegment, Policy, RangeMapping,
};
pub use crate::self_hosted::{
    ApertureError, ColdAperture, ResumeOptions, SelfHostedAperture, SelfMapConfig,
};
pub use crate::va_alloc::{VaError, VaRangeAllocator};
pub use crate::window::{RegisterWindow, WINDOW_ALIGN, WINDOW_LEN, WindowTableMemory};
