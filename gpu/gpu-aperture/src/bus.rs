//! # Hardware Bus Seam
//!
//! Everything the aperture layer asks of the device is behind [`DeviceBus`]:
//! the indirect register window's base register and data port, aperture
//! binding, and CPU accesses through a bound aperture. Production code
//! implements this over MMIO; tests implement it with a byte-array VRAM and
//! a software table walk.

use gpu_addresses::DeviceAddress;
use gpu_ptw::FormatKind;

/// The two apertures one device exposes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ApertureKind {
    /// The driver-internal aperture whose tables live inside itself.
    SelfHosted,
    /// The user-visible aperture mapped into client address spaces.
    External,
}

/// What an aperture's base translation is programmed to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Binding {
    /// Passthrough: aperture offset N is device-local address N.
    /// Bring-up only.
    Physical,
    /// Translated through the tables rooted at `root`.
    Translated {
        root: DeviceAddress,
        kind: FormatKind,
    },
}

/// Register-level access to one device.
///
/// All methods take `&mut self`; the owning device lock serializes callers.
pub trait DeviceBus {
    /// Current base of the indirect register window (64 KiB aligned).
    fn window_base(&self) -> DeviceAddress;

    /// Relocate the indirect register window.
    fn set_window_base(&mut self, base: DeviceAddress);

    /// Read device-local memory through the window. `offset` is relative to
    /// the current window base and `offset + buf.len()` must stay inside the
    /// window span.
    fn window_read(&mut self, offset: u64, buf: &mut [u8]);

    /// Write device-local memory through the window (same bounds contract as
    /// [`window_read`](Self::window_read)).
    fn window_write(&mut self, offset: u64, data: &[u8]);

    /// Program an aperture binding. Takes effect asynchronously; poll
    /// [`bind_pending`](Self::bind_pending) until it reports completion.
    fn bind_aperture(&mut self, kind: ApertureKind, binding: Binding);

    /// `true` while the last [`bind_aperture`](Self::bind_aperture) has not
    /// taken effect yet.
    fn bind_pending(&mut self) -> bool;

    /// CPU read through a bound aperture at an aperture-space offset.
    fn aperture_read(&mut self, kind: ApertureKind, offset: u64, buf: &mut [u8]);

    /// CPU write through a bound aperture at an aperture-space offset.
    fn aperture_write(&mut self, kind: ApertureKind, offset: u64, data: &[u8]);
}
