//! # Indirect Register Window
//!
//! A 1 MiB movable view of device-local memory, exposed through two
//! registers: a base and a data port. It exists before any aperture does,
//! which makes it the bring-up path for page-table writes, and stays
//! available afterwards for the table bytes the CPU-visible aperture prefix
//! does not reach.

use crate::bus::DeviceBus;
use gpu_addresses::DeviceAddress;
use gpu_ptw::TableMemory;

/// Bytes visible through the window at any one base.
pub const WINDOW_LEN: u64 = 1 << 20;

/// Relocation granularity; bases are aligned down to this.
pub const WINDOW_ALIGN: u64 = 64 * 1024;

/// Driver-side state of the window: just the restore policy.
///
/// The base itself lives in the device register (read back through the bus
/// seam); duplicating it here would invite skew.
#[derive(Debug)]
pub struct RegisterWindow {
    /// Put the base back where it was after each access. Off during
    /// bootstrap, when nobody else owns the window; on afterwards so
    /// concurrent diagnostic users see a stable base.
    restore_after_access: bool,
}

impl RegisterWindow {
    #[must_use]
    pub const fn new(restore_after_access: bool) -> Self {
        Self {
            restore_after_access,
        }
    }

    pub const fn set_restore(&mut self, restore: bool) {
        self.restore_after_access = restore;
    }

    /// Read `buf.len()` bytes of device-local memory at `addr`, relocating
    /// the window as needed. Transfers split transparently at window
    /// boundaries.
    pub fn read(&mut self, bus: &mut dyn DeviceBus, addr: DeviceAddress, buf: &mut [u8]) {
        self.access(bus, addr, buf.len() as u64, |bus, offset, at, len| {
            bus.window_read(offset, &mut buf[at..at + len]);
        });
    }

    /// Write `data` to device-local memory at `addr` (same relocation and
    /// splitting behavior as [`read`](Self::read)).
    pub fn write(&mut self, bus: &mut dyn DeviceBus, addr: DeviceAddress, data: &[u8]) {
        self.access(bus, addr, data.len() as u64, |bus, offset, at, len| {
            bus.window_write(offset, &data[at..at + len]);
        });
    }

    pub fn read_u32(&mut self, bus: &mut dyn DeviceBus, addr: DeviceAddress) -> u32 {
        let mut b = [0u8; 4];
        self.read(bus, addr, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn write_u32(&mut self, bus: &mut dyn DeviceBus, addr: DeviceAddress, value: u32) {
        self.write(bus, addr, &value.to_le_bytes());
    }

    pub fn read_u64(&mut self, bus: &mut dyn DeviceBus, addr: DeviceAddress) -> u64 {
        let mut b = [0u8; 8];
        self.read(bus, addr, &mut b);
        u64::from_le_bytes(b)
    }

    pub fn write_u64(&mut self, bus: &mut dyn DeviceBus, addr: DeviceAddress, value: u64) {
        self.write(bus, addr, &value.to_le_bytes());
    }

    /// Relocate (if needed), run `op` per in-window chunk, restore.
    fn access(
        &mut self,
        bus: &mut dyn DeviceBus,
        addr: DeviceAddress,
        len: u64,
        mut op: impl FnMut(&mut dyn DeviceBus, u64, usize, usize),
    ) {
        let saved = bus.window_base();
        let mut pos = addr;
        let mut done = 0u64;
        while done < len {
            let base = bus.window_base();
            let offset = pos.as_u64().wrapping_sub(base.as_u64());
            if pos < base || offset >= WINDOW_LEN {
                let base = pos.align_down(WINDOW_ALIGN);
                bus.set_window_base(base);
                continue;
            }
            let chunk = (len - done).min(WINDOW_LEN - offset);
            op(bus, offset, done as usize, chunk as usize);
            pos += chunk;
            done += chunk;
        }
        if self.restore_after_access && bus.window_base() != saved {
            bus.set_window_base(saved);
        }
    }
}

/// [`TableMemory`] over the window: the bootstrap edit path for page tables,
/// and the steady-state fallback for table bytes beyond the CPU-visible
/// aperture prefix.
pub struct WindowTableMemory<'a> {
    pub window: &'a mut RegisterWindow,
    pub bus: &'a mut dyn DeviceBus,
}

impl TableMemory for WindowTableMemory<'_> {
    fn read(&mut self, addr: DeviceAddress, buf: &mut [u8]) {
        self.window.read(self.bus, addr, buf);
    }

    fn write(&mut self, addr: DeviceAddress, data: &[u8]) {
        self.window.write(self.bus, addr, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;

    #[test]
    fn relocates_and_aligns_down() {
        let mut dev = FakeDevice::new(4 << 20);
        let mut win = RegisterWindow::new(false);
        win.write_u32(&mut dev, DeviceAddress::new(0x21_2340), 0xDEAD_BEEF);
        // Base moved to the containing 64 KiB boundary, not the address.
        assert_eq!(dev.window_base(), DeviceAddress::new(0x21_0000));
        assert_eq!(win.read_u32(&mut dev, DeviceAddress::new(0x21_2340)), 0xDEAD_BEEF);
    }

    #[test]
    fn in_window_access_does_not_move_the_base() {
        let mut dev = FakeDevice::new(4 << 20);
        let mut win = RegisterWindow::new(false);
        win.write_u32(&mut dev, DeviceAddress::new(0x10_0000), 1);
        let base = dev.window_base();
        win.write_u32(&mut dev, DeviceAddress::new(0x10_8000), 2);
        assert_eq!(dev.window_base(), base);
    }

    #[test]
    fn restore_policy_puts_the_base_back() {
        let mut dev = FakeDevice::new(4 << 20);
        let mut win = RegisterWindow::new(true);
        dev.set_window_base(DeviceAddress::new(0x30_0000));
        win.write_u32(&mut dev, DeviceAddress::new(0x1000), 7);
        assert_eq!(dev.window_base(), DeviceAddress::new(0x30_0000));

        win.set_restore(false);
        win.write_u32(&mut dev, DeviceAddress::new(0x1000), 7);
        assert_eq!(dev.window_base(), DeviceAddress::ZERO);
    }

    #[test]
    fn slice_splits_across_the_window_boundary() {
        let mut dev = FakeDevice::new(4 << 20);
        let mut win = RegisterWindow::new(false);
        // Straddles the 1 MiB span starting at the aligned base.
        let at = DeviceAddress::new(WINDOW_LEN - 4);
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        win.write(&mut dev, at, &data);
        let mut back = [0u8; 8];
        win.read(&mut dev, at, &mut back);
        assert_eq!(back, data);
    }
}
