//! Test double for [`DeviceBus`]: a byte-array VRAM, a relocatable window
//! over it, and aperture accesses that really walk whatever tables the code
//! under test wrote, decoding entries the way the hardware would.

use crate::bus::{ApertureKind, Binding, DeviceBus};
use gpu_addresses::DeviceAddress;
use gpu_ptw::{EntryState, FormatKind, PageEntryBits};

pub(crate) struct FakeDevice {
    vram: Vec<u8>,
    window_base: u64,
    bindings: [Option<Binding>; 2],
    /// Polls until a fresh bind reports complete.
    bind_latency: u32,
    pending: u32,
}

impl FakeDevice {
    pub(crate) fn new(vram_len: usize) -> Self {
        Self {
            vram: vec![0; vram_len],
            window_base: 0,
            bindings: [None, None],
            bind_latency: 0,
            pending: 0,
        }
    }

    pub(crate) fn set_bind_latency(&mut self, polls: u32) {
        self.bind_latency = polls;
    }

    pub(crate) fn vram(&self, at: DeviceAddress, len: usize) -> &[u8] {
        let at = at.as_u64() as usize;
        &self.vram[at..at + len]
    }

    fn slot(kind: ApertureKind) -> usize {
        match kind {
            ApertureKind::SelfHosted => 0,
            ApertureKind::External => 1,
        }
    }

    /// Software walk through the tables in VRAM, as the device would do it.
    fn walk(&self, root: u64, kind: FormatKind, va: u64) -> u64 {
        let fmt = kind.format();
        let mut table = root;
        for lf in fmt.levels() {
            let at = (table + lf.index(va.into()) * 8) as usize;
            let raw = u64::from_le_bytes(self.vram[at..at + 8].try_into().unwrap());
            let e = PageEntryBits::from_bits(raw);
            match e.state() {
                EntryState::Leaf => return e.address() + (va & (lf.entry_span() - 1)),
                EntryState::Table => table = e.address(),
                state => panic!("fault: {state:?} entry while walking va {va:#x}"),
            }
        }
        panic!("fault: no leaf for va {va:#x}");
    }

    /// Resolve an aperture offset to a physical address, chunked so that
    /// accesses never straddle a translated page.
    fn resolve(&self, kind: ApertureKind, offset: u64, len: u64) -> (u64, u64) {
        match self.bindings[Self::slot(kind)].expect("aperture not bound") {
            Binding::Physical => (offset, len),
            Binding::Translated { root, kind } => {
                let page = kind.format().page_size();
                let phys = self.walk(root.as_u64(), kind, offset);
                let in_page = page - (offset & (page - 1));
                (phys, len.min(in_page))
            }
        }
    }
}

impl DeviceBus for FakeDevice {
    fn window_base(&self) -> DeviceAddress {
        DeviceAddress::new(self.window_base)
    }

    fn set_window_base(&mut self, base: DeviceAddress) {
        assert_eq!(base.as_u64() % crate::window::WINDOW_ALIGN, 0);
        self.window_base = base.as_u64();
    }

    fn window_read(&mut self, offset: u64, buf: &mut [u8]) {
        assert!(offset + buf.len() as u64 <= crate::window::WINDOW_LEN);
        let at = (self.window_base + offset) as usize;
        buf.copy_from_slice(&self.vram[at..at + buf.len()]);
    }

    fn window_write(&mut self, offset: u64, data: &[u8]) {
        assert!(offset + data.len() as u64 <= crate::window::WINDOW_LEN);
        let at = (self.window_base + offset) as usize;
        self.vram[at..at + data.len()].copy_from_slice(data);
    }

    fn bind_aperture(&mut self, kind: ApertureKind, binding: Binding) {
        self.bindings[Self::slot(kind)] = Some(binding);
        self.pending = self.bind_latency;
    }

    fn bind_pending(&mut self) -> bool {
        if self.pending > 0 {
            self.pending -= 1;
            true
        } else {
            false
        }
    }

    fn aperture_read(&mut self, kind: ApertureKind, offset: u64, buf: &mut [u8]) {
        let mut done = 0u64;
        while done < buf.len() as u64 {
            let (phys, chunk) = self.resolve(kind, offset + done, buf.len() as u64 - done);
            let at = phys as usize;
            buf[done as usize..(done + chunk) as usize].copy_from_slice(&self.vram[at..at + chunk as usize]);
            done += chunk;
        }
    }

    fn aperture_write(&mut self, kind: ApertureKind, offset: u64, data: &[u8]) {
        let mut done = 0u64;
        while done < data.len() as u64 {
            let (phys, chunk) = self.resolve(kind, offset + done, data.len() as u64 - done);
            let at = phys as usize;
            self.vram[at..at + chunk as usize].copy_from_slice(&data[done as usize..(done + chunk) as usize]);
            done += chunk;
        }
    }
}
