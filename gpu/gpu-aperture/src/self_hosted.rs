//! # Self-Hosted Aperture
//!
//! The driver-internal aperture whose own page tables live inside the VA
//! range it translates. That circularity needs a staged bring-up:
//!
//! 1. **Cold** — nothing bound; only the register window works.
//! 2. **Physical bootstrap** — the aperture is bound in passthrough mode and
//!    a provisional table set is built in a caller-designated scratch region,
//!    every entry written through the window.
//! 3. **Migration** — the provisional tables are relocated into the final
//!    table region (which the provisional tables already map at VA zero),
//!    then the aperture is re-bound to translate through the moved root.
//! 4. **Virtual steady state** — a write/read self-test proves the aperture
//!    and the window agree; afterwards table edits go through the aperture's
//!    own CPU-visible prefix, window only for bytes beyond it.
//!
//! The phases are a type-state: [`ColdAperture::bootstrap`] consumes the
//! cold handle and only a fully verified [`SelfHostedAperture`] can map.

use crate::bus::{ApertureKind, Binding, DeviceBus};
use crate::va_alloc::{VaError, VaRangeAllocator};
use crate::window::{RegisterWindow, WindowTableMemory};
use gpu_addresses::{DeviceAddress, GpuVirtualAddress, align_up};
use gpu_ptw::{
    AddressingMode, ContiguousSource, FormatKind, MapFlags, MapTarget, PageTableWalker,
    PhysicalSource, TableAlloc, TableFormat, TableMemory, Translation, WalkContext, WalkError,
};
use log::{error, info};

/// Bring-up parameters for one device's self-hosted aperture.
#[derive(Debug, Clone, Copy)]
pub struct SelfMapConfig {
    pub format: FormatKind,
    /// VA span of the aperture. Multiple of the format's page size.
    pub aperture_len: u64,
    /// How much of the aperture the CPU mapping actually exposes. Table
    /// bytes beyond this prefix are edited through the window instead.
    pub cpu_visible_len: u64,
    /// Known-safe scratch for the provisional tables (reclaimed by the
    /// caller after bring-up).
    pub bootstrap_base: DeviceAddress,
    pub bootstrap_len: u64,
    /// Polls of bind-complete before giving up.
    pub bind_poll_budget: u32,
}

/// Options for re-verifying after a suspend cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeOptions {
    /// Skip the write/read self-test. Explicit opt-in for hosts where the
    /// resume path cannot tolerate the extra window traffic; the default
    /// always verifies.
    pub skip_self_test: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApertureError {
    #[error("page-table operation failed: {0}")]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Va(#[from] VaError),
    /// The external allocator could not back the final table region.
    #[error("no device memory for the table region ({len:#x} bytes)")]
    OutOfTableMemory { len: u64 },
    /// Fatal: the device never acknowledged an aperture bind.
    #[error("aperture bind did not complete within {polls} polls")]
    BindTimeout { polls: u32 },
    /// Fatal: the aperture and the window disagree about the same memory.
    #[error("self-test mismatch at {addr}: wrote {wrote:#x}, read back {read:#x}")]
    SelfTestMismatch {
        addr: DeviceAddress,
        wrote: u64,
        read: u64,
    },
}

/// Bump carve-out over a fixed region; tables are never returned.
///
/// Serves both the scratch region (provisional tables) and the final table
/// region (relocation target), which are populated exactly once each.
pub(crate) struct BumpCarve {
    next: DeviceAddress,
    end: DeviceAddress,
}

impl BumpCarve {
    pub(crate) fn new(base: DeviceAddress, len: u64) -> Self {
        Self {
            next: base,
            end: base + len,
        }
    }
}

impl TableAlloc for BumpCarve {
    fn alloc_table(&mut self, len: u64) -> Option<DeviceAddress> {
        let at = DeviceAddress::new(align_up(self.next.as_u64(), 0x1000));
        if (at + len) > self.end {
            return None;
        }
        self.next = at + len;
        Some(at)
    }

    fn free_table(&mut self, _addr: DeviceAddress, _len: u64) {
        // Carve-outs are reclaimed wholesale by their owner.
    }
}

/// Steady-state table set is fixed; nothing may allocate or free.
struct FrozenTables;

impl TableAlloc for FrozenTables {
    fn alloc_table(&mut self, _len: u64) -> Option<DeviceAddress> {
        None
    }

    fn free_table(&mut self, addr: DeviceAddress, _len: u64) {
        error!("steady-state walk tried to free table {addr}");
    }
}

/// Upper bound on the bytes of table storage needed to map `aperture_len`,
/// every instance 4 KiB aligned.
fn table_footprint(fmt: &TableFormat, aperture_len: u64) -> u64 {
    let mut total = 0;
    for lf in fmt.levels() {
        let coverage = lf.entry_count() * lf.entry_span();
        total += aperture_len.div_ceil(coverage) * align_up(lf.table_len(), 0x1000);
    }
    total
}

pub(crate) fn wait_bind(bus: &mut dyn DeviceBus, budget: u32) -> Result<(), ApertureError> {
    for _ in 0..budget {
        if !bus.bind_pending() {
            return Ok(());
        }
    }
    Err(ApertureError::BindTimeout { polls: budget })
}

/// Table edits through the aperture's own CPU mapping, window fallback for
/// bytes beyond the CPU-visible prefix.
struct ApertureTableMemory<'a> {
    bus: &'a mut dyn DeviceBus,
    window: &'a mut RegisterWindow,
    region: DeviceAddress,
    cpu_visible_len: u64,
}

impl ApertureTableMemory<'_> {
    /// Aperture offset of `addr` if the whole access stays CPU-visible.
    /// Table region physical addresses self-map at VA zero.
    fn aperture_offset(&self, addr: DeviceAddress, len: u64) -> Option<u64> {
        let offset = addr.as_u64().checked_sub(self.region.as_u64())?;
        (offset + len <= self.cpu_visible_len).then_some(offset)
    }
}

impl TableMemory for ApertureTableMemory<'_> {
    fn read(&mut self, addr: DeviceAddress, buf: &mut [u8]) {
        match self.aperture_offset(addr, buf.len() as u64) {
            Some(offset) => self
                .bus
                .aperture_read(ApertureKind::SelfHosted, offset, buf),
            None => self.window.read(self.bus, addr, buf),
        }
    }

    fn write(&mut self, addr: DeviceAddress, data: &[u8]) {
        match self.aperture_offset(addr, data.len() as u64) {
            Some(offset) => self
                .bus
                .aperture_write(ApertureKind::SelfHosted, offset, data),
            None => self.window.write(self.bus, addr, data),
        }
    }
}

/// The cold phase: configuration only, no device state yet.
#[derive(Debug)]
pub struct ColdAperture {
    config: SelfMapConfig,
}

impl ColdAperture {
    #[must_use]
    pub const fn new(config: SelfMapConfig) -> Self {
        Self { config }
    }

    /// Run the full bring-up. `tables` is the external physical allocator;
    /// the final table region is taken from it up front and kept until
    /// [`SelfHostedAperture::destroy`].
    ///
    /// Any error aborts bring-up; the device is left with the aperture in
    /// passthrough or unbound state and the caller treats the error as fatal
    /// to device init.
    ///
    /// # Errors
    /// See [`ApertureError`].
    pub fn bootstrap(
        self,
        bus: &mut dyn DeviceBus,
        tables: &mut dyn TableAlloc,
    ) -> Result<SelfHostedAperture, ApertureError> {
        let config = self.config;
        let fmt = config.format.format();
        let page = fmt.page_size();

        // Phase: physical bootstrap. Passthrough binding, window-only edits,
        // no restore (nobody else owns the window yet).
        bus.bind_aperture(ApertureKind::SelfHosted, Binding::Physical);
        wait_bind(bus, config.bind_poll_budget)?;
        let mut window = RegisterWindow::new(false);

        // Final table region and flush sentinel, from the external
        // allocator, before any table exists.
        let footprint = table_footprint(fmt, config.aperture_len);
        let prefix_len = align_up(footprint, page);
        let region_len = prefix_len + page;
        let region = tables
            .alloc_table(region_len)
            .ok_or(ApertureError::OutOfTableMemory { len: region_len })?;
        let sentinel_phys = region + prefix_len;
        let sentinel_va = GpuVirtualAddress::new(prefix_len);
        info!(
            "aperture bring-up: table region {region} ({region_len:#x} bytes), sentinel {sentinel_phys}"
        );

        // Provisional tables in the scratch carve-out. The whole VA span is
        // reserved here once; the steady state never grows the table set.
        let mut scratch = BumpCarve::new(config.bootstrap_base, config.bootstrap_len);
        let mut mem = WindowTableMemory {
            window: &mut window,
            bus: &mut *bus,
        };
        let mut ctx = WalkContext {
            mem: &mut mem,
            alloc: &mut scratch,
            mode: AddressingMode::DeviceLocal,
        };
        let mut walker = PageTableWalker::new(fmt, &mut ctx)?;
        let hi = GpuVirtualAddress::new(config.aperture_len - 1);
        walker.reserve_entries(&mut ctx, fmt.leaf_level(), GpuVirtualAddress::ZERO, hi)?;

        // Self-map: VA [0, prefix) onto the final table region, then the
        // sentinel page right behind it.
        let table_src = ContiguousSource::device_local(region, prefix_len);
        walker.map(
            &mut ctx,
            GpuVirtualAddress::ZERO,
            GpuVirtualAddress::new(prefix_len - 1),
            &MapTarget {
                source: &table_src,
                flags: MapFlags::empty(),
            },
        )?;
        let sentinel_src = ContiguousSource::device_local(sentinel_phys, page);
        walker.map(
            &mut ctx,
            sentinel_va,
            GpuVirtualAddress::new(prefix_len + page - 1),
            &MapTarget {
                source: &sentinel_src,
                flags: MapFlags::VOLATILE,
            },
        )?;

        // Phase: migration. Move every instance into the region it already
        // maps, then re-bind through the moved root.
        let mut final_region = BumpCarve::new(region, prefix_len);
        let root = walker.relocate_tables(&mut ctx, &mut final_region)?;
        bus.bind_aperture(
            ApertureKind::SelfHosted,
            Binding::Translated {
                root,
                kind: config.format,
            },
        );
        wait_bind(bus, config.bind_poll_budget)?;

        // Phase: virtual steady state.
        window.set_restore(true);
        let va_start = prefix_len + page;
        let mut aperture = SelfHostedAperture {
            config,
            window,
            walker,
            va: VaRangeAllocator::new(
                GpuVirtualAddress::new(va_start),
                config.aperture_len - va_start,
            ),
            region,
            region_len,
            prefix_len,
            sentinel_va,
            sentinel_phys,
        };
        aperture.self_test(bus)?;
        info!("aperture bring-up complete: root {root}");
        Ok(aperture)
    }
}

/// The verified, steady-state aperture. Only this type can map.
#[derive(Debug)]
pub struct SelfHostedAperture {
    config: SelfMapConfig,
    window: RegisterWindow,
    walker: PageTableWalker,
    va: VaRangeAllocator,
    /// Final table region (self-mapped at VA zero).
    region: DeviceAddress,
    region_len: u64,
    prefix_len: u64,
    sentinel_va: GpuVirtualAddress,
    sentinel_phys: DeviceAddress,
}

impl SelfHostedAperture {
    #[must_use]
    pub const fn root_address(&self) -> DeviceAddress {
        self.walker.root_address()
    }

    #[must_use]
    pub const fn sentinel_va(&self) -> GpuVirtualAddress {
        self.sentinel_va
    }

    /// Map a driver-internal buffer, returning its VA.
    ///
    /// # Errors
    /// [`VaError::NoVaSpace`] (recoverable) or a walk rejection.
    pub fn map_buffer(
        &mut self,
        bus: &mut dyn DeviceBus,
        source: &dyn PhysicalSource,
        flags: MapFlags,
    ) -> Result<GpuVirtualAddress, ApertureError> {
        let page = self.walker.format().page_size();
        let len = source.len();
        let at = self.va.alloc(len, page)?;
        let result = {
            let mut mem = ApertureTableMemory {
                bus: &mut *bus,
                window: &mut self.window,
                region: self.region,
                cpu_visible_len: self.config.cpu_visible_len.min(self.prefix_len),
            };
            let mut frozen = FrozenTables;
            let mut ctx = WalkContext {
                mem: &mut mem,
                alloc: &mut frozen,
                mode: AddressingMode::DeviceLocal,
            };
            self.walker
                .map(&mut ctx, at, at + (len - 1), &MapTarget { source, flags })
        };
        if let Err(e) = result {
            self.va.free(at, len);
            return Err(e.into());
        }
        self.flush(bus);
        Ok(at)
    }

    /// Undo a [`map_buffer`](Self::map_buffer).
    ///
    /// # Errors
    /// Walk rejection of a malformed range.
    pub fn unmap_buffer(
        &mut self,
        bus: &mut dyn DeviceBus,
        at: GpuVirtualAddress,
        len: u64,
    ) -> Result<(), ApertureError> {
        {
            let mut mem = ApertureTableMemory {
                bus: &mut *bus,
                window: &mut self.window,
                region: self.region,
                cpu_visible_len: self.config.cpu_visible_len.min(self.prefix_len),
            };
            let mut frozen = FrozenTables;
            let mut ctx = WalkContext {
                mem: &mut mem,
                alloc: &mut frozen,
                mode: AddressingMode::DeviceLocal,
            };
            self.walker.unmap(&mut ctx, at, at + (len - 1))?;
        }
        self.va.free(at, len);
        self.flush(bus);
        Ok(())
    }

    /// Decode `va` from the tables actually in device memory (diagnostics).
    pub fn translate(&mut self, bus: &mut dyn DeviceBus, va: GpuVirtualAddress) -> Translation {
        let mut mem = ApertureTableMemory {
            bus: &mut *bus,
            window: &mut self.window,
            region: self.region,
            cpu_visible_len: self.config.cpu_visible_len.min(self.prefix_len),
        };
        self.walker.translate(&mut mem, va)
    }

    /// Drain posted writes by reading the sentinel through the aperture.
    pub fn flush(&mut self, bus: &mut dyn DeviceBus) {
        let mut b = [0u8; 8];
        bus.aperture_read(ApertureKind::SelfHosted, self.sentinel_va.as_u64(), &mut b);
    }

    /// Drop back to passthrough before the device powers down. Tables stay
    /// in place; [`resume`](Self::resume) re-binds them.
    ///
    /// # Errors
    /// [`ApertureError::BindTimeout`].
    pub fn suspend(&mut self, bus: &mut dyn DeviceBus) -> Result<(), ApertureError> {
        bus.bind_aperture(ApertureKind::SelfHosted, Binding::Physical);
        wait_bind(bus, self.config.bind_poll_budget)?;
        info!("aperture suspended");
        Ok(())
    }

    /// Re-bind the existing tables after a suspend cycle and re-verify
    /// (unless opted out).
    ///
    /// # Errors
    /// [`ApertureError::BindTimeout`] or [`ApertureError::SelfTestMismatch`].
    pub fn resume(
        &mut self,
        bus: &mut dyn DeviceBus,
        options: ResumeOptions,
    ) -> Result<(), ApertureError> {
        bus.bind_aperture(
            ApertureKind::SelfHosted,
            Binding::Translated {
                root: self.walker.root_address(),
                kind: self.config.format,
            },
        );
        wait_bind(bus, self.config.bind_poll_budget)?;
        if options.skip_self_test {
            info!("aperture resumed, self-test skipped by request");
        } else {
            self.self_test(bus)?;
            info!("aperture resumed and re-verified");
        }
        Ok(())
    }

    /// Unbind and return the table region to the external allocator.
    pub fn destroy(self, bus: &mut dyn DeviceBus, tables: &mut dyn TableAlloc) {
        bus.bind_aperture(ApertureKind::SelfHosted, Binding::Physical);
        tables.free_table(self.region, self.region_len);
    }

    /// Write through the aperture at the sentinel VA, read back through the
    /// window at the sentinel physical address, then the reverse.
    fn self_test(&mut self, bus: &mut dyn DeviceBus) -> Result<(), ApertureError> {
        const FORWARD: u64 = 0x5A5A_C3C3_0F0F_A5A5;
        const REVERSE: u64 = 0xA5A5_3C3C_F0F0_5A5A;

        bus.aperture_write(
            ApertureKind::SelfHosted,
            self.sentinel_va.as_u64(),
            &FORWARD.to_le_bytes(),
        );
        let read = self.window.read_u64(bus, self.sentinel_phys);
        if read != FORWARD {
            error!(
                "self-test: aperture write not visible through window at {addr} (wrote {FORWARD:#x}, read {read:#x})",
                addr = self.sentinel_phys
            );
            return Err(ApertureError::SelfTestMismatch {
                addr: self.sentinel_phys,
                wrote: FORWARD,
                read,
            });
        }

        self.window.write_u64(bus, self.sentinel_phys, REVERSE);
        let mut b = [0u8; 8];
        bus.aperture_read(ApertureKind::SelfHosted, self.sentinel_va.as_u64(), &mut b);
        let read = u64::from_le_bytes(b);
        if read != REVERSE {
            error!(
                "self-test: window write not visible through aperture at {va} (wrote {REVERSE:#x}, read {read:#x})",
                va = self.sentinel_va
            );
            return Err(ApertureError::SelfTestMismatch {
                addr: self.sentinel_phys,
                wrote: REVERSE,
                read,
            });
        }
        Ok(())
    }
}
