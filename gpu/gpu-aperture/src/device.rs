//! # Per-Device Context
//!
//! Owns everything one device's aperture management needs: the bus handle,
//! both apertures, and the register window the external aperture edits its
//! tables through. No global state; hosts hold one context per device,
//! usually wrapped in the [`SharedDevice`] lock.

use crate::bus::{ApertureKind, Binding, DeviceBus};
use crate::external::{ApertureGeometry, ExternalAperture, MapError, Policy, RangeMapping};
use crate::self_hosted::{
    ApertureError, ColdAperture, ResumeOptions, SelfHostedAperture, SelfMapConfig, wait_bind,
};
use crate::window::{RegisterWindow, WindowTableMemory};
use gpu_addresses::GpuVirtualAddress;
use gpu_ptw::{
    AddressingMode, MapFlags, PhysicalSource, TableAlloc, Translation, WalkContext,
};
use gpu_sync::SpinLock;
use log::info;

/// A device context behind the coarse per-device lock.
pub type SharedDevice<B> = SpinLock<DeviceContext<B>>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error(transparent)]
    Aperture(#[from] ApertureError),
    #[error("external aperture init failed: {0}")]
    External(#[from] MapError),
}

/// One attached device.
pub struct DeviceContext<B: DeviceBus> {
    id: usize,
    bus: B,
    self_hosted: SelfHostedAperture,
    external: ExternalAperture,
    /// Window state for external-aperture table edits; restores the base
    /// after each access since the self-hosted side also uses the window.
    ext_window: RegisterWindow,
}

impl<B: DeviceBus> DeviceContext<B> {
    /// Bring up both apertures. `tables` is the external physical allocator
    /// backing all steady-state page tables.
    ///
    /// # Errors
    /// Any bring-up failure; fatal to this device.
    pub fn attach(
        id: usize,
        mut bus: B,
        self_config: SelfMapConfig,
        external_geometry: ApertureGeometry,
        external_policy: Policy,
        tables: &mut dyn TableAlloc,
    ) -> Result<Self, AttachError> {
        let format = self_config.format;
        let self_hosted = ColdAperture::new(self_config).bootstrap(&mut bus, tables)?;

        let mut ext_window = RegisterWindow::new(true);
        let external = {
            let mut mem = WindowTableMemory {
                window: &mut ext_window,
                bus: &mut bus,
            };
            let mut ctx = WalkContext {
                mem: &mut mem,
                alloc: &mut *tables,
                mode: AddressingMode::DeviceLocal,
            };
            ExternalAperture::new(&mut ctx, format, external_geometry, external_policy)?
        };
        bus.bind_aperture(
            ApertureKind::External,
            Binding::Translated {
                root: external.root_address(),
                kind: format,
            },
        );
        wait_bind(&mut bus, self_config.bind_poll_budget).map_err(AttachError::Aperture)?;

        info!("device {id} attached");
        Ok(Self {
            id,
            bus,
            self_hosted,
            external,
            ext_window,
        })
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Map a driver-internal buffer into the self-hosted aperture.
    ///
    /// # Errors
    /// See [`SelfHostedAperture::map_buffer`].
    pub fn map_buffer(
        &mut self,
        source: &dyn PhysicalSource,
        flags: MapFlags,
    ) -> Result<GpuVirtualAddress, ApertureError> {
        self.self_hosted.map_buffer(&mut self.bus, source, flags)
    }

    /// # Errors
    /// See [`SelfHostedAperture::unmap_buffer`].
    pub fn unmap_buffer(
        &mut self,
        at: GpuVirtualAddress,
        len: u64,
    ) -> Result<(), ApertureError> {
        self.self_hosted.unmap_buffer(&mut self.bus, at, len)
    }

    /// Map client-visible memory through the external aperture.
    ///
    /// # Errors
    /// See [`ExternalAperture::map_range`].
    pub fn map_range(
        &mut self,
        tables: &mut dyn TableAlloc,
        source: &dyn PhysicalSource,
        flags: MapFlags,
    ) -> Result<RangeMapping, MapError> {
        let mut mem = WindowTableMemory {
            window: &mut self.ext_window,
            bus: &mut self.bus,
        };
        let mut ctx = WalkContext {
            mem: &mut mem,
            alloc: tables,
            mode: AddressingMode::DeviceLocal,
        };
        self.external.map_range(&mut ctx, source, flags)
    }

    /// # Errors
    /// See [`ExternalAperture::unmap_range`].
    pub fn unmap_range(
        &mut self,
        tables: &mut dyn TableAlloc,
        mapping: &RangeMapping,
    ) -> Result<(), MapError> {
        let mut mem = WindowTableMemory {
            window: &mut self.ext_window,
            bus: &mut self.bus,
        };
        let mut ctx = WalkContext {
            mem: &mut mem,
            alloc: tables,
            mode: AddressingMode::DeviceLocal,
        };
        self.external.unmap_range(&mut ctx, mapping)
    }

    /// Diagnostic: decode `va` from whichever tables `kind` selects,
    /// reading the bytes actually in device memory.
    pub fn translate(&mut self, kind: ApertureKind, va: GpuVirtualAddress) -> Translation {
        match kind {
            ApertureKind::SelfHosted => self.self_hosted.translate(&mut self.bus, va),
            ApertureKind::External => {
                let mut mem = WindowTableMemory {
                    window: &mut self.ext_window,
                    bus: &mut self.bus,
                };
                let mut frozen = NullAlloc;
                let mut ctx = WalkContext {
                    mem: &mut mem,
                    alloc: &mut frozen,
                    mode: AddressingMode::DeviceLocal,
                };
                self.external.translate(&mut ctx, va)
            }
        }
    }

    /// # Errors
    /// See [`SelfHostedAperture::suspend`].
    pub fn suspend(&mut self) -> Result<(), ApertureError> {
        self.self_hosted.suspend(&mut self.bus)
    }

    /// # Errors
    /// See [`SelfHostedAperture::resume`].
    pub fn resume(&mut self, options: ResumeOptions) -> Result<(), ApertureError> {
        self.self_hosted.resume(&mut self.bus, options)
    }

    /// Tear down both apertures and return table storage to `tables`.
    pub fn detach(mut self, tables: &mut dyn TableAlloc) {
        {
            let mut mem = WindowTableMemory {
                window: &mut self.ext_window,
                bus: &mut self.bus,
            };
            let mut ctx = WalkContext {
                mem: &mut mem,
                alloc: &mut *tables,
                mode: AddressingMode::DeviceLocal,
            };
            self.external.destroy(&mut ctx);
        }
        self.self_hosted.destroy(&mut self.bus, tables);
        info!("device {id} detached", id = self.id);
    }
}

/// Alloc seam for contexts that only ever read.
struct NullAlloc;

impl TableAlloc for NullAlloc {
    fn alloc_table(&mut self, _len: u64) -> Option<gpu_addresses::DeviceAddress> {
        None
    }

    fn free_table(&mut self, _addr: gpu_addresses::DeviceAddress, _len: u64) {}
}
