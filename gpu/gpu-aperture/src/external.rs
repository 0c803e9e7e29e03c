//! # External Aperture
//!
//! The user-visible aperture through which clients reach device memory. Two
//! policies:
//!
//! - **Static**: the whole VA span is committed 1:1 onto one physical span
//!   at init. Mapping is address arithmetic plus a refcount; nothing is
//!   edited per request. Only contiguous device-local sources inside the
//!   span qualify.
//! - **Dynamic**: per-request VA allocation plus table edits. When no single
//!   free range fits, the request is split into progressively halved chunks
//!   (down to the page size) before giving up, so a fragmented VA space
//!   still serves large buffers as disjoint segments.

use crate::va_alloc::VaRangeAllocator;
use alloc::vec::Vec;
use gpu_addresses::{DeviceAddress, GpuVirtualAddress, HOST_PAGE_SIZE, align_up};
use gpu_ptw::{
    ContiguousSource, FormatKind, MapFlags, MapTarget, PageTableWalker, PhysicalSource,
    TargetAperture, Translation, WalkContext, WalkError,
};
use log::{error, warn};

/// Shape of the external aperture.
#[derive(Debug, Clone, Copy)]
pub struct ApertureGeometry {
    /// VA span. Multiple of the format's page size.
    pub va_len: u64,
}

/// Mapping policy, fixed at init.
#[derive(Debug, Clone, Copy)]
pub enum Policy {
    /// Pre-committed 1:1 onto `[phys_base, phys_base + va_len)`.
    Static { phys_base: DeviceAddress },
    Dynamic,
}

/// One contiguous VA piece of a dynamic mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingSegment {
    pub va: GpuVirtualAddress,
    pub len: u64,
}

/// Token returned by [`ExternalAperture::map_range`]; required to unmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeMapping {
    Static { va: GpuVirtualAddress, len: u64 },
    Dynamic { segments: Vec<MappingSegment> },
}

impl RangeMapping {
    /// VA of the first byte. Dynamic mappings with more than one segment
    /// have no single base; callers iterate the segments instead.
    #[must_use]
    pub fn va(&self) -> GpuVirtualAddress {
        match self {
            Self::Static { va, .. } => *va,
            Self::Dynamic { segments } => segments.first().map_or(GpuVirtualAddress::ZERO, |s| s.va),
        }
    }

    #[must_use]
    pub fn total_len(&self) -> u64 {
        match self {
            Self::Static { len, .. } => *len,
            Self::Dynamic { segments } => segments.iter().map(|s| s.len).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// Recoverable: not enough free VA even after chunking.
    #[error("no aperture space for {len:#x} bytes")]
    NoVaSpace { len: u64 },
    /// The source does not qualify for the static span.
    #[error("source not eligible for the static aperture span")]
    NotStaticEligible,
    #[error("page-table operation failed: {0}")]
    Walk(#[from] WalkError),
    /// Fatal: what the tables decode disagrees with what was just mapped.
    #[error("translation mismatch at {va}: expected {expected:#x}")]
    TranslationMismatch {
        va: GpuVirtualAddress,
        expected: u64,
    },
}

/// Sub-view of a source starting `skip_pages` pages in.
struct OffsetSource<'a> {
    inner: &'a dyn PhysicalSource,
    skip_pages: u64,
    len: u64,
}

impl PhysicalSource for OffsetSource<'_> {
    fn target(&self) -> TargetAperture {
        self.inner.target()
    }

    fn is_contiguous(&self) -> bool {
        self.inner.is_contiguous()
    }

    fn page(&self, n: u64, page_size: u64) -> Option<u64> {
        self.inner.page(self.skip_pages + n, page_size)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn peer_index(&self) -> u8 {
        self.inner.peer_index()
    }
}

/// The user-visible aperture's translation state.
pub struct ExternalAperture {
    walker: PageTableWalker,
    policy: Policy,
    geometry: ApertureGeometry,
    va: VaRangeAllocator,
    /// Live mappings under the static policy.
    static_refs: u32,
}

impl ExternalAperture {
    /// Build the aperture's tables. Under the static policy the whole span
    /// is reserved and committed here; under the dynamic policy only the
    /// root exists until the first mapping.
    ///
    /// # Errors
    /// Walk failures while pre-committing.
    pub fn new(
        ctx: &mut WalkContext<'_>,
        format: FormatKind,
        geometry: ApertureGeometry,
        policy: Policy,
    ) -> Result<Self, MapError> {
        let fmt = format.format();
        let mut walker = PageTableWalker::new(fmt, ctx)?;
        let va = match policy {
            Policy::Static { phys_base } => {
                let hi = GpuVirtualAddress::new(geometry.va_len - 1);
                walker.reserve_entries(ctx, fmt.leaf_level(), GpuVirtualAddress::ZERO, hi)?;
                let span = ContiguousSource::device_local(phys_base, geometry.va_len);
                walker.map(
                    ctx,
                    GpuVirtualAddress::ZERO,
                    hi,
                    &MapTarget {
                        source: &span,
                        flags: MapFlags::empty(),
                    },
                )?;
                VaRangeAllocator::new(GpuVirtualAddress::ZERO, 0)
            }
            Policy::Dynamic => VaRangeAllocator::new(GpuVirtualAddress::ZERO, geometry.va_len),
        };
        Ok(Self {
            walker,
            policy,
            geometry,
            va,
            static_refs: 0,
        })
    }

    #[must_use]
    pub const fn root_address(&self) -> DeviceAddress {
        self.walker.root_address()
    }

    /// Make `source` reachable through the aperture.
    ///
    /// # Errors
    /// [`MapError::NoVaSpace`] is recoverable (free something and retry);
    /// everything else aborts the request with already-created segments
    /// unwound.
    pub fn map_range(
        &mut self,
        ctx: &mut WalkContext<'_>,
        source: &dyn PhysicalSource,
        flags: MapFlags,
    ) -> Result<RangeMapping, MapError> {
        match self.policy {
            Policy::Static { phys_base } => self.map_static(phys_base, source),
            Policy::Dynamic => self.map_dynamic(ctx, source, flags),
        }
    }

    /// Release a mapping and restore free-VA accounting exactly.
    ///
    /// # Errors
    /// Walk rejection of a malformed segment range.
    pub fn unmap_range(
        &mut self,
        ctx: &mut WalkContext<'_>,
        mapping: &RangeMapping,
    ) -> Result<(), MapError> {
        match mapping {
            RangeMapping::Static { .. } => {
                if self.static_refs == 0 {
                    error!("static aperture unmap without a live mapping");
                } else {
                    self.static_refs -= 1;
                }
                Ok(())
            }
            RangeMapping::Dynamic { segments } => {
                for s in segments {
                    self.drop_segment(ctx, *s)?;
                }
                Ok(())
            }
        }
    }

    /// Decode `va` from the aperture's tables (diagnostics).
    pub fn translate(&self, ctx: &mut WalkContext<'_>, va: GpuVirtualAddress) -> Translation {
        self.walker.translate(&mut *ctx.mem, va)
    }

    /// Free VA bytes currently available to dynamic mappings.
    #[must_use]
    pub fn free_va(&self) -> u64 {
        self.va.total_free()
    }

    /// Free every table instance of this aperture.
    pub fn destroy(self, ctx: &mut WalkContext<'_>) {
        self.walker.destroy(ctx);
    }

    fn map_static(
        &mut self,
        phys_base: DeviceAddress,
        source: &dyn PhysicalSource,
    ) -> Result<RangeMapping, MapError> {
        let page = self.walker.format().page_size();
        if !source.is_contiguous() || source.target() != TargetAperture::DeviceLocal {
            return Err(MapError::NotStaticEligible);
        }
        let base = source.page(0, page).ok_or(MapError::NotStaticEligible)?;
        let len = source.len();
        let span_end = phys_base.as_u64() + self.geometry.va_len;
        if base < phys_base.as_u64() || base + len > span_end {
            return Err(MapError::NotStaticEligible);
        }
        self.static_refs += 1;
        Ok(RangeMapping::Static {
            va: GpuVirtualAddress::new(base - phys_base.as_u64()),
            len,
        })
    }

    fn map_dynamic(
        &mut self,
        ctx: &mut WalkContext<'_>,
        source: &dyn PhysicalSource,
        flags: MapFlags,
    ) -> Result<RangeMapping, MapError> {
        let page = self.walker.format().page_size();
        let total = align_up(source.len(), page);
        let floor = page.max(HOST_PAGE_SIZE);
        let mut segments: Vec<MappingSegment> = Vec::new();
        let mut covered = 0u64;
        let mut chunk = total;

        while covered < total {
            let want = chunk.min(total - covered);
            let Ok(at) = self.va.alloc(want, page) else {
                // Halve and retry; below the floor the space is genuinely
                // too fragmented.
                if chunk / 2 < floor {
                    self.unwind(ctx, &segments);
                    warn!(
                        "aperture map of {total:#x} bytes failed: {free:#x} free but fragmented",
                        free = self.va.total_free()
                    );
                    return Err(MapError::NoVaSpace { len: total });
                }
                chunk /= 2;
                continue;
            };
            let seg = MappingSegment { va: at, len: want };
            if let Err(e) = self.map_segment(ctx, seg, covered, source, flags) {
                self.va.free(at, want);
                self.unwind(ctx, &segments);
                return Err(e);
            }
            segments.push(seg);
            covered += want;
        }

        // Spot-check the first page of each segment against the source.
        let mut checked = 0u64;
        for s in &segments {
            let expected = source
                .page(checked / page, page)
                .ok_or(WalkError::SourceExhausted {
                    page: checked / page,
                })?;
            let got = self.walker.translate(&mut *ctx.mem, s.va);
            let ok = matches!(got, Translation::Mapped { addr, .. } if addr == expected);
            if !ok {
                error!(
                    "aperture mapping at {va} decodes to {got:?}, expected {expected:#x}",
                    va = s.va
                );
                self.unwind(ctx, &segments);
                return Err(MapError::TranslationMismatch {
                    va: s.va,
                    expected,
                });
            }
            checked += s.len;
        }

        Ok(RangeMapping::Dynamic { segments })
    }

    fn map_segment(
        &mut self,
        ctx: &mut WalkContext<'_>,
        seg: MappingSegment,
        source_offset: u64,
        source: &dyn PhysicalSource,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let page = self.walker.format().page_size();
        let leaf = self.walker.format().leaf_level();
        let hi = seg.va + (seg.len - 1);
        self.walker.reserve_entries(ctx, leaf, seg.va, hi)?;
        let view = OffsetSource {
            inner: source,
            skip_pages: source_offset / page,
            len: seg.len,
        };
        if let Err(e) = self.walker.map(
            ctx,
            seg.va,
            hi,
            &MapTarget {
                source: &view,
                flags,
            },
        ) {
            // Leaves written before the failure stay valid; clear them and
            // the reservation before reporting.
            self.walker.unmap(ctx, seg.va, hi)?;
            self.walker.release_entries(ctx, leaf, seg.va, hi)?;
            return Err(e.into());
        }
        Ok(())
    }

    fn drop_segment(
        &mut self,
        ctx: &mut WalkContext<'_>,
        seg: MappingSegment,
    ) -> Result<(), MapError> {
        let leaf = self.walker.format().leaf_level();
        let hi = seg.va + (seg.len - 1);
        self.walker.unmap(ctx, seg.va, hi)?;
        self.walker.release_entries(ctx, leaf, seg.va, hi)?;
        self.va.free(seg.va, seg.len);
        Ok(())
    }

    fn unwind(&mut self, ctx: &mut WalkContext<'_>, segments: &[MappingSegment]) {
        for s in segments {
            if let Err(e) = self.drop_segment(ctx, *s) {
                error!("unwind of segment at {va} failed: {e}", va = s.va);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_hosted::BumpCarve;
    use crate::testing::FakeDevice;
    use crate::window::{RegisterWindow, WindowTableMemory};
    use gpu_ptw::AddressingMode;

    const PAGE: u64 = 0x1000;

    /// Runs `f` with a walk context over fake VRAM.
    fn with_ctx<R>(dev: &mut FakeDevice, f: impl FnOnce(&mut WalkContext<'_>) -> R) -> R {
        let mut window = RegisterWindow::new(false);
        let mut mem = WindowTableMemory {
            window: &mut window,
            bus: dev,
        };
        let mut tables = BumpCarve::new(DeviceAddress::new(0x40_0000), 4 << 20);
        let mut ctx = WalkContext {
            mem: &mut mem,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        f(&mut ctx)
    }

    #[test]
    fn static_policy_is_address_arithmetic() {
        let mut dev = FakeDevice::new(16 << 20);
        with_ctx(&mut dev, |ctx| {
            let mut ap = ExternalAperture::new(
                ctx,
                FormatKind::Current,
                ApertureGeometry { va_len: 1 << 20 },
                Policy::Static {
                    phys_base: DeviceAddress::new(0x80_0000),
                },
            )
            .unwrap();

            let src = ContiguousSource::device_local(DeviceAddress::new(0x80_3000), 0x2000);
            let m = ap.map_range(ctx, &src, MapFlags::empty()).unwrap();
            assert_eq!(m.va(), GpuVirtualAddress::new(0x3000));
            assert_eq!(ap.static_refs, 1);

            // The pre-committed tables already translate the whole span.
            assert_eq!(
                ap.translate(ctx, GpuVirtualAddress::new(0x3000)),
                Translation::Mapped {
                    addr: 0x80_3000,
                    target: TargetAperture::DeviceLocal,
                    peer: 0,
                    page_size: PAGE,
                }
            );

            // Outside the span, or scattered: not eligible.
            let outside = ContiguousSource::device_local(DeviceAddress::new(0x200_0000), 0x1000);
            assert_eq!(
                ap.map_range(ctx, &outside, MapFlags::empty()).unwrap_err(),
                MapError::NotStaticEligible
            );

            ap.unmap_range(ctx, &m).unwrap();
            assert_eq!(ap.static_refs, 0);
        });
    }

    #[test]
    fn dynamic_mapping_round_trips_free_va() {
        let mut dev = FakeDevice::new(16 << 20);
        with_ctx(&mut dev, |ctx| {
            let mut ap = ExternalAperture::new(
                ctx,
                FormatKind::Current,
                ApertureGeometry { va_len: 1 << 20 },
                Policy::Dynamic,
            )
            .unwrap();
            let before = ap.free_va();

            let src = ContiguousSource::device_local(DeviceAddress::new(0x90_0000), 0x4000);
            let m = ap.map_range(ctx, &src, MapFlags::empty()).unwrap();
            assert_eq!(ap.free_va(), before - 0x4000);
            assert_eq!(m.total_len(), 0x4000);

            ap.unmap_range(ctx, &m).unwrap();
            assert_eq!(ap.free_va(), before);
            assert_eq!(ap.translate(ctx, m.va()), Translation::Unmapped);
        });
    }

    #[test]
    fn fragmentation_falls_back_to_smaller_chunks() {
        let mut dev = FakeDevice::new(16 << 20);
        with_ctx(&mut dev, |ctx| {
            let mut ap = ExternalAperture::new(
                ctx,
                FormatKind::Current,
                ApertureGeometry { va_len: 0x10000 },
                Policy::Dynamic,
            )
            .unwrap();

            // Fill the 64 KiB span with four 16 KiB buffers, then free the
            // first and third: 32 KiB free, largest hole 16 KiB.
            let mut held = Vec::new();
            for i in 0..4u64 {
                let src = ContiguousSource::device_local(
                    DeviceAddress::new(0xA0_0000 + i * 0x4000),
                    0x4000,
                );
                held.push(ap.map_range(ctx, &src, MapFlags::empty()).unwrap());
            }
            ap.unmap_range(ctx, &held[0]).unwrap();
            ap.unmap_range(ctx, &held[2]).unwrap();
            assert_eq!(ap.free_va(), 0x8000);

            // A 32 KiB request cannot sit in one hole; it must split.
            let big = ContiguousSource::device_local(DeviceAddress::new(0xB0_0000), 0x8000);
            let m = ap.map_range(ctx, &big, MapFlags::empty()).unwrap();
            let RangeMapping::Dynamic { segments } = &m else {
                panic!("dynamic policy must produce segments");
            };
            assert_eq!(segments.len(), 2);
            assert_eq!(m.total_len(), 0x8000);
            assert_eq!(ap.free_va(), 0);

            // Every page of the source is reachable through some segment.
            let mut offset = 0u64;
            for s in segments {
                for p in 0..(s.len / PAGE) {
                    let got = ap.translate(ctx, s.va + p * PAGE);
                    assert_eq!(
                        got,
                        Translation::Mapped {
                            addr: 0xB0_0000 + offset + p * PAGE,
                            target: TargetAperture::DeviceLocal,
                            peer: 0,
                            page_size: PAGE,
                        }
                    );
                }
                offset += s.len;
            }
        });
    }

    #[test]
    fn exhaustion_unwinds_and_reports_no_space() {
        let mut dev = FakeDevice::new(16 << 20);
        with_ctx(&mut dev, |ctx| {
            let mut ap = ExternalAperture::new(
                ctx,
                FormatKind::Current,
                ApertureGeometry { va_len: 0x4000 },
                Policy::Dynamic,
            )
            .unwrap();
            let src = ContiguousSource::device_local(DeviceAddress::new(0xC0_0000), 0x8000);
            assert_eq!(
                ap.map_range(ctx, &src, MapFlags::empty()).unwrap_err(),
                MapError::NoVaSpace { len: 0x8000 }
            );
            // Recoverable: accounting is untouched.
            assert_eq!(ap.free_va(), 0x4000);
        });
    }
}
