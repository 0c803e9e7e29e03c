//! # Walker Core
//!
//! The walker owns one radix tree of **table instances** (backing storage
//! for one level node each). Instances are created on first reservation of a
//! covering range and freed when the last covering range is released. A
//! host-side mirror of every instance's entry states drives lifetime
//! decisions; the device-side bytes remain the authority for translation,
//! which decodes entries as the hardware would.

use crate::entry::{EntryState, MapFlags, PageEntryBits, TargetAperture};
use crate::format::TableFormat;
use crate::source::PhysicalSource;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use gpu_addresses::{DeviceAddress, GpuVirtualAddress};
use log::error;

/// Entry width shared by all supported formats (validated in
/// [`TableFormat::new`]).
const ENTRY_SIZE: u64 = 8;

/// Access to the raw bytes of page-table backing storage.
///
/// During bootstrap this is the indirect register window; in the steady
/// state it is the self-mapping aperture's CPU pointer. The walker does not
/// care which.
pub trait TableMemory {
    fn read(&mut self, addr: DeviceAddress, buf: &mut [u8]);
    fn write(&mut self, addr: DeviceAddress, data: &[u8]);
}

/// Source of backing storage for table instances.
///
/// Implemented by the external physical allocator (steady state) or a bump
/// carve-out (bootstrap). Returned tables must be 4 KiB aligned.
pub trait TableAlloc {
    fn alloc_table(&mut self, len: u64) -> Option<DeviceAddress>;
    fn free_table(&mut self, addr: DeviceAddress, len: u64);
}

/// Where table instances themselves live, recorded in every non-leaf entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressingMode {
    /// Tables live in device-local memory.
    DeviceLocal,
    /// Tables live in host-coherent system memory.
    HostPhysical,
}

/// Everything one structural operation needs, bundled per call.
///
/// A walk context never outlives a single operation; the aperture layer
/// constructs one on each call with whatever memory path is currently
/// appropriate (window during bootstrap, CPU pointer afterwards).
pub struct WalkContext<'a> {
    pub mem: &'a mut dyn TableMemory,
    pub alloc: &'a mut dyn TableAlloc,
    pub mode: AddressingMode,
}

impl WalkContext<'_> {
    const fn table_target(&self) -> TargetAperture {
        match self.mode {
            AddressingMode::DeviceLocal => TargetAperture::DeviceLocal,
            AddressingMode::HostPhysical => TargetAperture::HostCoherent,
        }
    }
}

/// What to write into leaf entries for a range.
pub struct MapTarget<'s> {
    pub source: &'s dyn PhysicalSource,
    pub flags: MapFlags,
}

/// Result of decoding one virtual address from the table bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Translation {
    Mapped {
        /// Physical address including the in-page offset.
        addr: u64,
        target: TargetAperture,
        peer: u8,
        page_size: u64,
    },
    /// Structurally valid, maps nothing, reads as zero. Distinct from
    /// `Unmapped`, which faults.
    Sparse,
    Unmapped,
}

/// Structural operation failures.
///
/// `NotReserved` and `PdeConflict` are programming errors on the caller's
/// side and are logged with context before being returned; the rest is
/// ordinary resource exhaustion or argument rejection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    #[error("invalid range {lo}..={hi} (alignment {align:#x})")]
    InvalidRange {
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
        align: u64,
    },
    #[error("table allocation failed at level {level}")]
    TableAllocFailed { level: usize },
    #[error("no reserved table instance covers {va}")]
    NotReserved { va: GpuVirtualAddress },
    #[error("entry at {va} maps a page where a table pointer is required")]
    PdeConflict { va: GpuVirtualAddress },
    #[error("physical source ran out at page {page}")]
    SourceExhausted { page: u64 },
    #[error("source length {have:#x} shorter than range length {need:#x}")]
    SourceTooSmall { need: u64, have: u64 },
    #[error("level {level} outside format depth {depth}")]
    BadLevel { level: usize, depth: usize },
}

/// Host-side mirror of one table instance.
#[derive(Debug)]
struct Node {
    addr: DeviceAddress,
    states: Vec<EntryState>,
    /// Per-entry reservation pins; these keep an instance alive even when
    /// no entry is valid yet.
    reserved: Vec<bool>,
    valid_count: u32,
    sparse_count: u32,
    reserved_count: u32,
    children: BTreeMap<u64, Node>,
}

impl Node {
    fn new(addr: DeviceAddress, entry_count: u64) -> Self {
        let n = entry_count as usize;
        Self {
            addr,
            states: vec![EntryState::Invalid; n],
            reserved: vec![false; n],
            valid_count: 0,
            sparse_count: 0,
            reserved_count: 0,
            children: BTreeMap::new(),
        }
    }

    /// An instance is live while any range still references it.
    fn live(&self) -> bool {
        self.valid_count > 0
            || self.sparse_count > 0
            || self.reserved_count > 0
            || !self.children.is_empty()
    }

    fn set_state(&mut self, idx: usize, new: EntryState) {
        let old = self.states[idx];
        if old == new {
            return;
        }
        match old {
            EntryState::Leaf | EntryState::Table => self.valid_count -= 1,
            EntryState::Sparse => self.sparse_count -= 1,
            EntryState::Invalid => {}
        }
        match new {
            EntryState::Leaf | EntryState::Table => self.valid_count += 1,
            EntryState::Sparse => self.sparse_count += 1,
            EntryState::Invalid => {}
        }
        self.states[idx] = new;
    }
}

fn read_entry(mem: &mut dyn TableMemory, table: DeviceAddress, idx: u64) -> PageEntryBits {
    let mut bytes = [0u8; ENTRY_SIZE as usize];
    mem.read(table + idx * ENTRY_SIZE, &mut bytes);
    PageEntryBits::from_bits(u64::from_le_bytes(bytes))
}

fn write_entry(mem: &mut dyn TableMemory, table: DeviceAddress, idx: u64, e: PageEntryBits) {
    mem.write(table + idx * ENTRY_SIZE, &e.into_bits().to_le_bytes());
}

fn zero_table(mem: &mut dyn TableMemory, addr: DeviceAddress, len: u64) {
    const ZEROES: [u8; 256] = [0u8; 256];
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(ZEROES.len() as u64);
        mem.write(addr + done, &ZEROES[..chunk as usize]);
        done += chunk;
    }
}

fn copy_table(mem: &mut dyn TableMemory, from: DeviceAddress, to: DeviceAddress, len: u64) {
    let mut buf = [0u8; 256];
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(buf.len() as u64);
        mem.read(from + done, &mut buf[..chunk as usize]);
        mem.write(to + done, &buf[..chunk as usize]);
        done += chunk;
    }
}

/// The per-aperture page-table engine.
///
/// One walker exists per aperture; it owns every table instance of that
/// aperture's translation tree, root included. Structural operations take
/// `&mut self`; the owning device lock provides serialization, the walker
/// itself adds none.
#[derive(Debug)]
pub struct PageTableWalker {
    format: &'static TableFormat,
    root: Node,
}

impl PageTableWalker {
    /// Allocate and zero the root table instance.
    ///
    /// # Errors
    /// [`WalkError::TableAllocFailed`] if the allocator cannot back the root.
    pub fn new(format: &'static TableFormat, ctx: &mut WalkContext<'_>) -> Result<Self, WalkError> {
        let root_fmt = format.level(0);
        let addr = ctx
            .alloc
            .alloc_table(root_fmt.table_len())
            .ok_or(WalkError::TableAllocFailed { level: 0 })?;
        zero_table(ctx.mem, addr, root_fmt.table_len());
        Ok(Self {
            format,
            root: Node::new(addr, root_fmt.entry_count()),
        })
    }

    /// Physical address of the root table (what the aperture binds to).
    #[inline]
    #[must_use]
    pub const fn root_address(&self) -> DeviceAddress {
        self.root.addr
    }

    #[inline]
    #[must_use]
    pub const fn format(&self) -> &'static TableFormat {
        self.format
    }

    /// Addresses of all live table instances, root first (diagnostics).
    #[must_use]
    pub fn table_instances(&self) -> Vec<DeviceAddress> {
        fn collect(node: &Node, out: &mut Vec<DeviceAddress>) {
            out.push(node.addr);
            for child in node.children.values() {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }

    /// Ensure every table instance needed to map `[lo, hi]` at `level`
    /// exists, pinning the covering entries. Idempotent.
    ///
    /// # Errors
    /// Range/level rejection, allocation failure, or a conflict with an
    /// existing leaf at an intermediate level.
    pub fn reserve_entries(
        &mut self,
        ctx: &mut WalkContext<'_>,
        level: usize,
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
    ) -> Result<(), WalkError> {
        self.check_level(level)?;
        self.check_range(lo, hi, self.format.level(level).entry_span())?;
        reserve_rec(self.format, ctx, &mut self.root, 0, level, 0, lo.as_u64(), hi.as_u64())
    }

    /// Unpin `[lo, hi]` at `level` and free any table instances no live
    /// range references anymore.
    ///
    /// # Errors
    /// Range/level rejection only; releasing an unreserved range is a no-op.
    pub fn release_entries(
        &mut self,
        ctx: &mut WalkContext<'_>,
        level: usize,
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
    ) -> Result<(), WalkError> {
        self.check_level(level)?;
        self.check_range(lo, hi, self.format.level(level).entry_span())?;
        release_rec(self.format, ctx, &mut self.root, 0, level, 0, lo.as_u64(), hi.as_u64())
    }

    /// Write leaf entries for `[lo, hi]`, pulling physical pages from the
    /// target's source in page-size strides.
    ///
    /// The covering table instances must have been reserved; a missing
    /// instance is a programming error ([`WalkError::NotReserved`]), never
    /// repaired silently. On failure, entries already written stay valid;
    /// the caller unwinds with [`unmap`](Self::unmap).
    ///
    /// # Errors
    /// See [`WalkError`].
    pub fn map(
        &mut self,
        ctx: &mut WalkContext<'_>,
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
        target: &MapTarget<'_>,
    ) -> Result<(), WalkError> {
        let ps = self.format.page_size();
        self.check_range(lo, hi, ps)?;
        let need = hi.as_u64() - lo.as_u64() + 1;
        if target.source.len() < need {
            return Err(WalkError::SourceTooSmall {
                need,
                have: target.source.len(),
            });
        }
        // Contiguous sources advance by plain addition from page zero;
        // scatter sources are indexed per page.
        let contiguous_base = if target.source.is_contiguous() {
            Some(
                target
                    .source
                    .page(0, ps)
                    .ok_or(WalkError::SourceExhausted { page: 0 })?,
            )
        } else {
            None
        };
        map_rec(
            self.format,
            ctx,
            &mut self.root,
            0,
            0,
            lo.as_u64(),
            hi.as_u64(),
            &LeafWrite {
                range_lo: lo.as_u64(),
                page_size: ps,
                contiguous_base,
                target,
            },
        )
    }

    /// Mark every leaf entry in `[lo, hi]` sparse: structurally valid,
    /// translating to nothing, read as zero by hardware.
    ///
    /// # Errors
    /// Same reservation requirement as [`map`](Self::map).
    pub fn sparsify(
        &mut self,
        ctx: &mut WalkContext<'_>,
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
    ) -> Result<(), WalkError> {
        let ps = self.format.page_size();
        self.check_range(lo, hi, ps)?;
        sparsify_rec(self.format, ctx, &mut self.root, 0, 0, lo.as_u64(), hi.as_u64())
    }

    /// Clear leaf entries in `[lo, hi]` back to hard-unmapped and free leaf
    /// instances that no longer hold anything.
    ///
    /// # Errors
    /// Range rejection only; unmapping never-mapped entries is a no-op.
    pub fn unmap(
        &mut self,
        ctx: &mut WalkContext<'_>,
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
    ) -> Result<(), WalkError> {
        let ps = self.format.page_size();
        self.check_range(lo, hi, ps)?;
        unmap_rec(self.format, ctx, &mut self.root, 0, 0, lo.as_u64(), hi.as_u64());
        Ok(())
    }

    /// Rewrite the non-leaf entries of `level` covering `[lo, hi]` from the
    /// instance tree.
    ///
    /// Used when leaf bytes were populated through another path (bulk copy
    /// during table migration) and only the directory entries need to be
    /// brought in line.
    ///
    /// # Errors
    /// Range/level rejection only.
    pub fn commit_pdes(
        &mut self,
        ctx: &mut WalkContext<'_>,
        level: usize,
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
    ) -> Result<(), WalkError> {
        if level >= self.format.leaf_level() {
            return Err(WalkError::BadLevel {
                level,
                depth: self.format.leaf_level(),
            });
        }
        self.check_range(lo, hi, self.format.level(level).entry_span())?;
        commit_rec(self.format, ctx, &mut self.root, 0, level, 0, lo.as_u64(), hi.as_u64());
        Ok(())
    }

    /// Decode one virtual address from the table bytes in device memory.
    ///
    /// Read-only with respect to the tables; safe to call without structural
    /// serialization as long as nothing mutates the tables concurrently.
    pub fn translate(&self, mem: &mut dyn TableMemory, va: GpuVirtualAddress) -> Translation {
        if va.as_u64() >= self.format.va_limit() {
            return Translation::Unmapped;
        }
        let mut table = self.root.addr;
        for lf in self.format.levels() {
            let e = read_entry(mem, table, lf.index(va));
            match e.state() {
                EntryState::Invalid => return Translation::Unmapped,
                EntryState::Sparse => return Translation::Sparse,
                EntryState::Table => table = DeviceAddress::new(e.address()),
                EntryState::Leaf => {
                    let page_size = lf.entry_span();
                    return Translation::Mapped {
                        addr: e.address() + (va.as_u64() & (page_size - 1)),
                        target: e.target(),
                        peer: e.peer(),
                        page_size,
                    };
                }
            }
        }
        // A Table state at the leaf level: corrupt tables.
        error!("translate({va}): leaf level holds a table pointer");
        Translation::Unmapped
    }

    /// Move every table instance to storage from `new_alloc`, leaf bytes
    /// copied verbatim, directory entries rewritten via
    /// [`commit_pdes`](Self::commit_pdes). Returns the new root address for
    /// rebinding.
    ///
    /// Both table sets coexist until the move is complete: the old tree is
    /// only read, never modified, so in-flight translations through the old
    /// root stay valid throughout. The old storage is returned to
    /// `ctx.alloc` afterwards.
    ///
    /// # Errors
    /// [`WalkError::TableAllocFailed`] if `new_alloc` cannot back an
    /// instance; the walker then still describes the old, intact tree.
    pub fn relocate_tables(
        &mut self,
        ctx: &mut WalkContext<'_>,
        new_alloc: &mut dyn TableAlloc,
    ) -> Result<DeviceAddress, WalkError> {
        // Pass 1: copy every instance, remembering the retired storage.
        let mut retired: Vec<(DeviceAddress, u64)> = Vec::new();
        relocate_rec(self.format, ctx, &mut self.root, 0, new_alloc, &mut retired)?;

        // Pass 2: the fresh copies still hold stale directory entries;
        // commit every intermediate level against the moved children.
        let hi = GpuVirtualAddress::new(self.format.va_limit() - 1);
        for level in 0..self.format.leaf_level() {
            self.commit_pdes(ctx, level, GpuVirtualAddress::ZERO, hi)?;
        }

        // Only now retire the old set.
        for (addr, len) in retired {
            ctx.alloc.free_table(addr, len);
        }
        Ok(self.root.addr)
    }

    /// Free every table instance, root included.
    pub fn destroy(mut self, ctx: &mut WalkContext<'_>) {
        fn rec(fmt: &TableFormat, ctx: &mut WalkContext<'_>, node: &mut Node, level: usize) {
            let mut children = core::mem::take(&mut node.children);
            for child in children.values_mut() {
                rec(fmt, ctx, child, level + 1);
            }
            ctx.alloc.free_table(node.addr, fmt.level(level).table_len());
        }
        rec(self.format, ctx, &mut self.root, 0);
    }

    fn check_level(&self, level: usize) -> Result<(), WalkError> {
        let depth = self.format.levels().len();
        if level >= depth {
            return Err(WalkError::BadLevel { level, depth });
        }
        Ok(())
    }

    fn check_range(
        &self,
        lo: GpuVirtualAddress,
        hi: GpuVirtualAddress,
        align: u64,
    ) -> Result<(), WalkError> {
        let reject = WalkError::InvalidRange { lo, hi, align };
        if lo.as_u64() > hi.as_u64() || hi.as_u64() >= self.format.va_limit() {
            return Err(reject);
        }
        if lo.as_u64() & (align - 1) != 0 || (hi.as_u64() + 1) & (align - 1) != 0 {
            return Err(reject);
        }
        Ok(())
    }
}

/// Per-entry index window of `[lo, hi]` within a node starting at `base`.
fn entry_window(span: u64, base: u64, lo: u64, hi: u64) -> (u64, u64) {
    ((lo - base) / span, (hi - base) / span)
}

fn ensure_child<'n>(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &'n mut Node,
    level: usize,
    idx: u64,
    entry_va: u64,
) -> Result<&'n mut Node, WalkError> {
    if node.states[idx as usize] == EntryState::Leaf {
        error!(
            "reserve: entry for {va} at level {level} already maps a page",
            va = GpuVirtualAddress::new(entry_va)
        );
        return Err(WalkError::PdeConflict {
            va: GpuVirtualAddress::new(entry_va),
        });
    }
    if node.states[idx as usize] != EntryState::Table {
        let clf = fmt.level(level + 1);
        let addr = ctx
            .alloc
            .alloc_table(clf.table_len())
            .ok_or(WalkError::TableAllocFailed { level: level + 1 })?;
        zero_table(ctx.mem, addr, clf.table_len());
        let target = ctx.table_target();
        write_entry(
            ctx.mem,
            node.addr,
            idx,
            PageEntryBits::make_table(addr, target),
        );
        node.set_state(idx as usize, EntryState::Table);
        node.children.insert(idx, Node::new(addr, clf.entry_count()));
    }
    Ok(node
        .children
        .get_mut(&idx)
        .expect("table state implies a child instance"))
}

#[allow(clippy::too_many_arguments)]
fn reserve_rec(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &mut Node,
    level: usize,
    target_level: usize,
    base: u64,
    lo: u64,
    hi: u64,
) -> Result<(), WalkError> {
    let span = fmt.level(level).entry_span();
    let (first, last) = entry_window(span, base, lo, hi);
    for i in first..=last {
        let entry_va = base + i * span;
        if level == target_level {
            if !node.reserved[i as usize] {
                node.reserved[i as usize] = true;
                node.reserved_count += 1;
            }
        } else {
            let child = ensure_child(fmt, ctx, node, level, i, entry_va)?;
            let clamped_lo = lo.max(entry_va);
            let clamped_hi = hi.min(entry_va + span - 1);
            reserve_rec(fmt, ctx, child, level + 1, target_level, entry_va, clamped_lo, clamped_hi)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn release_rec(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &mut Node,
    level: usize,
    target_level: usize,
    base: u64,
    lo: u64,
    hi: u64,
) -> Result<(), WalkError> {
    let span = fmt.level(level).entry_span();
    let (first, last) = entry_window(span, base, lo, hi);
    for i in first..=last {
        let entry_va = base + i * span;
        if level == target_level {
            if node.reserved[i as usize] {
                node.reserved[i as usize] = false;
                node.reserved_count -= 1;
            }
        } else if let Some(child) = node.children.get_mut(&i) {
            let clamped_lo = lo.max(entry_va);
            let clamped_hi = hi.min(entry_va + span - 1);
            release_rec(fmt, ctx, child, level + 1, target_level, entry_va, clamped_lo, clamped_hi)?;
            if !child.live() {
                free_child(fmt, ctx, node, level, i);
            }
        }
    }
    Ok(())
}

/// Detach and free the child instance behind entry `idx` of `node`.
fn free_child(fmt: &TableFormat, ctx: &mut WalkContext<'_>, node: &mut Node, level: usize, idx: u64) {
    if let Some(child) = node.children.remove(&idx) {
        ctx.alloc
            .free_table(child.addr, fmt.level(level + 1).table_len());
        write_entry(ctx.mem, node.addr, idx, PageEntryBits::invalid());
        node.set_state(idx as usize, EntryState::Invalid);
    }
}

/// Leaf-write parameters shared across the map recursion.
struct LeafWrite<'a, 's> {
    range_lo: u64,
    page_size: u64,
    contiguous_base: Option<u64>,
    target: &'a MapTarget<'s>,
}

impl LeafWrite<'_, '_> {
    fn entry_for(&self, entry_va: u64) -> Result<PageEntryBits, WalkError> {
        let n = (entry_va - self.range_lo) / self.page_size;
        let addr = match self.contiguous_base {
            Some(base) => base + n * self.page_size,
            None => self
                .target
                .source
                .page(n, self.page_size)
                .ok_or(WalkError::SourceExhausted { page: n })?,
        };
        Ok(PageEntryBits::make_leaf(
            addr,
            self.target.source.target(),
            self.target.source.peer_index(),
            self.target.flags,
        ))
    }
}

#[allow(clippy::too_many_arguments)]
fn map_rec(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &mut Node,
    level: usize,
    base: u64,
    lo: u64,
    hi: u64,
    write: &LeafWrite<'_, '_>,
) -> Result<(), WalkError> {
    let span = fmt.level(level).entry_span();
    let (first, last) = entry_window(span, base, lo, hi);
    for i in first..=last {
        let entry_va = base + i * span;
        if level == fmt.leaf_level() {
            if node.states[i as usize] == EntryState::Table {
                return Err(WalkError::PdeConflict {
                    va: GpuVirtualAddress::new(entry_va),
                });
            }
            write_entry(ctx.mem, node.addr, i, write.entry_for(entry_va)?);
            node.set_state(i as usize, EntryState::Leaf);
        } else {
            let Some(child) = node.children.get_mut(&i) else {
                let va = GpuVirtualAddress::new(entry_va);
                error!("map({va}): no reserved table instance at level {level}");
                return Err(WalkError::NotReserved { va });
            };
            let clamped_lo = lo.max(entry_va);
            let clamped_hi = hi.min(entry_va + span - 1);
            map_rec(fmt, ctx, child, level + 1, entry_va, clamped_lo, clamped_hi, write)?;
        }
    }
    Ok(())
}

fn sparsify_rec(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &mut Node,
    level: usize,
    base: u64,
    lo: u64,
    hi: u64,
) -> Result<(), WalkError> {
    let span = fmt.level(level).entry_span();
    let (first, last) = entry_window(span, base, lo, hi);
    for i in first..=last {
        let entry_va = base + i * span;
        if level == fmt.leaf_level() {
            if node.states[i as usize] == EntryState::Table {
                return Err(WalkError::PdeConflict {
                    va: GpuVirtualAddress::new(entry_va),
                });
            }
            write_entry(ctx.mem, node.addr, i, PageEntryBits::make_sparse());
            node.set_state(i as usize, EntryState::Sparse);
        } else {
            let Some(child) = node.children.get_mut(&i) else {
                let va = GpuVirtualAddress::new(entry_va);
                error!("sparsify({va}): no reserved table instance at level {level}");
                return Err(WalkError::NotReserved { va });
            };
            let clamped_lo = lo.max(entry_va);
            let clamped_hi = hi.min(entry_va + span - 1);
            sparsify_rec(fmt, ctx, child, level + 1, entry_va, clamped_lo, clamped_hi)?;
        }
    }
    Ok(())
}

fn unmap_rec(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &mut Node,
    level: usize,
    base: u64,
    lo: u64,
    hi: u64,
) {
    let span = fmt.level(level).entry_span();
    let (first, last) = entry_window(span, base, lo, hi);
    for i in first..=last {
        let entry_va = base + i * span;
        if level == fmt.leaf_level() {
            if node.states[i as usize] != EntryState::Invalid {
                write_entry(ctx.mem, node.addr, i, PageEntryBits::invalid());
                node.set_state(i as usize, EntryState::Invalid);
            }
        } else if node.children.contains_key(&i) {
            let clamped_lo = lo.max(entry_va);
            let clamped_hi = hi.min(entry_va + span - 1);
            if let Some(child) = node.children.get_mut(&i) {
                unmap_rec(fmt, ctx, child, level + 1, entry_va, clamped_lo, clamped_hi);
                if !child.live() {
                    free_child(fmt, ctx, node, level, i);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn commit_rec(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &mut Node,
    level: usize,
    target_level: usize,
    base: u64,
    lo: u64,
    hi: u64,
) {
    let span = fmt.level(level).entry_span();
    let (first, last) = entry_window(span, base, lo, hi);
    for i in first..=last {
        let entry_va = base + i * span;
        if level == target_level {
            if let Some(child) = node.children.get(&i) {
                let target = ctx.table_target();
                write_entry(
                    ctx.mem,
                    node.addr,
                    i,
                    PageEntryBits::make_table(child.addr, target),
                );
            }
        } else if let Some(child) = node.children.get_mut(&i) {
            let clamped_lo = lo.max(entry_va);
            let clamped_hi = hi.min(entry_va + span - 1);
            commit_rec(fmt, ctx, child, level + 1, target_level, entry_va, clamped_lo, clamped_hi);
        }
    }
}

fn relocate_rec(
    fmt: &TableFormat,
    ctx: &mut WalkContext<'_>,
    node: &mut Node,
    level: usize,
    new_alloc: &mut dyn TableAlloc,
    retired: &mut Vec<(DeviceAddress, u64)>,
) -> Result<(), WalkError> {
    for child in node.children.values_mut() {
        relocate_rec(fmt, ctx, child, level + 1, new_alloc, retired)?;
    }
    let len = fmt.level(level).table_len();
    let new_addr = new_alloc
        .alloc_table(len)
        .ok_or(WalkError::TableAllocFailed { level })?;
    copy_table(ctx.mem, node.addr, new_addr, len);
    retired.push((node.addr, len));
    node.addr = new_addr;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatKind;
    use crate::source::{ContiguousSource, PageArraySource, PeerSource};

    /// Flat byte array standing in for device-local memory.
    struct TestVram {
        bytes: Vec<u8>,
    }

    impl TestVram {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![0; len],
            }
        }
    }

    impl TableMemory for TestVram {
        fn read(&mut self, addr: DeviceAddress, buf: &mut [u8]) {
            let at = addr.as_u64() as usize;
            buf.copy_from_slice(&self.bytes[at..at + buf.len()]);
        }

        fn write(&mut self, addr: DeviceAddress, data: &[u8]) {
            let at = addr.as_u64() as usize;
            self.bytes[at..at + data.len()].copy_from_slice(data);
        }
    }

    /// Bump allocator over a fixed VRAM region; counts live tables.
    struct BumpTables {
        next: u64,
        end: u64,
        live: usize,
    }

    impl BumpTables {
        fn new(base: u64, len: u64) -> Self {
            Self {
                next: base,
                end: base + len,
                live: 0,
            }
        }
    }

    impl TableAlloc for BumpTables {
        fn alloc_table(&mut self, len: u64) -> Option<DeviceAddress> {
            let at = (self.next + 0xFFF) & !0xFFF;
            if at + len > self.end {
                return None;
            }
            self.next = at + len;
            self.live += 1;
            Some(DeviceAddress::new(at))
        }

        fn free_table(&mut self, _addr: DeviceAddress, _len: u64) {
            self.live -= 1;
        }
    }

    fn setup(kind: FormatKind) -> (TestVram, BumpTables, PageTableWalker) {
        let mut vram = TestVram::new(2 << 20);
        let mut tables = BumpTables::new(0x10_0000, 1 << 20);
        let walker = {
            let mut ctx = WalkContext {
                mem: &mut vram,
                alloc: &mut tables,
                mode: AddressingMode::DeviceLocal,
            };
            PageTableWalker::new(kind.format(), &mut ctx).unwrap()
        };
        (vram, tables, walker)
    }

    fn va(v: u64) -> GpuVirtualAddress {
        GpuVirtualAddress::new(v)
    }

    #[test]
    fn map_then_translate_contiguous() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x4000 - 1))
            .unwrap();

        let src = ContiguousSource::device_local(DeviceAddress::new(0x8_0000), 0x4000);
        walker
            .map(
                &mut ctx,
                va(0),
                va(0x4000 - 1),
                &MapTarget {
                    source: &src,
                    flags: MapFlags::empty(),
                },
            )
            .unwrap();

        for page in 0..4u64 {
            let got = walker.translate(ctx.mem, va(page * 0x1000 + 0x123));
            assert_eq!(
                got,
                Translation::Mapped {
                    addr: 0x8_0000 + page * 0x1000 + 0x123,
                    target: TargetAperture::DeviceLocal,
                    peer: 0,
                    page_size: 0x1000,
                }
            );
        }
        assert_eq!(walker.translate(ctx.mem, va(0x4000)), Translation::Unmapped);
    }

    #[test]
    fn map_then_translate_page_array() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x3000 - 1))
            .unwrap();

        let pages = vec![0x7_0000u64, 0x3_0000, 0x9_0000];
        let src = PageArraySource::new(pages.clone(), 0x1000, TargetAperture::HostCoherent);
        walker
            .map(
                &mut ctx,
                va(0),
                va(0x3000 - 1),
                &MapTarget {
                    source: &src,
                    flags: MapFlags::VOLATILE,
                },
            )
            .unwrap();

        for (n, phys) in pages.iter().enumerate() {
            let got = walker.translate(ctx.mem, va(n as u64 * 0x1000));
            assert_eq!(
                got,
                Translation::Mapped {
                    addr: *phys,
                    target: TargetAperture::HostCoherent,
                    peer: 0,
                    page_size: 0x1000,
                }
            );
        }
    }

    #[test]
    fn peer_mapping_carries_slot_index() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0xFFF))
            .unwrap();
        let src = PeerSource::new(3, DeviceAddress::new(0x5_0000), 0x1000);
        walker
            .map(
                &mut ctx,
                va(0),
                va(0xFFF),
                &MapTarget {
                    source: &src,
                    flags: MapFlags::empty(),
                },
            )
            .unwrap();
        assert_eq!(
            walker.translate(ctx.mem, va(0)),
            Translation::Mapped {
                addr: 0x5_0000,
                target: TargetAperture::Peer,
                peer: 3,
                page_size: 0x1000,
            }
        );
    }

    #[test]
    fn reserve_is_idempotent() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x10_0000 - 1))
            .unwrap();
        let first = walker.table_instances();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x10_0000 - 1))
            .unwrap();
        assert_eq!(walker.table_instances(), first);
    }

    #[test]
    fn sparse_is_not_unmapped() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x1FFF))
            .unwrap();
        walker.sparsify(&mut ctx, va(0), va(0xFFF)).unwrap();
        assert_eq!(walker.translate(ctx.mem, va(0x800)), Translation::Sparse);
        assert_eq!(walker.translate(ctx.mem, va(0x1800)), Translation::Unmapped);
    }

    #[test]
    fn map_without_reserve_is_rejected() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let src = ContiguousSource::device_local(DeviceAddress::new(0x8_0000), 0x1000);
        let got = walker.map(
            &mut ctx,
            va(0),
            va(0xFFF),
            &MapTarget {
                source: &src,
                flags: MapFlags::empty(),
            },
        );
        assert_eq!(got, Err(WalkError::NotReserved { va: va(0) }));
    }

    #[test]
    fn unmap_and_release_free_instances() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x4000 - 1))
            .unwrap();
        let src = ContiguousSource::device_local(DeviceAddress::new(0x8_0000), 0x4000);
        walker
            .map(
                &mut ctx,
                va(0),
                va(0x4000 - 1),
                &MapTarget {
                    source: &src,
                    flags: MapFlags::empty(),
                },
            )
            .unwrap();

        walker.unmap(&mut ctx, va(0), va(0x4000 - 1)).unwrap();
        walker
            .release_entries(&mut ctx, leaf, va(0), va(0x4000 - 1))
            .unwrap();

        // Only the root remains.
        assert_eq!(walker.table_instances().len(), 1);
        assert_eq!(walker.translate(ctx.mem, va(0)), Translation::Unmapped);
        drop(ctx);
        assert_eq!(tables.live, 1);
    }

    #[test]
    fn misaligned_ranges_are_rejected() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        assert!(matches!(
            walker.reserve_entries(&mut ctx, leaf, va(0x100), va(0x1FFF)),
            Err(WalkError::InvalidRange { .. })
        ));
        assert!(matches!(
            walker.reserve_entries(&mut ctx, leaf, va(0x1000), va(0xFFF)),
            Err(WalkError::InvalidRange { .. })
        ));
        assert!(matches!(
            walker.reserve_entries(&mut ctx, leaf, va(0), va((1 << 39) - 1 + 0x1000)),
            Err(WalkError::InvalidRange { .. })
        ));
    }

    #[test]
    fn legacy_format_uses_large_pages() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Legacy);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x2_0000 - 1))
            .unwrap();
        let src = ContiguousSource::device_local(DeviceAddress::new(0x8_0000), 0x2_0000);
        walker
            .map(
                &mut ctx,
                va(0),
                va(0x2_0000 - 1),
                &MapTarget {
                    source: &src,
                    flags: MapFlags::empty(),
                },
            )
            .unwrap();
        assert_eq!(
            walker.translate(ctx.mem, va(0x1_8000)),
            Translation::Mapped {
                addr: 0x9_8000,
                target: TargetAperture::DeviceLocal,
                peer: 0,
                page_size: 0x1_0000,
            }
        );
    }

    #[test]
    fn relocate_preserves_translation() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x4000 - 1))
            .unwrap();
        let src = ContiguousSource::device_local(DeviceAddress::new(0x8_0000), 0x4000);
        walker
            .map(
                &mut ctx,
                va(0),
                va(0x4000 - 1),
                &MapTarget {
                    source: &src,
                    flags: MapFlags::empty(),
                },
            )
            .unwrap();
        let old_root = walker.root_address();
        let old_instances = walker.table_instances();

        let mut fresh = BumpTables::new(0x18_0000, 1 << 19);
        let new_root = walker.relocate_tables(&mut ctx, &mut fresh).unwrap();
        assert_ne!(new_root, old_root);

        // Clobber the retired tables; translation must not touch them.
        for addr in old_instances {
            let junk = [0xAAu8; 8];
            ctx.mem.write(addr, &junk);
        }
        assert_eq!(
            walker.translate(ctx.mem, va(0x2123)),
            Translation::Mapped {
                addr: 0x8_2123,
                target: TargetAperture::DeviceLocal,
                peer: 0,
                page_size: 0x1000,
            }
        );
    }

    #[test]
    fn destroy_frees_everything() {
        let (mut vram, mut tables, mut walker) = setup(FormatKind::Current);
        let mut ctx = WalkContext {
            mem: &mut vram,
            alloc: &mut tables,
            mode: AddressingMode::DeviceLocal,
        };
        let leaf = walker.format().leaf_level();
        walker
            .reserve_entries(&mut ctx, leaf, va(0), va(0x8000 - 1))
            .unwrap();
        walker.destroy(&mut ctx);
        drop(ctx);
        assert_eq!(tables.live, 0);
    }
}
