//! Staged page-table updates.
//!
//! The bind walk builds a disconnected subtree for an address range:
//! brand-new page tables are written in place and linked through staging
//! slots, while entries inside already-shared tables are captured as
//! staged updates to be applied by the PT-update job and swapped in at
//! commit. The unbind walk mirrors it, finding whole subtrees the range
//! owns outright and staging zeroes for the shared slots above them. Zap
//! clears live leaf entries in place for eviction and notifier callbacks.

use std::sync::Arc;

use crate::error::{IovError, IovResult};
use crate::vm::pt::{
    BoBuffer, COMPACT_SHIFTS, MAX_HUGEPTE_LEVEL, MAX_LEVEL, NORMAL_SHIFTS, PDES, PtArena, PtId,
    PteFlags, pde_encode, pte_encode,
};
use crate::vm::vm::{Vm, VmFlags, VmInner, empty_pte};
use crate::vm::vma::{ResCursor, SvmRange, Vma, VmaPteSizes};
use crate::vm::walk::{EntryCtx, PtWalk, WalkAction, WalkState, walk_range, walk_shared};

const SZ_64K: u64 = 0x1_0000;

/// Most staged updates one operation can produce: two ends at every level
/// plus one more for the root.
pub const MAX_PT_ENTRIES: usize = 2 * (MAX_LEVEL as usize + 1) + 1;

/// One staged qword: a new PTE value for leaf writes, plus the child node
/// it installs (or, after commit preparation, the one it displaced).
#[derive(Debug, Clone, Copy, Default)]
pub struct PtEntryVal {
    pub pt: Option<PtId>,
    pub pte: u64,
}

/// A staged update to `qwords` consecutive entries of one shared table.
pub struct PtUpdateEntry {
    pub pt: PtId,
    pub bo: Arc<BoBuffer>,
    pub level: u32,
    pub ofs: usize,
    pub qwords: usize,
    pub pt_entries: Vec<PtEntryVal>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PtUpdate {
    parent: Option<PtId>,
    preexisting: bool,
    entry: Option<usize>,
}

/// Tracks, per level, which table updates are being collected.
#[derive(Default)]
pub struct WalkUpdates {
    pub entries: Vec<PtUpdateEntry>,
    updates: [PtUpdate; MAX_LEVEL as usize + 1],
}

impl WalkUpdates {
    /// Register `parent` at `level`. A table not seen before is a shared
    /// (pre-existing) one and gets a staged-update record; tables created
    /// by this walk were registered at creation and are written directly.
    fn ensure(&mut self, arena: &PtArena, parent: PtId, offset: usize, level: u32) -> IovResult<()> {
        let upd = &self.updates[level as usize];
        if upd.parent == Some(parent) {
            return Ok(());
        }
        if self.entries.len() == MAX_PT_ENTRIES {
            return Err(IovError::errno(libc::EINVAL));
        }
        self.entries.push(PtUpdateEntry {
            pt: parent,
            bo: arena.get(parent).bo.clone(),
            level,
            ofs: offset,
            qwords: 0,
            pt_entries: vec![PtEntryVal::default(); PDES],
        });
        self.updates[level as usize] = PtUpdate {
            parent: Some(parent),
            preexisting: true,
            entry: Some(self.entries.len() - 1),
        };
        Ok(())
    }

    fn register_fresh(&mut self, child: PtId, level: u32) {
        self.updates[level as usize] = PtUpdate {
            parent: Some(child),
            preexisting: false,
            entry: None,
        };
    }
}

/// Shift of one entry of a table at `level`, honoring the compact 64 KiB
/// layout of the table itself.
fn entry_shift(walk: &WalkState, level: u32, compact: bool) -> u32 {
    if level == 0 && compact {
        COMPACT_SHIFTS[0]
    } else {
        walk.shift(level)
    }
}

/// Entry offsets of a shared table that belong wholly to `[addr, end)`.
/// Partially covered entries are trimmed off; their presence means shared
/// tables continue at lower levels, reported via `partial`.
fn nonshared_offsets(
    walk: &WalkState,
    compact: bool,
    addr: u64,
    end: u64,
    level: u32,
) -> (Option<(usize, usize)>, bool) {
    let shift = entry_shift(walk, level, compact);
    let size = 1u64 << shift;
    let offset = ((addr >> shift) & (PDES as u64 - 1)) as usize;
    let end_offset = offset + (end.div_ceil(size) - (addr & !(size - 1)) / size) as usize;
    if level == 0 {
        return (Some((offset, end_offset)), false);
    }

    let mut offset = offset;
    let mut end_offset = end_offset;
    let mut partial = false;
    if addr & (size - 1) != 0 {
        partial = true;
        offset += 1;
    }
    if end & (size - 1) != 0 {
        partial = true;
        end_offset -= 1;
    }
    ((end_offset > offset).then_some((offset, end_offset)), partial)
}

// =========================================================================
// Bind staging
// =========================================================================

pub struct StageBind<'a> {
    vm_flags: VmFlags,
    default_vram_pte: u64,
    default_system_pte: u64,
    dma_offset: u64,
    needs_64k: bool,
    clear_pt: bool,
    is_null: bool,
    is_vram: bool,

    curs: ResCursor<'a>,
    va_curs_start: u64,

    pub wupd: WalkUpdates,
    pub pte_sizes: VmaPteSizes,

    l0_end_addr: u64,
    addr_64k: u64,
    found_64k: bool,
}

impl<'a> StageBind<'a> {
    fn hugepte_possible(&self, walk: &WalkState, ctx: &EntryCtx) -> bool {
        if ctx.level > MAX_HUGEPTE_LEVEL {
            return false;
        }
        // The virtual range must cover the whole entry...
        if !walk.covers(ctx.addr, ctx.next, ctx.level) {
            return false;
        }
        // ...and the DMA segment must cover the whole pte.
        if !self.is_null && !self.clear_pt {
            if ctx.next - self.va_curs_start > self.curs.remaining() {
                return false;
            }
            let size = ctx.next - ctx.addr;
            let dma = ctx.addr - self.va_curs_start + self.curs.dma_addr();
            if dma & (size - 1) != 0 {
                return false;
            }
        }
        true
    }

    /// Can `[addr, next)` be mapped entirely with 64 KiB-aligned,
    /// physically contiguous 64 KiB chunks?
    fn scan_64k(&self, addr: u64, next: u64) -> bool {
        if addr & (SZ_64K - 1) != 0 {
            return false;
        }
        if next > self.l0_end_addr {
            return false;
        }
        if self.is_null || self.clear_pt {
            return true;
        }

        let mut curs = self.curs.clone();
        curs.advance(addr - self.va_curs_start);
        let mut addr = addr;
        while addr < next {
            if curs.dma_addr() & (SZ_64K - 1) != 0 || curs.remaining() < SZ_64K {
                return false;
            }
            curs.advance(SZ_64K);
            addr += SZ_64K;
        }
        true
    }

    fn is_pte_ps64k(&mut self, addr: u64) -> bool {
        // Within the 64 KiB chunk we already proved out?
        if self.found_64k && addr - self.addr_64k < SZ_64K {
            return true;
        }
        self.found_64k = self.scan_64k(addr, addr + SZ_64K);
        self.addr_64k = addr;
        self.found_64k
    }

    fn insert_entry(
        &mut self,
        arena: &mut PtArena,
        ctx: &EntryCtx,
        child: Option<PtId>,
        pte: u64,
    ) -> IovResult<()> {
        self.wupd.ensure(arena, ctx.parent, ctx.offset, ctx.level)?;
        if let Some(child) = child {
            // Register the new table so later insertions below it are not
            // mistaken for shared-table updates.
            self.wupd.register_fresh(child, arena.get(child).level);
        }

        let upd = self.wupd.updates[ctx.level as usize];
        if !upd.preexisting {
            // Continue building the disconnected subtree in place.
            let parent = arena.get_mut(ctx.parent);
            if let Some(child) = child {
                parent.set_child(ctx.offset, false, Some(child));
                parent.set_child(ctx.offset, true, Some(child));
            }
            parent.bo.write(ctx.offset, pte);
            parent.num_live += 1;
        } else {
            let entry = &mut self.wupd.entries[upd.entry.unwrap()];
            let idx = ctx.offset - entry.ofs;
            entry.pt_entries[idx] = PtEntryVal { pt: child, pte };
            entry.qwords += 1;
        }
        Ok(())
    }
}

impl PtWalk for StageBind<'_> {
    fn entry(
        &mut self,
        arena: &mut PtArena,
        walk: &mut WalkState,
        ctx: &mut EntryCtx,
    ) -> IovResult<WalkAction> {
        if ctx.level == 0 || self.hugepte_possible(walk, ctx) {
            debug_assert_eq!(self.va_curs_start, ctx.addr);

            let pte = if self.clear_pt {
                0
            } else {
                let mut flags = PteFlags::empty();
                if ctx.level > 0 {
                    flags |= PteFlags::HUGEPAGE;
                }
                let mut pte = if self.is_null {
                    0
                } else {
                    let mut raw = pte_encode(self.curs.dma_addr() + self.dma_offset, flags);
                    raw |= if self.is_vram {
                        self.default_vram_pte
                    } else {
                        self.default_system_pte
                    };
                    raw
                };

                if ctx.level == 0 && !arena.get(ctx.parent).is_compact {
                    if self.is_pte_ps64k(ctx.addr) {
                        self.pte_sizes |= VmaPteSizes::SZ_64K;
                        pte |= PteFlags::PS64.bits();
                    } else if self.needs_64k && self.is_vram {
                        // Discrete VRAM leaves must be 64 KiB.
                        return Err(IovError::errno(libc::EINVAL));
                    }
                }
                pte
            };

            self.insert_entry(arena, ctx, None, pte)?;

            if !self.is_null && !self.clear_pt {
                self.curs.advance(ctx.next - ctx.addr);
            }
            self.va_curs_start = ctx.next;
            self.pte_sizes |= match ctx.level {
                0 => VmaPteSizes::SZ_4K,
                1 => VmaPteSizes::SZ_2M,
                _ => VmaPteSizes::SZ_1G,
            };
            return Ok(WalkAction::Continue);
        }

        // Descending. A new table or directory is needed when there is no
        // previous one, or the range covers it completely and it can be
        // replaced wholesale.
        if ctx.level == 1 {
            walk.shifts = NORMAL_SHIFTS;
            self.l0_end_addr = ctx.next;
        }

        let covers = walk.covers(ctx.addr, ctx.next, ctx.level);
        if covers || ctx.child.is_none() {
            let child = arena.alloc(ctx.level - 1);
            arena.get_mut(child).addr = ctx.addr & !((1u64 << walk.shift(ctx.level)) - 1);
            if !covers {
                let empty = empty_pte(self.vm_flags, ctx.level - 1);
                arena.populate_empty(child, empty);
            }

            let mut flags = PteFlags::empty();
            // Compact layout for L0 if the whole 2 MiB region maps as
            // 64 KiB pages; 64K and 4K PTEs cannot mix under one PDE.
            if self.vm_flags.contains(VmFlags::HAS_COMPACT)
                && ctx.level == 1
                && covers
                && self.scan_64k(ctx.addr, ctx.next)
            {
                walk.shifts = COMPACT_SHIFTS;
                self.pte_sizes |= VmaPteSizes::COMPACT;
                flags |= PteFlags::PDE_64K;
                arena.get_mut(child).is_compact = true;
            }

            let pte = pde_encode(arena.get(child).bo.gpu_addr, flags);
            self.insert_entry(arena, ctx, Some(child), pte)?;
            ctx.child = Some(child);
        }
        Ok(WalkAction::Subtree)
    }
}

/// Build the staged updates mapping `vma` (or the SVM `range` under it)
/// on one tile. With `clear_pt`, entries are staged as zeroes instead.
pub fn stage_bind(
    vm: &Vm,
    inner: &mut VmInner,
    tile_id: u8,
    vma: &Vma,
    range: Option<&SvmRange>,
    clear_pt: bool,
) -> IovResult<(Vec<PtUpdateEntry>, VmaPteSizes)> {
    let (start, end, segments) = match range {
        Some(range) => {
            // Bail out early if the SVM pages are already stale.
            let _guard = vm.svm_notifier.lock().unwrap();
            if !range.pages_valid.load(std::sync::atomic::Ordering::Acquire) {
                return Err(IovError::Again);
            }
            (range.start, range.end, range.segments.as_slice())
        }
        None => (vma.start, vma.end, vma.segments()),
    };

    let atomic = vma.atomic_hint;
    let mut stage = StageBind {
        vm_flags: vm.flags,
        default_vram_pte: if atomic {
            (PteFlags::DEVMEM | PteFlags::ATOMIC).bits()
        } else {
            PteFlags::DEVMEM.bits()
        },
        default_system_pte: if atomic && !vm.in_lr_mode() {
            PteFlags::ATOMIC.bits()
        } else {
            0
        },
        dma_offset: 0,
        needs_64k: vm.flags.contains(VmFlags::REQUIRES_64K),
        clear_pt,
        is_null: vma.is_null() && range.is_none(),
        is_vram: vma.is_vram(),
        curs: ResCursor::new(segments),
        va_curs_start: start,
        wupd: WalkUpdates::default(),
        pte_sizes: VmaPteSizes::empty(),
        l0_end_addr: 0,
        addr_64k: 0,
        found_64k: false,
    };

    let mut walk = WalkState {
        shifts: NORMAL_SHIFTS,
        max_level: MAX_LEVEL,
        staging: true,
    };
    let root = inner.pt_root[tile_id as usize];
    let root_level = inner.arena.get(root).level;
    if let Err(err) = walk_range(
        &mut inner.arena,
        &mut walk,
        &mut stage,
        root,
        root_level,
        start,
        end,
    ) {
        crate::vm::commit::cancel_bind(&mut inner.arena, &mut stage.wupd.entries);
        return Err(err);
    }

    Ok((stage.wupd.entries, stage.pte_sizes))
}

// =========================================================================
// Unbind staging
// =========================================================================

struct StageUnbind {
    /// Walk range widened to swallow shared pagetables that this range is
    /// the only user of.
    modified_start: u64,
    modified_end: u64,
    wupd: WalkUpdates,
}

impl StageUnbind {
    /// Is this range the only thing populating `child`? Then the whole
    /// subtree dies and higher levels may treat it as private.
    fn check_kill(
        &mut self,
        arena: &PtArena,
        walk: &WalkState,
        addr: u64,
        next: u64,
        level: u32,
        child: PtId,
    ) -> bool {
        let shift = entry_shift(walk, level, arena.get(child).is_compact);
        let size = 1u64 << shift;
        if addr & (size - 1) == 0
            && next & (size - 1) == 0
            && ((next - addr) >> shift) as u32 == arena.get(child).num_live
        {
            let parent_size = 1u64 << walk.shift(level + 1);
            if self.modified_start >= addr {
                self.modified_start = addr & !(parent_size - 1);
            }
            if self.modified_end <= next {
                self.modified_end = next.next_multiple_of(parent_size);
            }
            true
        } else {
            false
        }
    }
}

impl PtWalk for StageUnbind {
    fn entry(
        &mut self,
        arena: &mut PtArena,
        walk: &mut WalkState,
        ctx: &mut EntryCtx,
    ) -> IovResult<WalkAction> {
        let child = ctx.child.expect("shared walk entry without child");
        if self.check_kill(arena, walk, ctx.addr, ctx.next, ctx.level - 1, child) {
            Ok(WalkAction::Continue)
        } else {
            Ok(WalkAction::Subtree)
        }
    }

    fn post_descend(
        &mut self,
        arena: &mut PtArena,
        walk: &mut WalkState,
        ctx: &mut EntryCtx,
    ) -> IovResult<()> {
        let child = ctx.child.expect("shared walk exit without child");
        let level = ctx.level - 1;
        let size = 1u64 << entry_shift(walk, level, arena.get(child).is_compact);

        let mut addr = ctx.addr;
        let mut next = ctx.next;
        if addr & (size - 1) != 0 {
            addr = self.modified_start;
        }
        if next & (size - 1) != 0 {
            next = self.modified_end;
        }

        // The root is visited as its own child; never kill it.
        if child != ctx.parent && self.check_kill(arena, walk, addr, next, level, child) {
            return Ok(());
        }

        let compact = arena.get(child).is_compact;
        let (Some((offset, end_offset)), _) = nonshared_offsets(walk, compact, addr, next, level)
        else {
            return Ok(());
        };

        self.wupd.ensure(arena, child, offset, level)?;
        let idx = self.wupd.updates[level as usize].entry.unwrap();
        self.wupd.entries[idx].qwords = end_offset - offset;
        Ok(())
    }
}

/// Build the staged updates removing `[start, end)` from the tree.
pub fn stage_unbind(
    inner: &mut VmInner,
    tile_id: u8,
    start: u64,
    end: u64,
) -> IovResult<Vec<PtUpdateEntry>> {
    let mut stage = StageUnbind {
        modified_start: start,
        modified_end: end,
        wupd: WalkUpdates::default(),
    };
    let mut walk = WalkState {
        shifts: NORMAL_SHIFTS,
        max_level: MAX_LEVEL,
        staging: true,
    };
    let root = inner.pt_root[tile_id as usize];
    let root_level = inner.arena.get(root).level;
    walk_shared(
        &mut inner.arena,
        &mut walk,
        &mut stage,
        root,
        root_level,
        start,
        end,
    )?;
    Ok(stage.wupd.entries)
}

// =========================================================================
// Zap
// =========================================================================

struct ZapPtes {
    needs_invalidate: bool,
}

impl PtWalk for ZapPtes {
    fn entry(
        &mut self,
        arena: &mut PtArena,
        walk: &mut WalkState,
        ctx: &mut EntryCtx,
    ) -> IovResult<WalkAction> {
        let child = ctx.child.expect("shared walk entry without child");
        let level = ctx.level - 1;
        let compact = arena.get(child).is_compact;
        let (covered, partial) = nonshared_offsets(walk, compact, ctx.addr, ctx.next, level);
        if let Some((offset, end_offset)) = covered {
            arena
                .get(child)
                .bo
                .clear_range(offset, end_offset - offset);
            self.needs_invalidate = true;
        }
        Ok(if partial && level > 0 {
            WalkAction::Subtree
        } else {
            WalkAction::Continue
        })
    }
}

/// Zero the live GPU PTEs of `[start, end)` in place, without touching
/// tree connectivity. Returns whether anything changed and the caller
/// therefore owes a TLB invalidation.
pub fn zap_ptes_range(inner: &mut VmInner, tile_id: u8, start: u64, end: u64) -> bool {
    let mut zap = ZapPtes {
        needs_invalidate: false,
    };
    let mut walk = WalkState {
        shifts: NORMAL_SHIFTS,
        max_level: MAX_LEVEL,
        staging: false,
    };
    let root = inner.pt_root[tile_id as usize];
    let root_level = inner.arena.get(root).level;
    let _ = walk_shared(
        &mut inner.arena,
        &mut walk,
        &mut zap,
        root,
        root_level,
        start,
        end,
    );
    zap.needs_invalidate
}

/// Zap a VMA's mapping on one tile. Skips tiles where the binding is
/// absent or already invalidated.
pub fn zap_vma(inner: &mut VmInner, tile_id: u8, vma: &Vma) -> bool {
    let present = vma.tile_present.load(std::sync::atomic::Ordering::Acquire);
    let invalidated = vma.tile_invalidated.load(std::sync::atomic::Ordering::Acquire);
    if present & !invalidated & (1 << tile_id) == 0 {
        return false;
    }
    zap_ptes_range(inner, tile_id, vma.start, vma.end)
}
