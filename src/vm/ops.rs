//! VM-operation orchestration.
//!
//! A batch of VMA operations is prepared per tile (staging page-table
//! updates and recording which locks commit will need), then run: the
//! PT-update job is submitted, the staged updates are committed (the point
//! of no return), a range fence serializes overlapping updates, the TLB
//! invalidation is chained onto the job fence and the composed fence is
//! attached to every reservation touched.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, warn};

use crate::error::{IovError, IovResult};
use crate::vm::commit;
use crate::vm::fence::{Fence, TlbInvalidator, invalidation_fence};
use crate::vm::migrate::{MigrateJob, Migrator, PtWrite};
use crate::vm::stage::{self, PtUpdateEntry};
use crate::vm::vm::{ResvUsage, Vm, VmInner, empty_pte};
use crate::vm::vma::{SvmRange, Vma};

#[derive(Clone)]
pub enum VmaOp {
    Map {
        vma: Arc<Vma>,
        immediate: bool,
        invalidate_on_bind: bool,
    },
    Remap {
        unmap: Arc<Vma>,
        prev: Option<Arc<Vma>>,
        next: Option<Arc<Vma>>,
    },
    Unmap {
        vma: Arc<Vma>,
    },
    Prefetch {
        vma: Arc<Vma>,
        ranges: Vec<Arc<SvmRange>>,
    },
    MapRange {
        vma: Arc<Vma>,
        range: Arc<SvmRange>,
    },
    UnmapRange {
        range: Arc<SvmRange>,
    },
}

enum OpTarget {
    Vma { vma: Arc<Vma>, seq: u64 },
    Range(Arc<SvmRange>),
    None,
}

struct PtOp {
    target: OpTarget,
    bind: bool,
    rebind: bool,
    entries: Vec<PtUpdateEntry>,
}

/// Per-tile staging state of one batch.
#[derive(Default)]
pub struct PtUpdateOps {
    ops: Vec<PtOp>,
    start: u64,
    last: u64,
    needs_userptr_lock: bool,
    needs_svm_lock: bool,
    needs_invalidation: bool,
    wait_vm_bookkeep: bool,
    wait_vm_kernel: bool,
}

impl PtUpdateOps {
    fn new() -> Self {
        Self {
            start: u64::MAX,
            last: 0,
            ..Default::default()
        }
    }

    /// Widen the touched interval to the page-aligned union of all levels
    /// this op modified.
    fn extend_interval(&mut self, entries: &[PtUpdateEntry], start: u64, end: u64) {
        let level = entries.iter().map(|e| e.level).max().unwrap_or(0);
        let size = 1u64 << crate::vm::pt::NORMAL_SHIFTS[level as usize];
        let start = start & !(size - 1);
        let last = end.next_multiple_of(size) - 1;
        self.start = self.start.min(start);
        self.last = self.last.max(last);
    }
}

/// The batch: the op list plus per-tile staging.
pub struct VmaOps {
    pub list: Vec<VmaOp>,
    pub syncs: Vec<Fence>,
    /// Set when driven from the rebind worker itself, so commit does not
    /// kick the worker again.
    pub in_rebind_worker: bool,
    pt_update_ops: Vec<PtUpdateOps>,
}

impl VmaOps {
    #[must_use]
    pub fn new(num_tiles: usize, list: Vec<VmaOp>) -> Self {
        Self {
            list,
            syncs: Vec::new(),
            in_rebind_worker: false,
            pt_update_ops: (0..num_tiles).map(|_| PtUpdateOps::new()).collect(),
        }
    }
}

/// Everything `run` needs to talk to one tile's hardware.
pub struct TileEnv {
    pub tile_id: u8,
    pub migrate: Arc<Migrator>,
    pub tlb: Arc<dyn TlbInvalidator>,
    /// Media GT invalidator on platforms that carry one.
    pub media_tlb: Option<Arc<dyn TlbInvalidator>>,
}

// =========================================================================
// Prepare
// =========================================================================

fn bind_op_prepare(
    vm: &Vm,
    inner: &mut VmInner,
    tile_id: u8,
    pt_ops: &mut PtUpdateOps,
    vma: &Arc<Vma>,
    invalidate_on_bind: bool,
) -> IovResult<()> {
    debug_assert!(!vma.is_cpu_addr_mirror());
    debug!(
        "preparing bind, with range [{:#x}...{:#x})",
        vma.start, vma.end
    );

    let bit = 1u8 << tile_id;
    let rebind = vma.tile_present.load(Ordering::Acquire) & bit != 0;

    let (mut entries, pte_sizes) =
        match stage::stage_bind(vm, inner, tile_id, vma, None, invalidate_on_bind) {
            Ok(staged) => staged,
            Err(err) => return Err(err),
        };
    debug_assert!(!entries.is_empty());

    pt_ops.extend_interval(&entries, vma.start, vma.end);
    pt_ops.needs_userptr_lock |= vma.is_userptr();

    // A rebind outside LR mode must flush PTEs cached before the rebind;
    // a fresh bind on a scratch-enabled LR VM must flush possibly cached
    // scratch entries.
    if !rebind && vm.has_scratch() && vm.in_lr_mode() {
        pt_ops.needs_invalidation = true;
    } else if rebind && !vm.in_lr_mode() {
        pt_ops.needs_invalidation = true;
        vm.tlb_flush_seqno.fetch_add(1, Ordering::Relaxed);
    }

    vma.tile_staged.fetch_or(bit, Ordering::Release);
    *vma.pte_sizes.lock().unwrap() |= pte_sizes;

    commit::commit_prepare_bind(&mut inner.arena, &mut entries, rebind);
    pt_ops.ops.push(PtOp {
        target: OpTarget::Vma {
            vma: vma.clone(),
            seq: vma.notifier_seq.load(Ordering::Acquire),
        },
        bind: true,
        rebind,
        entries,
    });
    Ok(())
}

fn bind_range_prepare(
    vm: &Vm,
    inner: &mut VmInner,
    tile_id: u8,
    pt_ops: &mut PtUpdateOps,
    vma: &Arc<Vma>,
    range: &Arc<SvmRange>,
) -> IovResult<()> {
    debug_assert!(vma.is_cpu_addr_mirror());
    debug!(
        "preparing range bind, with range [{:#x}...{:#x})",
        range.start, range.end
    );

    let bit = 1u8 << tile_id;
    let rebind = range.tile_present.load(Ordering::Acquire) & bit != 0;

    let (mut entries, _) = stage::stage_bind(vm, inner, tile_id, vma, Some(range), false)?;
    pt_ops.extend_interval(&entries, range.start, range.end);
    pt_ops.needs_svm_lock = true;

    commit::commit_prepare_bind(&mut inner.arena, &mut entries, rebind);
    pt_ops.ops.push(PtOp {
        target: OpTarget::Range(range.clone()),
        bind: true,
        rebind,
        entries,
    });
    Ok(())
}

fn unbind_op_prepare(
    inner: &mut VmInner,
    tile_id: u8,
    pt_ops: &mut PtUpdateOps,
    vma: &Arc<Vma>,
) -> IovResult<()> {
    let bit = 1u8 << tile_id;
    let staged_or_present =
        (vma.tile_present.load(Ordering::Acquire) | vma.tile_staged.load(Ordering::Acquire)) & bit;
    if staged_or_present == 0 {
        return Ok(());
    }
    debug_assert!(!vma.is_cpu_addr_mirror());
    debug!(
        "preparing unbind, with range [{:#x}...{:#x})",
        vma.start, vma.end
    );

    let mut entries = stage::stage_unbind(inner, tile_id, vma.start, vma.end)?;
    pt_ops.extend_interval(&entries, vma.start, vma.end);
    pt_ops.needs_userptr_lock |= vma.is_userptr();
    // Removing PTEs always invalidates.
    pt_ops.needs_invalidation = true;

    commit::commit_prepare_unbind(&mut inner.arena, &mut entries);
    pt_ops.ops.push(PtOp {
        target: OpTarget::Vma {
            vma: vma.clone(),
            seq: vma.notifier_seq.load(Ordering::Acquire),
        },
        bind: false,
        rebind: false,
        entries,
    });
    Ok(())
}

fn unbind_range_prepare(
    inner: &mut VmInner,
    tile_id: u8,
    pt_ops: &mut PtUpdateOps,
    range: &Arc<SvmRange>,
) -> IovResult<()> {
    let bit = 1u8 << tile_id;
    if range.tile_present.load(Ordering::Acquire) & bit == 0 {
        return Ok(());
    }
    debug!(
        "preparing range unbind, with range [{:#x}...{:#x})",
        range.start, range.end
    );

    let mut entries = stage::stage_unbind(inner, tile_id, range.start, range.end)?;
    pt_ops.extend_interval(&entries, range.start, range.end);
    pt_ops.needs_svm_lock = true;
    pt_ops.needs_invalidation = true;

    commit::commit_prepare_unbind(&mut inner.arena, &mut entries);
    pt_ops.ops.push(PtOp {
        target: OpTarget::None,
        bind: false,
        rebind: false,
        entries,
    });
    Ok(())
}

fn op_prepare(
    vm: &Vm,
    inner: &mut VmInner,
    tile_id: u8,
    pt_ops: &mut PtUpdateOps,
    op: &VmaOp,
) -> IovResult<()> {
    match op {
        VmaOp::Map {
            vma,
            immediate,
            invalidate_on_bind,
        } => {
            if (!immediate && vm.in_fault_mode() && !invalidate_on_bind)
                || vma.is_cpu_addr_mirror()
            {
                return Ok(());
            }
            bind_op_prepare(vm, inner, tile_id, pt_ops, vma, *invalidate_on_bind)?;
            pt_ops.wait_vm_kernel = true;
            Ok(())
        }
        VmaOp::Remap { unmap, prev, next } => {
            if unmap.is_cpu_addr_mirror() {
                return Ok(());
            }
            unbind_op_prepare(inner, tile_id, pt_ops, unmap)?;
            if let Some(prev) = prev {
                bind_op_prepare(vm, inner, tile_id, pt_ops, prev, false)?;
                pt_ops.wait_vm_bookkeep = true;
            }
            if let Some(next) = next {
                bind_op_prepare(vm, inner, tile_id, pt_ops, next, false)?;
                pt_ops.wait_vm_bookkeep = true;
            }
            Ok(())
        }
        VmaOp::Unmap { vma } => {
            if vma.is_cpu_addr_mirror() {
                return Ok(());
            }
            unbind_op_prepare(inner, tile_id, pt_ops, vma)
        }
        VmaOp::Prefetch { vma, ranges } => {
            if vma.is_cpu_addr_mirror() {
                for range in ranges {
                    bind_range_prepare(vm, inner, tile_id, pt_ops, vma, range)?;
                }
            } else {
                bind_op_prepare(vm, inner, tile_id, pt_ops, vma, false)?;
                pt_ops.wait_vm_kernel = true;
            }
            Ok(())
        }
        VmaOp::MapRange { vma, range } => bind_range_prepare(vm, inner, tile_id, pt_ops, vma, range),
        VmaOp::UnmapRange { range } => unbind_range_prepare(inner, tile_id, pt_ops, range),
    }
}

/// Stage every op of the batch for one tile.
pub fn prepare(vm: &Vm, inner: &mut VmInner, tile_id: u8, vops: &mut VmaOps) -> IovResult<()> {
    let mut pt_ops = PtUpdateOps::new();
    for op in &vops.list {
        if let Err(err) = op_prepare(vm, inner, tile_id, &mut pt_ops, op) {
            unwind(inner, &mut pt_ops);
            vops.pt_update_ops[tile_id as usize] = PtUpdateOps::new();
            return Err(err);
        }
    }
    vops.pt_update_ops[tile_id as usize] = pt_ops;
    Ok(())
}

fn unwind(inner: &mut VmInner, pt_ops: &mut PtUpdateOps) {
    for op in pt_ops.ops.iter_mut().rev() {
        if op.bind {
            commit::abort_bind(&mut inner.arena, &mut op.entries, op.rebind);
        } else {
            commit::abort_unbind(&mut inner.arena, &mut op.entries);
        }
    }
    pt_ops.ops.clear();
}

/// Abort a prepared batch on one tile, undoing all staging.
pub fn abort(inner: &mut VmInner, tile_id: u8, vops: &mut VmaOps) {
    unwind(inner, &mut vops.pt_update_ops[tile_id as usize]);
}

// =========================================================================
// Run
// =========================================================================

fn check_userptr_races(vm: &Vm, pt_ops: &PtUpdateOps) -> IovResult<()> {
    for op in &pt_ops.ops {
        let OpTarget::Vma { vma, seq } = &op.target else {
            continue;
        };
        if !vma.is_userptr() || !op.bind {
            continue;
        }
        if vma.notifier_seq.load(Ordering::Acquire) != *seq {
            if vm.in_fault_mode() {
                return Err(IovError::Again);
            }
            // Outside fault mode the rebind worker repairs the mapping.
            warn!(
                "userptr [{:#x}...{:#x}) invalidated while binding",
                vma.start, vma.end
            );
            vm.queue_rebind_worker();
        }
    }
    Ok(())
}

fn check_svm_races(vops: &VmaOps) -> IovResult<()> {
    for op in &vops.list {
        match op {
            VmaOp::MapRange { range, .. } => {
                if !range.pages_valid.load(Ordering::Acquire) {
                    return Err(IovError::Again);
                }
            }
            VmaOp::Prefetch { vma, ranges } if vma.is_cpu_addr_mirror() => {
                for range in ranges {
                    if !range.pages_valid.load(Ordering::Acquire) {
                        return Err(IovError::errno(libc::ENODATA));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn build_job(vm: &Vm, pt_ops: &PtUpdateOps) -> MigrateJob {
    let mut job = MigrateJob::default();
    for op in &pt_ops.ops {
        for entry in &op.entries {
            let values = if op.bind {
                entry.pt_entries[..entry.qwords]
                    .iter()
                    .map(|e| e.pte)
                    .collect()
            } else {
                vec![empty_pte(vm.flags, entry.level); entry.qwords]
            };
            job.writes.push(PtWrite {
                bo: entry.bo.clone(),
                ofs: entry.ofs,
                values,
            });
        }
    }
    job
}

fn bind_op_commit(
    vm: &Vm,
    tile_id: u8,
    pt_ops: &PtUpdateOps,
    vops: &VmaOps,
    vma: &Arc<Vma>,
    fence: &Fence,
    invalidate_on_bind: bool,
) {
    let usage = if pt_ops.wait_vm_bookkeep {
        ResvUsage::Kernel
    } else {
        ResvUsage::Bookkeep
    };
    vma.resv.add_fence(usage, fence.clone());

    let bit = 1u8 << tile_id;
    vma.tile_present.fetch_or(bit, Ordering::Release);
    if invalidate_on_bind {
        vma.tile_invalidated.fetch_or(bit, Ordering::Release);
    } else {
        vma.tile_invalidated.fetch_and(!bit, Ordering::Release);
    }
    vma.tile_staged.fetch_and(!bit, Ordering::Release);
    if vma.is_userptr() {
        vma.initial_bind.store(true, Ordering::Release);
    }

    // Kick the rebind worker if this bind produces preempt fences and we
    // are not already running inside it.
    if pt_ops.wait_vm_bookkeep && vm.in_preempt_fence_mode() && !vops.in_rebind_worker {
        vm.queue_rebind_worker();
    }
}

fn unbind_op_commit(
    pt_ops: &PtUpdateOps,
    tile_id: u8,
    vma: &Arc<Vma>,
    fence: &Fence,
) {
    let usage = if pt_ops.wait_vm_bookkeep {
        ResvUsage::Kernel
    } else {
        ResvUsage::Bookkeep
    };
    vma.resv.add_fence(usage, fence.clone());

    let bit = 1u8 << tile_id;
    vma.tile_present.fetch_and(!bit, Ordering::Release);
    if vma.tile_present.load(Ordering::Acquire) == 0 {
        vma.on_rebind_list.store(false, Ordering::Release);
    }
}

fn range_present_and_invalidated(range: &SvmRange, tile_id: u8) {
    let bit = 1u8 << tile_id;
    range.tile_present.fetch_or(bit, Ordering::Release);
    range.tile_invalidated.fetch_and(!bit, Ordering::Release);
}

fn op_commit(
    vm: &Vm,
    tile_id: u8,
    pt_ops: &PtUpdateOps,
    vops: &VmaOps,
    op: &VmaOp,
    fence: &Fence,
) {
    match op {
        VmaOp::Map {
            vma,
            immediate,
            invalidate_on_bind,
        } => {
            if (!immediate && vm.in_fault_mode()) || vma.is_cpu_addr_mirror() {
                return;
            }
            bind_op_commit(vm, tile_id, pt_ops, vops, vma, fence, *invalidate_on_bind);
        }
        VmaOp::Remap { unmap, prev, next } => {
            if unmap.is_cpu_addr_mirror() {
                return;
            }
            unbind_op_commit(pt_ops, tile_id, unmap, fence);
            if let Some(prev) = prev {
                bind_op_commit(vm, tile_id, pt_ops, vops, prev, fence, false);
            }
            if let Some(next) = next {
                bind_op_commit(vm, tile_id, pt_ops, vops, next, fence, false);
            }
        }
        VmaOp::Unmap { vma } => {
            if !vma.is_cpu_addr_mirror() {
                unbind_op_commit(pt_ops, tile_id, vma, fence);
            }
        }
        VmaOp::Prefetch { vma, ranges } => {
            if vma.is_cpu_addr_mirror() {
                for range in ranges {
                    range_present_and_invalidated(range, tile_id);
                }
            } else {
                bind_op_commit(vm, tile_id, pt_ops, vops, vma, fence, false);
            }
        }
        VmaOp::MapRange { range, .. } => range_present_and_invalidated(range, tile_id),
        VmaOp::UnmapRange { range } => {
            range
                .tile_present
                .fetch_and(!(1u8 << tile_id), Ordering::Release);
        }
    }
}

/// Run a prepared batch on one tile. On success the returned fence signals
/// once the new mapping is observable (PT job plus TLB invalidation).
pub fn run(
    vm: &Vm,
    inner: &mut VmInner,
    env: &TileEnv,
    vops: &mut VmaOps,
) -> IovResult<Fence> {
    let tile_id = env.tile_id;
    let mut pt_ops = std::mem::take(&mut vops.pt_update_ops[tile_id as usize]);
    let restore = |vops: &mut VmaOps, pt_ops: PtUpdateOps| {
        vops.pt_update_ops[tile_id as usize] = pt_ops;
    };

    if pt_ops.ops.is_empty() {
        restore(vops, pt_ops);
        return Ok(Fence::signaled_stub());
    }
    if vm.is_killed() {
        restore(vops, pt_ops);
        return Err(IovError::VmKilled);
    }

    // Commit-side race checks, under the notifier locks which are then
    // held until the side effects below are done.
    let _userptr_guard = if pt_ops.needs_userptr_lock {
        let guard = vm.userptr_notifier.read().unwrap();
        if let Err(err) = check_userptr_races(vm, &pt_ops) {
            restore(vops, pt_ops);
            return Err(err);
        }
        Some(guard)
    } else {
        None
    };
    let _svm_guard = if pt_ops.needs_svm_lock {
        let guard = vm.svm_notifier.lock().unwrap();
        if let Err(err) = check_svm_races(vops) {
            restore(vops, pt_ops);
            return Err(err);
        }
        Some(guard)
    } else {
        None
    };

    // Dependencies: external syncs, the VM reservation, earlier PT jobs
    // overlapping our range, and kernel fences of the bos we touch.
    let mut deps = vops.syncs.clone();
    if pt_ops.wait_vm_bookkeep {
        deps.extend(vm.resv.unsignaled(ResvUsage::Bookkeep));
    } else if pt_ops.wait_vm_kernel {
        deps.extend(vm.resv.unsignaled(ResvUsage::Kernel));
    }
    deps.extend(vm.rftree[tile_id as usize].overlapping(pt_ops.start, pt_ops.last));
    for op in &pt_ops.ops {
        if let OpTarget::Vma { vma, .. } = &op.target {
            deps.extend(vma.resv.unsignaled(ResvUsage::Kernel));
        }
    }

    let mut job = build_job(vm, &pt_ops);
    job.deps = deps;
    let job_fence = env.migrate.submit(job);

    // Point of no return: fold the staging into the live tree.
    for op in &mut pt_ops.ops {
        commit::commit(&mut inner.arena, &mut op.entries);
    }

    vm.rftree[tile_id as usize].insert(pt_ops.start, pt_ops.last, job_fence.clone());

    // TLB invalidation must complete before anything depending on this
    // mapping is allowed to observe it.
    let fence = if pt_ops.needs_invalidation {
        let primary = invalidation_fence(
            env.tlb.clone(),
            &job_fence,
            pt_ops.start,
            pt_ops.last,
            vm.asid,
        );
        match &env.media_tlb {
            Some(media) => {
                let media = invalidation_fence(
                    media.clone(),
                    &job_fence,
                    pt_ops.start,
                    pt_ops.last,
                    vm.asid,
                );
                Fence::array(vec![primary, media])
            }
            None => primary,
        }
    } else {
        job_fence
    };

    let usage = if pt_ops.wait_vm_bookkeep {
        ResvUsage::Kernel
    } else {
        ResvUsage::Bookkeep
    };
    vm.resv.add_fence(usage, fence.clone());

    for op in &vops.list {
        op_commit(vm, tile_id, &pt_ops, vops, op, &fence);
    }

    restore(vops, pt_ops);
    Ok(fence)
}

/// Prepare and run a batch across every tile under one hold of the VM
/// lock, unwinding all staging if anything fails before its commit.
pub fn execute(vm: &Vm, envs: &[TileEnv], vops: &mut VmaOps) -> IovResult<Vec<Fence>> {
    let mut inner = vm.lock_inner();

    for env in envs {
        if let Err(err) = prepare(vm, &mut inner, env.tile_id, vops) {
            for done in envs {
                if done.tile_id == env.tile_id {
                    break;
                }
                abort(&mut inner, done.tile_id, vops);
            }
            return Err(err);
        }
    }

    let mut fences = Vec::with_capacity(envs.len());
    for (i, env) in envs.iter().enumerate() {
        match run(vm, &mut inner, env, vops) {
            Ok(fence) => fences.push(fence),
            Err(err) => {
                // This tile did not reach its point of no return; undo it
                // and the not-yet-run tiles. Earlier tiles are already
                // committed and stay.
                for env in &envs[i..] {
                    abort(&mut inner, env.tile_id, vops);
                }
                return Err(err);
            }
        }
    }
    Ok(fences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::fence::testing::RecordingTlb;
    use crate::vm::pt::{PteFlags, pte_addr};
    use crate::vm::vm::VmFlags;
    use crate::vm::vma::{Backing, DmaSegment};
    use std::time::Duration;

    const SZ_2M: u64 = 0x20_0000;

    fn env(migrate: &Arc<Migrator>, tlb: &Arc<RecordingTlb>) -> TileEnv {
        TileEnv {
            tile_id: 0,
            migrate: migrate.clone(),
            tlb: tlb.clone(),
            media_tlb: None,
        }
    }

    fn system_vma(start: u64, end: u64, dma_base: u64) -> Arc<Vma> {
        Arc::new(Vma::new(
            start,
            end,
            Backing::Bo {
                segments: vec![DmaSegment {
                    dma_addr: dma_base,
                    len: end - start,
                }],
                vram: false,
            },
        ))
    }

    /// Follow the live (non-staging) tree and read the PTE covering `va`.
    fn lookup_pte(vm: &Vm, tile_id: u8, va: u64) -> Option<u64> {
        let inner = vm.lock_inner();
        let mut id = inner.pt_root[tile_id as usize];
        loop {
            let node = inner.arena.get(id);
            let shifts = if node.is_compact {
                crate::vm::pt::COMPACT_SHIFTS
            } else {
                crate::vm::pt::NORMAL_SHIFTS
            };
            let offset = ((va >> shifts[node.level as usize]) & 0x1ff) as usize;
            let pte = node.bo.read(offset);
            if node.level == 0 {
                return Some(pte);
            }
            if PteFlags::from_bits_truncate(pte).contains(PteFlags::HUGEPAGE) {
                return Some(pte);
            }
            id = node.child(offset, false)?;
        }
    }

    fn map_and_wait(
        vm: &Vm,
        env_: &TileEnv,
        vma: &Arc<Vma>,
    ) -> IovResult<Fence> {
        let mut vops = VmaOps::new(
            vm.num_tiles(),
            vec![VmaOp::Map {
                vma: vma.clone(),
                immediate: true,
                invalidate_on_bind: false,
            }],
        );
        let fences = execute(vm, std::slice::from_ref(env_), &mut vops)?;
        for fence in &fences {
            fence.wait_timeout(Duration::from_secs(5)).unwrap();
        }
        Ok(fences.into_iter().next().unwrap())
    }

    #[test]
    fn map_unaligned_2m_uses_small_leaves() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        // [0x1000, 0x201000): 2 MiB of system memory, start not 2 MiB
        // aligned, so a huge PTE is impossible.
        let vma = system_vma(0x1000, 0x1000 + SZ_2M, 0x10_0000_0000);
        map_and_wait(&vm, &env_, &vma).unwrap();

        let first = lookup_pte(&vm, 0, 0x1000).unwrap();
        assert!(PteFlags::from_bits_truncate(first).contains(PteFlags::PRESENT));
        assert!(!PteFlags::from_bits_truncate(first).contains(PteFlags::HUGEPAGE));
        assert_eq!(pte_addr(first), 0x10_0000_0000);

        let last = lookup_pte(&vm, 0, 0x200_000).unwrap();
        assert_eq!(pte_addr(last), 0x10_0000_0000 + SZ_2M - 0x1000);
        assert_eq!(vma.tile_present.load(Ordering::Acquire), 1);
    }

    #[test]
    fn map_aligned_2m_uses_huge_pte() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        // Fully aligned and physically contiguous: one level-1 leaf.
        let vma = system_vma(SZ_2M, 2 * SZ_2M, 0x10_0000_0000);
        map_and_wait(&vm, &env_, &vma).unwrap();

        let pte = lookup_pte(&vm, 0, SZ_2M).unwrap();
        assert!(PteFlags::from_bits_truncate(pte).contains(PteFlags::HUGEPAGE));
        assert!(
            vma.pte_sizes
                .lock()
                .unwrap()
                .contains(crate::vm::vma::VmaPteSizes::SZ_2M)
        );
    }

    #[test]
    fn unbind_whole_l0_stages_single_pde_zero() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        // Two full level-0 tables; removing one must collapse to a single
        // staged update zeroing its PDE in the level-1 table.
        let vma = system_vma(0, 2 * SZ_2M, 0x20_0000_0000);
        map_and_wait(&vm, &env_, &vma).unwrap();

        let mut inner = vm.lock_inner();
        let live_before = inner.arena.live_nodes();
        let entries = stage::stage_unbind(&mut inner, 0, SZ_2M, 2 * SZ_2M).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, 1);
        assert_eq!(entries[0].qwords, 1);

        let mut entries = entries;
        commit::commit_prepare_unbind(&mut inner.arena, &mut entries);
        commit::commit(&mut inner.arena, &mut entries);
        // The whole level-0 node went away.
        assert_eq!(inner.arena.live_nodes(), live_before - 1);
    }

    #[test]
    fn compact_layout_for_fully_64k_region() {
        let vm = Vm::new(1, VmFlags::HAS_COMPACT, 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        // A whole 2 MiB of 64 KiB-aligned (but not 2 MiB-aligned, so no
        // huge PTE) contiguous memory: the level-0 table is replaced by a
        // compact one and the PDE carries the hint.
        let vma = system_vma(SZ_2M, 2 * SZ_2M, 0x10_0001_0000);
        map_and_wait(&vm, &env_, &vma).unwrap();
        // A sibling mapping keeps the level-1 table alive across the
        // unbind below.
        let sibling = system_vma(2 * SZ_2M, 3 * SZ_2M, 0x20_0000_0000);
        map_and_wait(&vm, &env_, &sibling).unwrap();
        assert!(
            vma.pte_sizes
                .lock()
                .unwrap()
                .contains(crate::vm::vma::VmaPteSizes::COMPACT)
        );

        {
            let inner = vm.lock_inner();
            let mut id = inner.pt_root[0];
            // Descend to the level-1 table holding the compact PDE.
            while inner.arena.get(id).level > 1 {
                let node = inner.arena.get(id);
                let offset = ((SZ_2M >> crate::vm::pt::NORMAL_SHIFTS[node.level as usize])
                    & 0x1ff) as usize;
                id = node.child(offset, false).unwrap();
            }
            let l1 = inner.arena.get(id);
            let pde = l1.bo.read(1); // slot for [2M, 4M)
            assert!(PteFlags::from_bits_truncate(pde).contains(PteFlags::PDE_64K));
            let l0 = inner.arena.get(l1.child(1, false).unwrap());
            assert!(l0.is_compact);
            // 32 PTEs of 64 KiB each cover the 2 MiB region.
            assert_eq!(l0.num_live, 32);
        }

        // Unbinding the whole region takes the kill path: one staged
        // update zeroing the PDE.
        let mut inner = vm.lock_inner();
        let entries = stage::stage_unbind(&mut inner, 0, SZ_2M, 2 * SZ_2M).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].qwords, 1);
        assert_eq!(entries[0].level, 1);
    }

    #[test]
    fn unmap_invalidates_tlb_before_fence() {
        let vm = Vm::new(1, VmFlags::empty(), 9);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let vma = system_vma(SZ_2M, 2 * SZ_2M, 0x30_0000_0000);
        map_and_wait(&vm, &env_, &vma).unwrap();
        assert!(tlb.flushes.lock().unwrap().is_empty());

        let mut vops = VmaOps::new(1, vec![VmaOp::Unmap { vma: vma.clone() }]);
        let fences = execute(&vm, std::slice::from_ref(&env_), &mut vops).unwrap();
        fences[0].wait_timeout(Duration::from_secs(5)).unwrap();

        let flushes = tlb.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        let (start, last, asid) = flushes[0];
        assert!(start <= SZ_2M && last >= 2 * SZ_2M - 1);
        assert_eq!(asid, 9);
        drop(flushes);
        assert_eq!(vma.tile_present.load(Ordering::Acquire), 0);
    }

    #[test]
    fn zap_and_rebind_round_trip() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let vma = system_vma(SZ_2M, SZ_2M + 0x10000, 0x40_0000_0000);
        map_and_wait(&vm, &env_, &vma).unwrap();
        let before = lookup_pte(&vm, 0, SZ_2M).unwrap();
        assert_ne!(before, 0);

        {
            let mut inner = vm.lock_inner();
            assert!(stage::zap_vma(&mut inner, 0, &vma));
        }
        assert_eq!(lookup_pte(&vm, 0, SZ_2M).unwrap(), 0);

        // Rebind restores the same translation.
        map_and_wait(&vm, &env_, &vma).unwrap();
        assert_eq!(lookup_pte(&vm, 0, SZ_2M).unwrap(), before);

        // Zapping a range with no live PTEs reports nothing to flush.
        let mut inner = vm.lock_inner();
        assert!(!stage::zap_ptes_range(&mut inner, 0, 0x40_0000, 0x50_0000));
    }

    #[test]
    fn rebind_outside_lr_mode_invalidates() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let vma = system_vma(SZ_2M, 2 * SZ_2M, 0x50_0000_0000);
        map_and_wait(&vm, &env_, &vma).unwrap();
        let flushes_before = tlb.flushes.lock().unwrap().len();

        // Second bind of the same VMA is a rebind and must flush.
        map_and_wait(&vm, &env_, &vma).unwrap();
        assert_eq!(tlb.flushes.lock().unwrap().len(), flushes_before + 1);
    }

    #[test]
    fn userptr_race_aborts_in_fault_mode() {
        let vm = Vm::new(1, VmFlags::FAULT_MODE, 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let vma = Arc::new(Vma::new(
            SZ_2M,
            SZ_2M + 0x1000,
            Backing::Userptr {
                segments: vec![DmaSegment {
                    dma_addr: 0x60_0000_0000,
                    len: 0x1000,
                }],
            },
        ));
        let mut vops = VmaOps::new(
            1,
            vec![VmaOp::Map {
                vma: vma.clone(),
                immediate: true,
                invalidate_on_bind: false,
            }],
        );

        let mut inner = vm.lock_inner();
        prepare(&vm, &mut inner, 0, &mut vops).unwrap();
        // The MMU notifier fires between prepare and run.
        vma.invalidate_userptr();
        let err = run(&vm, &mut inner, &env_, &mut vops).unwrap_err();
        assert!(matches!(err, IovError::Again));
        abort(&mut inner, 0, &mut vops);
        drop(inner);
        assert_eq!(vma.tile_present.load(Ordering::Acquire), 0);
    }

    #[test]
    fn userptr_race_kicks_rebind_worker_otherwise() {
        let vm = Vm::new(1, VmFlags::LR_MODE, 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let vma = Arc::new(Vma::new(
            SZ_2M,
            SZ_2M + 0x1000,
            Backing::Userptr {
                segments: vec![DmaSegment {
                    dma_addr: 0x70_0000_0000,
                    len: 0x1000,
                }],
            },
        ));
        let mut vops = VmaOps::new(
            1,
            vec![VmaOp::Map {
                vma: vma.clone(),
                immediate: true,
                invalidate_on_bind: false,
            }],
        );

        let mut inner = vm.lock_inner();
        prepare(&vm, &mut inner, 0, &mut vops).unwrap();
        vma.invalidate_userptr();
        let fence = run(&vm, &mut inner, &env_, &mut vops).unwrap();
        drop(inner);
        fence.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(vm.take_rebind_queued());
        assert!(vma.initial_bind.load(Ordering::Acquire));
    }

    #[test]
    fn overlapping_updates_are_ordered_by_range_fence() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let vma = system_vma(SZ_2M, 2 * SZ_2M, 0x80_0000_0000);
        let first = map_and_wait(&vm, &env_, &vma).unwrap();
        assert!(first.is_signaled());

        // After all fences signal the tree must be drained.
        for _ in 0..100 {
            if vm.rftree[0].is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(vm.rftree[0].is_empty());
    }

    #[test]
    fn remap_unbinds_then_rebinds_halves() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let whole = system_vma(0, 2 * SZ_2M, 0x90_0000_0000);
        map_and_wait(&vm, &env_, &whole).unwrap();

        // Split: keep the first half, drop the rest.
        let prev = system_vma(0, SZ_2M, 0x90_0000_0000);
        let mut vops = VmaOps::new(
            1,
            vec![VmaOp::Remap {
                unmap: whole.clone(),
                prev: Some(prev.clone()),
                next: None,
            }],
        );
        let fences = execute(&vm, std::slice::from_ref(&env_), &mut vops).unwrap();
        fences[0].wait_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(whole.tile_present.load(Ordering::Acquire), 0);
        assert_eq!(prev.tile_present.load(Ordering::Acquire), 1);
        let kept = lookup_pte(&vm, 0, 0).unwrap();
        assert!(PteFlags::from_bits_truncate(kept).contains(PteFlags::PRESENT));
    }

    #[test]
    fn svm_range_bind_and_invalidation_race() {
        let vm = Vm::new(1, VmFlags::FAULT_MODE, 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let mirror = Arc::new(Vma::new(0, 1 << 30, Backing::CpuAddrMirror));
        let range = Arc::new(SvmRange::new(
            SZ_2M,
            2 * SZ_2M,
            vec![DmaSegment {
                dma_addr: 0xa0_0000_0000,
                len: SZ_2M,
            }],
        ));

        let mut vops = VmaOps::new(
            1,
            vec![VmaOp::MapRange {
                vma: mirror.clone(),
                range: range.clone(),
            }],
        );
        let mut inner = vm.lock_inner();
        prepare(&vm, &mut inner, 0, &mut vops).unwrap();
        // SVM notifier invalidates the pages before commit.
        range.pages_valid.store(false, Ordering::Release);
        let err = run(&vm, &mut inner, &env_, &mut vops).unwrap_err();
        assert!(matches!(err, IovError::Again));
        abort(&mut inner, 0, &mut vops);
        drop(inner);

        // With valid pages the bind lands and flags the range.
        range.pages_valid.store(true, Ordering::Release);
        let mut vops = VmaOps::new(
            1,
            vec![VmaOp::MapRange {
                vma: mirror.clone(),
                range: range.clone(),
            }],
        );
        let fences = execute(&vm, std::slice::from_ref(&env_), &mut vops).unwrap();
        fences[0].wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(range.tile_present.load(Ordering::Acquire), 1);
    }

    #[test]
    fn bind_attaches_fence_to_bo_reservation() {
        let vm = Vm::new(1, VmFlags::empty(), 1);
        let migrate = Migrator::new(0);
        let tlb = Arc::new(RecordingTlb::default());
        let env_ = env(&migrate, &tlb);

        let vma = system_vma(SZ_2M, 2 * SZ_2M, 0xb0_0000_0000);
        let gate = Fence::new();
        let mut vops = VmaOps::new(
            1,
            vec![VmaOp::Map {
                vma: vma.clone(),
                immediate: true,
                invalidate_on_bind: false,
            }],
        );
        vops.syncs.push(gate.clone());
        let fences = execute(&vm, std::slice::from_ref(&env_), &mut vops).unwrap();

        // While gated, the bookkeep fence on the bo must be unsignaled.
        assert_eq!(vma.resv.unsignaled(ResvUsage::Bookkeep).len(), 1);
        gate.signal();
        fences[0].wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(vma.resv.unsignaled(ResvUsage::Bookkeep).is_empty());
    }
}
