//! The GPU virtual address space.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use bitflags::bitflags;
use log::warn;

use crate::vm::fence::Fence;
use crate::vm::pt::{MAX_LEVEL, PtArena, PtId, pte_encode, PteFlags};
use crate::vm::rfence::RangeFenceTree;

/// Address of the shared scratch page backing unmapped VA when scratch
/// mode is on.
pub const SCRATCH_PAGE_ADDR: u64 = 0x0000_0fff_ffff_f000;

/// Default root level: four levels of paging, 48-bit VA.
pub const DEFAULT_ROOT_LEVEL: u32 = 3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: u32 {
        /// Unmapped VA reads the scratch page instead of faulting.
        const SCRATCH_PAGE = 1 << 0;
        /// Long-running mode: preempt-fence based eviction.
        const LR_MODE = 1 << 1;
        /// Recoverable page faults drive binds.
        const FAULT_MODE = 1 << 2;
        /// VRAM leaves must use 64 KiB pages.
        const REQUIRES_64K = 1 << 3;
        /// Platform supports the compact 64 KiB level-0 layout.
        const HAS_COMPACT = 1 << 4;
    }
}

/// Reservation-object usage classes, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResvUsage {
    Kernel,
    Bookkeep,
}

/// A reservation object: the fences attached to a bo (or the VM).
#[derive(Default)]
pub struct Resv {
    fences: Mutex<Vec<(ResvUsage, Fence)>>,
}

impl Resv {
    pub fn add_fence(&self, usage: ResvUsage, fence: Fence) {
        self.fences.lock().unwrap().push((usage, fence));
    }

    /// Unsignaled fences one must wait on for the given usage: kernel
    /// usage returns only kernel fences, bookkeep returns everything.
    #[must_use]
    pub fn unsignaled(&self, usage: ResvUsage) -> Vec<Fence> {
        self.fences
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, f)| {
                !f.is_signaled() && (usage == ResvUsage::Bookkeep || *u == ResvUsage::Kernel)
            })
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn prune_signaled(&self) {
        self.fences.lock().unwrap().retain(|(_, f)| !f.is_signaled());
    }
}

pub struct VmInner {
    pub arena: PtArena,
    pub pt_root: Vec<PtId>,
}

pub struct Vm {
    pub flags: VmFlags,
    pub asid: u32,
    num_tiles: usize,

    inner: Mutex<VmInner>,
    pub rftree: Vec<RangeFenceTree>,
    pub resv: Resv,

    /// Taken for reading around commit so MMU notifier invalidations
    /// (writers) cannot race staged userptr updates.
    pub userptr_notifier: RwLock<()>,
    /// Serializes SVM page-validity checks against SVM notifiers.
    pub svm_notifier: Mutex<()>,

    pub tlb_flush_seqno: AtomicU64,
    rebind_queued: AtomicBool,
    killed: AtomicBool,
}

impl Vm {
    #[must_use]
    pub fn new(num_tiles: usize, flags: VmFlags, asid: u32) -> Self {
        assert!(num_tiles >= 1);
        let mut arena = PtArena::new();
        let empty = empty_pte(flags, DEFAULT_ROOT_LEVEL);
        let pt_root = (0..num_tiles)
            .map(|_| {
                let root = arena.alloc(DEFAULT_ROOT_LEVEL);
                arena.populate_empty(root, empty);
                root
            })
            .collect();
        Self {
            flags,
            asid,
            num_tiles,
            inner: Mutex::new(VmInner { arena, pt_root }),
            rftree: (0..num_tiles).map(|_| RangeFenceTree::new()).collect(),
            resv: Resv::default(),
            userptr_notifier: RwLock::new(()),
            svm_notifier: Mutex::new(()),
            tlb_flush_seqno: AtomicU64::new(0),
            rebind_queued: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn num_tiles(&self) -> usize {
        self.num_tiles
    }

    /// The VM write lock: protects the page-table tree and its arena.
    pub fn lock_inner(&self) -> MutexGuard<'_, VmInner> {
        self.inner.lock().unwrap()
    }

    #[must_use]
    pub fn has_scratch(&self) -> bool {
        self.flags.contains(VmFlags::SCRATCH_PAGE)
    }

    #[must_use]
    pub fn in_lr_mode(&self) -> bool {
        self.flags.contains(VmFlags::LR_MODE)
    }

    #[must_use]
    pub fn in_fault_mode(&self) -> bool {
        self.flags.contains(VmFlags::FAULT_MODE)
    }

    #[must_use]
    pub fn in_preempt_fence_mode(&self) -> bool {
        self.in_lr_mode() && !self.in_fault_mode()
    }

    /// Wedge the VM: past the commit point of no return, failures cannot
    /// be rolled back, only fenced off.
    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            warn!("VM killed");
        }
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Ask the rebind worker to run; bind paths that took a bookkeep
    /// dependency under preempt-fence mode call this so preempt fences
    /// cannot deadlock the VM.
    pub fn queue_rebind_worker(&self) {
        self.rebind_queued.store(true, Ordering::Release);
    }

    pub fn take_rebind_queued(&self) -> bool {
        self.rebind_queued.swap(false, Ordering::AcqRel)
    }
}

/// The entry written where nothing is mapped.
#[must_use]
pub fn empty_pte(flags: VmFlags, _level: u32) -> u64 {
    if flags.contains(VmFlags::SCRATCH_PAGE) {
        pte_encode(SCRATCH_PAGE_ADDR, PteFlags::empty())
    } else {
        0
    }
}

const _: () = assert!(DEFAULT_ROOT_LEVEL <= MAX_LEVEL);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_are_populated_per_tile() {
        let vm = Vm::new(2, VmFlags::SCRATCH_PAGE, 1);
        let inner = vm.lock_inner();
        assert_eq!(inner.pt_root.len(), 2);
        let root = inner.arena.get(inner.pt_root[0]);
        assert_eq!(root.level, DEFAULT_ROOT_LEVEL);
        assert_ne!(root.bo.read(0), 0);
    }

    #[test]
    fn resv_usage_filtering() {
        let resv = Resv::default();
        let kernel = Fence::new();
        let bookkeep = Fence::new();
        resv.add_fence(ResvUsage::Kernel, kernel.clone());
        resv.add_fence(ResvUsage::Bookkeep, bookkeep.clone());

        assert_eq!(resv.unsignaled(ResvUsage::Kernel).len(), 1);
        assert_eq!(resv.unsignaled(ResvUsage::Bookkeep).len(), 2);
        kernel.signal();
        bookkeep.signal();
        assert!(resv.unsignaled(ResvUsage::Bookkeep).is_empty());
        resv.prune_signaled();
    }

    #[test]
    fn kill_is_sticky() {
        let vm = Vm::new(1, VmFlags::empty(), 0);
        assert!(!vm.is_killed());
        vm.kill();
        vm.kill();
        assert!(vm.is_killed());
    }
}
