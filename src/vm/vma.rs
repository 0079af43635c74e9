//! GPU virtual memory areas and SVM ranges.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::vm::vm::Resv;

/// A physically contiguous run of backing memory.
#[derive(Debug, Clone, Copy)]
pub struct DmaSegment {
    pub dma_addr: u64,
    pub len: u64,
}

/// Where a VMA's pages live.
#[derive(Debug)]
pub enum Backing {
    /// No backing at all; PTEs map to null.
    Null,
    /// Buffer-object pages (VRAM when `vram` is set, system otherwise).
    Bo { segments: Vec<DmaSegment>, vram: bool },
    /// CPU user pages; validity tracked by a notifier sequence.
    Userptr { segments: Vec<DmaSegment> },
    /// Mirrored CPU address range: no pages of its own, bound through
    /// SVM ranges instead.
    CpuAddrMirror,
}

bitflags! {
    /// Which PTE sizes ended up mapping this VMA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmaPteSizes: u32 {
        const SZ_4K = 1 << 0;
        const SZ_2M = 1 << 1;
        const SZ_1G = 1 << 2;
        const SZ_64K = 1 << 4;
        const COMPACT = 1 << 5;
    }
}

pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub backing: Backing,
    /// Map with the device-atomics PTE hint.
    pub atomic_hint: bool,
    /// Reservation object of the backing bo.
    pub resv: Arc<Resv>,

    /// Tiles this VMA is currently bound on. May be read without the VM
    /// lock as an advisory snapshot; writes happen under the VM lock.
    pub tile_present: AtomicU8,
    /// Tiles whose binding is present but TLB-stale.
    pub tile_invalidated: AtomicU8,
    /// Tiles with a bind staged but not yet committed.
    pub tile_staged: AtomicU8,

    pub pte_sizes: Mutex<VmaPteSizes>,

    // Userptr bookkeeping; meaningful only for Backing::Userptr.
    pub notifier_seq: AtomicU64,
    pub initial_bind: AtomicBool,
    /// On the VM's rebind list after an invalidation.
    pub on_rebind_list: AtomicBool,
}

impl Vma {
    #[must_use]
    pub fn new(start: u64, end: u64, backing: Backing) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            backing,
            atomic_hint: false,
            resv: Arc::new(Resv::default()),
            tile_present: AtomicU8::new(0),
            tile_invalidated: AtomicU8::new(0),
            tile_staged: AtomicU8::new(0),
            pte_sizes: Mutex::new(VmaPteSizes::empty()),
            notifier_seq: AtomicU64::new(0),
            initial_bind: AtomicBool::new(false),
            on_rebind_list: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self.backing, Backing::Null)
    }

    #[must_use]
    pub fn is_userptr(&self) -> bool {
        matches!(self.backing, Backing::Userptr { .. })
    }

    #[must_use]
    pub fn is_cpu_addr_mirror(&self) -> bool {
        matches!(self.backing, Backing::CpuAddrMirror)
    }

    #[must_use]
    pub fn segments(&self) -> &[DmaSegment] {
        match &self.backing {
            Backing::Bo { segments, .. } | Backing::Userptr { segments } => segments,
            Backing::Null | Backing::CpuAddrMirror => &[],
        }
    }

    #[must_use]
    pub fn is_vram(&self) -> bool {
        matches!(self.backing, Backing::Bo { vram: true, .. })
    }

    /// Bump the notifier sequence, as the MMU notifier would on an
    /// invalidation of the backing user pages.
    pub fn invalidate_userptr(&self) {
        debug_assert!(self.is_userptr());
        self.notifier_seq.fetch_add(1, Ordering::Release);
    }
}

/// An SVM address range bound through a CPU-address-mirror VMA.
pub struct SvmRange {
    pub start: u64,
    pub end: u64,
    pub segments: Vec<DmaSegment>,
    /// Cleared by the SVM notifier when the backing pages go away.
    pub pages_valid: AtomicBool,
    pub tile_present: AtomicU8,
    pub tile_invalidated: AtomicU8,
}

impl SvmRange {
    #[must_use]
    pub fn new(start: u64, end: u64, segments: Vec<DmaSegment>) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            segments,
            pages_valid: AtomicBool::new(true),
            tile_present: AtomicU8::new(0),
            tile_invalidated: AtomicU8::new(0),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Walks a VMA's (or range's) DMA segments linearly.
#[derive(Debug, Clone)]
pub struct ResCursor<'a> {
    segments: &'a [DmaSegment],
    seg: usize,
    seg_ofs: u64,
}

impl<'a> ResCursor<'a> {
    #[must_use]
    pub fn new(segments: &'a [DmaSegment]) -> Self {
        Self {
            segments,
            seg: 0,
            seg_ofs: 0,
        }
    }

    /// DMA address at the cursor.
    #[must_use]
    pub fn dma_addr(&self) -> u64 {
        self.segments[self.seg].dma_addr + self.seg_ofs
    }

    /// Contiguous bytes remaining in the current segment.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        if self.seg >= self.segments.len() {
            return 0;
        }
        self.segments[self.seg].len - self.seg_ofs
    }

    pub fn advance(&mut self, mut bytes: u64) {
        while bytes > 0 && self.seg < self.segments.len() {
            let step = bytes.min(self.remaining());
            self.seg_ofs += step;
            bytes -= step;
            if self.seg_ofs == self.segments[self.seg].len {
                self.seg += 1;
                self.seg_ofs = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_walks_segments() {
        let segments = [
            DmaSegment {
                dma_addr: 0x1000,
                len: 0x2000,
            },
            DmaSegment {
                dma_addr: 0x10_0000,
                len: 0x1000,
            },
        ];
        let mut curs = ResCursor::new(&segments);
        assert_eq!(curs.dma_addr(), 0x1000);
        assert_eq!(curs.remaining(), 0x2000);
        curs.advance(0x1800);
        assert_eq!(curs.dma_addr(), 0x2800);
        curs.advance(0x800);
        assert_eq!(curs.dma_addr(), 0x10_0000);
        curs.advance(0x1000);
        assert_eq!(curs.remaining(), 0);
    }

    #[test]
    fn userptr_invalidation_bumps_seq() {
        let vma = Vma::new(
            0x1000,
            0x2000,
            Backing::Userptr {
                segments: vec![DmaSegment {
                    dma_addr: 0x8000,
                    len: 0x1000,
                }],
            },
        );
        let seq = vma.notifier_seq.load(Ordering::Acquire);
        vma.invalidate_userptr();
        assert_ne!(vma.notifier_seq.load(Ordering::Acquire), seq);
    }
}
