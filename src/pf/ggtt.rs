//! GGTT address-space manager.
//!
//! Tracks occupied ranges of the single flat GPU address space so the PF
//! can carve aligned blocks out of it for VFs. The bottom of the space up
//! to the WOPCM boundary belongs to the PF alone and is never handed out.

use std::collections::BTreeMap;

use crate::error::{IovError, IovResult};
use crate::pf::config::PFID;

pub const SZ_4K: u64 = 0x1000;
pub const SZ_64K: u64 = 0x10000;
pub const SZ_2M: u64 = 0x20_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgttNode {
    pub start: u64,
    pub size: u64,
}

impl GgttNode {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.size
    }
}

const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[derive(Debug)]
pub struct GgttManager {
    wopcm: u64,
    total: u64,
    alignment: u64,

    // Occupied ranges: start -> (size, owner vfid).
    nodes: BTreeMap<u64, (u64, u32)>,
}

impl GgttManager {
    #[must_use]
    pub fn new(wopcm: u64, total: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(wopcm < total);
        Self {
            wopcm,
            total,
            alignment,
            nodes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    fn holes(&self) -> Vec<(u64, u64)> {
        let mut holes = Vec::new();
        let mut cursor = self.wopcm;
        for (&start, &(size, _)) in &self.nodes {
            if start > cursor {
                holes.push((cursor, start));
            }
            cursor = cursor.max(start + size);
        }
        if cursor < self.total {
            holes.push((cursor, self.total));
        }
        holes
    }

    fn aligned_holes(&self) -> impl Iterator<Item = (u64, u64)> {
        let alignment = self.alignment;
        self.holes().into_iter().filter_map(move |(start, end)| {
            let start = align_up(start, alignment);
            let end = align_down(end, alignment);
            (start < end).then_some((start, end))
        })
    }

    /// Sum of all aligned holes, less one alignment unit of spare.
    #[must_use]
    pub fn free_space(&self, spare: u64) -> u64 {
        let free: u64 = self.aligned_holes().map(|(s, e)| e - s).sum();
        free.saturating_sub(spare)
    }

    /// Largest single aligned hole. The spare is satisfied from the other
    /// holes first and only eats into the largest one when it has to.
    #[must_use]
    pub fn largest_hole(&self, spare: u64) -> u64 {
        let mut spare = spare;
        let mut max_hole = 0u64;
        for (start, end) in self.aligned_holes() {
            let hole_size = end - start;
            spare -= spare.min(hole_size).min(max_hole);
            max_hole = max_hole.max(hole_size);
        }
        if max_hole > spare { max_hole - spare } else { 0 }
    }

    /// Carve an aligned block, preferring the top of the smallest hole that
    /// fits; among exact fits the highest one wins.
    pub fn insert(&mut self, size: u64, owner: u32) -> IovResult<GgttNode> {
        debug_assert!(size % self.alignment == 0 && size != 0);

        let mut best: Option<(u64, u64)> = None; // (hole size, placement)
        for (start, end) in self.aligned_holes() {
            let hole_size = end - start;
            if hole_size < size {
                continue;
            }
            let at = end - size;
            match best {
                Some((bs, bat)) if hole_size > bs || (hole_size == bs && at < bat) => {}
                _ => best = Some((hole_size, at)),
            }
        }

        let (_, start) = best.ok_or(IovError::OutOfSpace("GGTT"))?;
        self.nodes.insert(start, (size, owner));
        Ok(GgttNode { start, size })
    }

    pub fn remove(&mut self, node: &GgttNode) {
        let removed = self.nodes.remove(&node.start);
        debug_assert!(matches!(removed, Some((size, _)) if size == node.size));
    }

    /// Re-tag every PTE of `node` with a new owner, without touching the
    /// allocation itself. FLR finalization uses this to hand a VF's range
    /// back to the PF before the GuC is told the reset finished.
    pub fn set_space_owner(&mut self, vfid: u32, node: &GgttNode) {
        if let Some(entry) = self.nodes.get_mut(&node.start) {
            entry.1 = vfid;
        }
    }

    #[must_use]
    pub fn owner_of(&self, addr: u64) -> u32 {
        for (&start, &(size, owner)) in &self.nodes {
            if (start..start + size).contains(&addr) {
                return owner;
            }
        }
        PFID
    }

    #[must_use]
    pub fn node_of(&self, owner: u32) -> Option<GgttNode> {
        self.nodes
            .iter()
            .find(|&(_, &(_, o))| o == owner)
            .map(|(&start, &(size, _))| GgttNode { start, size })
    }
}
