//! Typed page-table walker.
//!
//! The walker owns descent; strategies implement [`PtWalk`] and say, per
//! entry, whether to continue with the next sibling, descend into the
//! subtree, or stop. `entry` fires before a possible descent, and
//! `post_descend` fires after it (for the shared walk, also once for the
//! root so updates to the root table itself can be staged).

use crate::error::IovResult;
use crate::vm::pt::{PDES, PtArena, PtId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Move on to the next sibling entry.
    Continue,
    /// Descend into this entry's subtree.
    Subtree,
    /// Abandon the walk.
    Stop,
}

/// Mutable walk parameters; strategies may switch `shifts` mid-walk (the
/// compact-layout path does).
pub struct WalkState {
    pub shifts: [u32; 5],
    pub max_level: u32,
    /// Walk the staging tree instead of the one the GPU sees.
    pub staging: bool,
}

impl WalkState {
    #[must_use]
    pub fn shift(&self, level: u32) -> u32 {
        self.shifts[level as usize]
    }

    /// Index of the entry covering `addr` in a table at `level`.
    #[must_use]
    pub fn offset(&self, addr: u64, level: u32) -> usize {
        ((addr >> self.shift(level)) & (PDES as u64 - 1)) as usize
    }

    /// Number of entries at `level` needed to span `[addr, end)`.
    #[must_use]
    pub fn num_entries(&self, addr: u64, end: u64, level: u32) -> usize {
        let size = 1u64 << self.shift(level);
        (end.div_ceil(size) - (addr & !(size - 1)) / size) as usize
    }

    /// Whether `[addr, next)` exactly covers one whole entry at `level`.
    #[must_use]
    pub fn covers(&self, addr: u64, next: u64, level: u32) -> bool {
        let size = 1u64 << self.shift(level);
        addr & (size - 1) == 0 && next - addr == size
    }
}

/// One visited entry. `child` is the slot content on entry; a strategy
/// that allocates a subtree records it here so the walker can descend.
pub struct EntryCtx {
    pub parent: PtId,
    pub offset: usize,
    /// Level of the table holding the entry.
    pub level: u32,
    pub addr: u64,
    pub next: u64,
    pub child: Option<PtId>,
}

pub trait PtWalk {
    fn entry(
        &mut self,
        arena: &mut PtArena,
        walk: &mut WalkState,
        ctx: &mut EntryCtx,
    ) -> IovResult<WalkAction>;

    fn post_descend(
        &mut self,
        _arena: &mut PtArena,
        _walk: &mut WalkState,
        _ctx: &mut EntryCtx,
    ) -> IovResult<()> {
        Ok(())
    }
}

fn entry_end(addr: u64, end: u64, size: u64) -> u64 {
    ((addr | (size - 1)) + 1).min(end)
}

/// Walk `[start, end)` over the table `parent` (at `level`), visiting
/// every entry whether or not a child exists. Used to build trees.
pub fn walk_range<W: PtWalk>(
    arena: &mut PtArena,
    walk: &mut WalkState,
    strategy: &mut W,
    parent: PtId,
    level: u32,
    start: u64,
    end: u64,
) -> IovResult<()> {
    debug_assert!(start < end);
    let mut addr = start;
    while addr < end {
        let size = 1u64 << walk.shift(level);
        let next = entry_end(addr, end, size);
        let offset = walk.offset(addr, level);
        let mut ctx = EntryCtx {
            parent,
            offset,
            level,
            addr,
            next,
            child: arena.get(parent).child(offset, walk.staging),
        };

        match strategy.entry(arena, walk, &mut ctx)? {
            WalkAction::Stop => return Ok(()),
            WalkAction::Subtree if level > 0 => {
                if let Some(child) = ctx.child {
                    walk_range(arena, walk, strategy, child, level - 1, addr, next)?;
                    strategy.post_descend(arena, walk, &mut ctx)?;
                }
            }
            _ => {}
        }
        addr = next;
    }
    Ok(())
}

/// Walk only the already-populated part of the tree; entries without a
/// child are skipped and level-0 tables are handled from their parent via
/// `post_descend`. Used by unbind staging and zap.
pub fn walk_shared<W: PtWalk>(
    arena: &mut PtArena,
    walk: &mut WalkState,
    strategy: &mut W,
    root: PtId,
    level: u32,
    start: u64,
    end: u64,
) -> IovResult<()> {
    walk_shared_range(arena, walk, strategy, root, level, start, end)?;

    // Give the strategy one look at the root itself, so entries of the
    // root table spanning killed subtrees can be recorded too.
    let mut ctx = EntryCtx {
        parent: root,
        offset: 0,
        level: level + 1,
        addr: start,
        next: end,
        child: Some(root),
    };
    strategy.post_descend(arena, walk, &mut ctx)
}

fn walk_shared_range<W: PtWalk>(
    arena: &mut PtArena,
    walk: &mut WalkState,
    strategy: &mut W,
    parent: PtId,
    level: u32,
    start: u64,
    end: u64,
) -> IovResult<()> {
    let mut addr = start;
    while addr < end {
        let size = 1u64 << walk.shift(level);
        let next = entry_end(addr, end, size);
        let offset = walk.offset(addr, level);
        let child = arena.get(parent).child(offset, walk.staging);

        let Some(child) = child else {
            addr = next;
            continue;
        };
        let mut ctx = EntryCtx {
            parent,
            offset,
            level,
            addr,
            next,
            child: Some(child),
        };

        match strategy.entry(arena, walk, &mut ctx)? {
            WalkAction::Stop => return Ok(()),
            WalkAction::Subtree => {
                if arena.get(child).level > 0 {
                    walk_shared_range(arena, walk, strategy, child, level - 1, addr, next)?;
                }
                strategy.post_descend(arena, walk, &mut ctx)?;
            }
            WalkAction::Continue => {}
        }
        addr = next;
    }
    Ok(())
}
