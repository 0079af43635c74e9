//! Applying and unwinding staged page-table updates.
//!
//! Prepare-time bookkeeping swaps new children into the staging slots and
//! remembers the displaced ones; commit makes the swap visible to the CPU
//! tree (`children`) and tears the displaced subtrees down; abort restores
//! the staging slots in LIFO order and destroys what the walk allocated.

use crate::vm::pt::PtArena;
use crate::vm::stage::PtUpdateEntry;

/// Bind bookkeeping, run while the operation is being prepared: install
/// the new children into the staging slots, keeping the displaced entries
/// inside `pt_entries` for a later commit or abort.
pub fn commit_prepare_bind(arena: &mut PtArena, entries: &mut [PtUpdateEntry], rebind: bool) {
    for entry in entries.iter_mut() {
        if !rebind {
            arena.get_mut(entry.pt).num_live += entry.qwords as u32;
        }
        if entry.level == 0 {
            continue;
        }
        for j in 0..entry.qwords {
            let slot = entry.ofs + j;
            let new_child = entry.pt_entries[j].pt;
            let old_child = arena.get(entry.pt).child(slot, true);
            arena.get_mut(entry.pt).set_child(slot, true, new_child);
            entry.pt_entries[j].pt = old_child;
        }
    }
}

/// Unbind bookkeeping: pull the dying children out of the staging slots,
/// keeping them in `pt_entries` for destruction at commit or restoration
/// at abort.
pub fn commit_prepare_unbind(arena: &mut PtArena, entries: &mut [PtUpdateEntry]) {
    for entry in entries.iter_mut() {
        arena.get_mut(entry.pt).num_live -= entry.qwords as u32;
        if entry.level == 0 {
            continue;
        }
        for j in 0..entry.qwords {
            let slot = entry.ofs + j;
            entry.pt_entries[j].pt = arena.get(entry.pt).child(slot, true);
            arena.get_mut(entry.pt).set_child(slot, true, None);
        }
    }
}

/// The point of no return: once the PT-update job is queued, fold the
/// staging slots into the live tree and destroy whatever they displaced.
/// Leaf updates need no swap; their writes go straight to table memory.
pub fn commit(arena: &mut PtArena, entries: &mut [PtUpdateEntry]) {
    for entry in entries.iter_mut() {
        if entry.level == 0 {
            continue;
        }
        for j in 0..entry.qwords {
            let slot = entry.ofs + j;
            let displaced = entry.pt_entries[j].pt.take();
            let staged = arena.get(entry.pt).child(slot, true);
            arena.get_mut(entry.pt).set_child(slot, false, staged);
            if let Some(displaced) = displaced {
                arena.destroy(displaced);
            }
        }
    }
}

/// Unwind a prepared bind: restore the displaced children and destroy the
/// subtrees the walk allocated, newest first.
pub fn abort_bind(arena: &mut PtArena, entries: &mut [PtUpdateEntry], rebind: bool) {
    for entry in entries.iter_mut().rev() {
        if !rebind {
            arena.get_mut(entry.pt).num_live -= entry.qwords as u32;
        }
        if entry.level == 0 {
            continue;
        }
        for j in 0..entry.qwords {
            let slot = entry.ofs + j;
            let fresh = arena.get(entry.pt).child(slot, true);
            let displaced = entry.pt_entries[j].pt.take();
            arena.get_mut(entry.pt).set_child(slot, true, displaced);
            if let Some(fresh) = fresh {
                if Some(fresh) != displaced {
                    arena.destroy(fresh);
                }
            }
        }
    }
}

/// Unwind a prepared unbind: put the children back into their staging
/// slots.
pub fn abort_unbind(arena: &mut PtArena, entries: &mut [PtUpdateEntry]) {
    for entry in entries.iter_mut().rev() {
        arena.get_mut(entry.pt).num_live += entry.qwords as u32;
        if entry.level == 0 {
            continue;
        }
        for j in 0..entry.qwords {
            let slot = entry.ofs + j;
            arena
                .get_mut(entry.pt)
                .set_child(slot, true, entry.pt_entries[j].pt.take());
        }
    }
}

/// Drop staged subtrees after a failed walk, before any prepare ran:
/// `pt_entries` still hold the freshly built children.
pub fn cancel_bind(arena: &mut PtArena, entries: &mut [PtUpdateEntry]) {
    for entry in entries.iter_mut() {
        if entry.level == 0 {
            continue;
        }
        for j in 0..entry.qwords {
            if let Some(child) = entry.pt_entries[j].pt.take() {
                arena.destroy(child);
            }
        }
    }
}
