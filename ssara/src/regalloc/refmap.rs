//! Reference maps for safepoints.
//!
//! Each block is walked backwards, tracking which variable every placement holds. At a safepoint,
//! the placements holding variables of kind [Kind::Ref](crate::lir::Kind::Ref) that are live
//! across the instruction form its [RefMap]. Outputs and temporaries of the safepoint itself are
//! not live across it; nor are inputs whose last use it is.

use super::{AllocError, AllocMaps, dataflow::Dataflow};
use crate::lir::{BlockIdx, Lir, Move, MoveSrc, Placement, RefMap, Role, VarIdx};
use std::collections::HashMap;

pub(crate) fn compute(lir: &mut Lir, maps: &AllocMaps, df: &Dataflow) -> Result<(), AllocError> {
    for bidx in lir.blocks.indices().rev() {
        let refmaps = block(lir, maps, df, bidx)?;
        for (pos, rm) in refmaps {
            lir.blocks[bidx].insts[pos].safepoint = Some(rm);
        }
    }
    Ok(())
}

type Tracked = HashMap<Placement, VarIdx>;

fn block(
    lir: &Lir,
    maps: &AllocMaps,
    df: &Dataflow,
    bidx: BlockIdx,
) -> Result<Vec<(usize, RefMap)>, AllocError> {
    let blk = &lir.blocks[bidx];
    let mut tracked = Tracked::new();
    if let [succ] = blk.succs.as_slice() {
        // The outgoing moves belong to this block, so work back from where the successor expects
        // things to be.
        for loc in maps[*succ].begin.iter() {
            tracked.insert(loc.place, loc.var);
        }
        if let Some(phis) = &lir.blocks[*succ].phis {
            for loc in phis.outputs.iter().filter_map(|x| x.location()) {
                tracked.insert(loc.place, loc.var);
            }
        }
        undo_moves(&mut tracked, &blk.moves_out);
    } else {
        for loc in maps[bidx].end.iter() {
            tracked.insert(loc.place, loc.var);
        }
    }
    for succ in &blk.succs {
        if let Some(ins) = lir.blocks[*succ]
            .phis
            .as_ref()
            .and_then(|x| x.inputs_from(bidx))
        {
            for loc in ins.iter().filter_map(|x| x.location()) {
                tracked.insert(loc.place, loc.var);
            }
        }
    }

    let mut live = df.live_out(lir, bidx);
    let mut refmaps = Vec::new();
    for (pos, inst) in blk.insts.iter().enumerate().rev() {
        undo_moves(&mut tracked, &inst.moves_after);
        for op in inst.operands.iter() {
            if !matches!(op.role, Role::Output | Role::Temp) {
                continue;
            }
            if let Some(place) = op.loc {
                tracked.remove(&place);
            }
            if let Some(var) = op.var() {
                tracked.retain(|_, x| *x != var);
                live.set(var.index(), false);
            }
        }
        for op in inst.operands.iter() {
            if matches!(op.role, Role::Alive | Role::State)
                && let Some(loc) = op.location()
            {
                tracked.insert(loc.place, loc.var);
                live.set(loc.var.index(), true);
            }
        }

        if inst.safepoint.is_some() {
            let mut tracked_refs = tracked
                .values()
                .copied()
                .filter(|x| lir.vars[*x].is_ref())
                .collect::<Vec<_>>();
            tracked_refs.sort();
            tracked_refs.dedup();
            let live_refs = live
                .iter_set_bits(..)
                .map(VarIdx::from_usize)
                .filter(|x| lir.vars[*x].is_ref())
                .collect::<Vec<_>>();
            if tracked_refs != live_refs {
                return Err(AllocError::InternalError(format!(
                    "Live references at the safepoint at {} have no location",
                    inst.id
                )));
            }
            let mut rm = RefMap::new();
            for (place, var) in &tracked {
                if lir.vars[*var].is_ref() {
                    rm.set(*place);
                }
            }
            refmaps.push((pos, rm));
        }

        for op in inst.operands.iter() {
            if op.role == Role::Input
                && let Some(loc) = op.location()
            {
                tracked.insert(loc.place, loc.var);
                live.set(loc.var.index(), true);
            }
        }
        undo_moves(&mut tracked, &inst.moves_before);
    }

    // Everything still tracked must be where the block's beginning state (or its phis) put it,
    // and every variable live into the block must still be tracked.
    let mut expected = maps[bidx]
        .begin
        .iter()
        .map(|x| (x.place, x.var))
        .collect::<Tracked>();
    if let Some(phis) = &blk.phis {
        for loc in phis.outputs.iter().filter_map(|x| x.location()) {
            expected.insert(loc.place, loc.var);
        }
    }
    if tracked.iter().any(|(place, var)| expected.get(place) != Some(var))
        || maps[bidx]
            .begin
            .iter()
            .any(|loc| tracked.get(&loc.place) != Some(&loc.var))
    {
        return Err(AllocError::InternalError(format!(
            "Tracked locations at the start of bb{} do not match its beginning state",
            bidx.index()
        )));
    }
    Ok(refmaps)
}

/// Walk `moves` backwards: before a move, its source holds what its destination holds after it.
fn undo_moves(tracked: &mut Tracked, moves: &[Move]) {
    for mv in moves.iter().rev() {
        if tracked.remove(&mv.to.place).is_some()
            && let MoveSrc::Loc(from) = mv.from
        {
            tracked.insert(from.place, from.var);
        }
    }
}
