//! An independent check of an allocation.
//!
//! Each block is simulated forwards from its beginning state, tracking what every placement
//! holds, and each operand is checked to be where its annotation says it is. Edges are then
//! checked by running their moves over the simulated end state of the predecessor.

use super::{AllocError, AllocMaps, dataflow::Dataflow};
use crate::{
    lir::{BlockIdx, Lir, Move, MoveSrc, OpId, Operand, Placement, Role, Value, VarIdx},
    target::RegisterCatalog,
};
use index_vec::IndexVec;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Content {
    Var(VarIdx),
    Const(i64),
}

type State = HashMap<Placement, Content>;

pub(crate) fn verify(
    lir: &Lir,
    cat: &RegisterCatalog,
    maps: &AllocMaps,
    df: &Dataflow,
) -> Result<(), AllocError> {
    let mut ends: IndexVec<BlockIdx, State> = IndexVec::with_capacity(lir.blocks.len());
    for bidx in lir.blocks.indices() {
        ends.push(verify_block(lir, cat, maps, bidx)?);
    }
    for (bidx, blk) in lir.blocks.iter_enumerated() {
        for succ in &blk.succs {
            verify_edge(lir, cat, maps, df, &ends[bidx], bidx, *succ)?;
        }
    }
    Ok(())
}

fn place_str(cat: &RegisterCatalog, place: Placement) -> String {
    match place {
        Placement::Reg(reg) => cat.name(reg).to_owned(),
        Placement::Stack(slot) => format!("@{}", slot.index()),
    }
}

fn located(op: &Operand, id: OpId) -> Result<(VarIdx, Placement), AllocError> {
    match (op.value, op.loc) {
        (Value::Var(var), Some(place)) => Ok((var, place)),
        (Value::Var(var), None) => Err(AllocError::InternalError(format!(
            "%{} has no location at {id}",
            var.index()
        ))),
        _ => Err(AllocError::InternalError(format!(
            "Operand at {id} is not a variable"
        ))),
    }
}

fn expect(
    cat: &RegisterCatalog,
    state: &State,
    var: VarIdx,
    place: Placement,
    what: &str,
) -> Result<(), AllocError> {
    if state.get(&place) != Some(&Content::Var(var)) {
        return Err(AllocError::InternalError(format!(
            "{what}: %{} is not in {}",
            var.index(),
            place_str(cat, place)
        )));
    }
    Ok(())
}

fn apply(
    cat: &RegisterCatalog,
    state: &mut State,
    moves: &[Move],
    what: &str,
) -> Result<(), AllocError> {
    for mv in moves {
        let content = match mv.from {
            MoveSrc::Loc(from) => {
                expect(cat, state, from.var, from.place, what)?;
                Content::Var(from.var)
            }
            MoveSrc::Const(c) => Content::Const(c),
        };
        state.insert(mv.to.place, content);
    }
    Ok(())
}

/// Check each operand's annotation in isolation, and that no two operands of `inst` share a
/// placement they may not.
fn check_operands(
    lir: &Lir,
    cat: &RegisterCatalog,
    ops: &[Operand],
    id: OpId,
) -> Result<(), AllocError> {
    for op in ops {
        let Some(var) = op.var() else { continue };
        let (_, place) = located(op, id)?;
        match place {
            Placement::Reg(reg) => {
                let info = cat.info(reg);
                if !info.is_allocatable() || info.class() != lir.vars[var].reg_class() {
                    return Err(AllocError::InternalError(format!(
                        "%{} at {id} can't be held in {}",
                        var.index(),
                        info.name()
                    )));
                }
            }
            Placement::Stack(_) => {
                if !op.flags.allows_stack() && op.role != Role::State {
                    return Err(AllocError::InternalError(format!(
                        "%{} at {id} must be in a register",
                        var.index()
                    )));
                }
            }
        }
    }

    for (i, a) in ops.iter().enumerate() {
        for b in &ops[i + 1..] {
            if let Some(place) = a.loc
                && clashes(a, b)
            {
                return Err(AllocError::InternalError(format!(
                    "Operands at {id} share {}",
                    place_str(cat, place)
                )));
            }
        }
    }
    Ok(())
}

/// May `a` and `b` not share the same placement?
fn clashes(a: &Operand, b: &Operand) -> bool {
    if a.loc.is_none() || a.loc != b.loc {
        return false;
    }
    match (a.role, b.role) {
        // An output may reuse the placement of an input, which has been read by the time the
        // output is written.
        (Role::Input, Role::Output) | (Role::Output, Role::Input) => false,
        (Role::Output | Role::Temp, _) | (_, Role::Output | Role::Temp) => true,
        _ => a.var().is_none() || a.var() != b.var(),
    }
}

fn verify_block(
    lir: &Lir,
    cat: &RegisterCatalog,
    maps: &AllocMaps,
    bidx: BlockIdx,
) -> Result<State, AllocError> {
    let blk = &lir.blocks[bidx];
    let mut state = State::new();
    for loc in maps[bidx].begin.iter() {
        state.insert(loc.place, Content::Var(loc.var));
    }
    if let Some(phis) = &blk.phis {
        for op in &phis.outputs {
            let (var, place) = located(op, blk.first_id())?;
            state.insert(place, Content::Var(var));
        }
    }

    for inst in &blk.insts {
        let id = inst.id;
        let what = format!("bb{} at {id}", bidx.index());
        apply(cat, &mut state, &inst.moves_before, &what)?;
        check_operands(lir, cat, &inst.operands, id)?;
        for op in inst.operands.iter() {
            if matches!(op.role, Role::Input | Role::Alive) && op.var().is_some() {
                let (var, place) = located(op, id)?;
                expect(cat, &state, var, place, &what)?;
            }
        }
        if inst.is_call {
            state.retain(|place, _| match place {
                Placement::Reg(reg) => !cat.is_caller_saved(*reg),
                Placement::Stack(_) => true,
            });
        }
        for op in inst.operands.iter() {
            if !matches!(op.role, Role::Output | Role::Temp) {
                continue;
            }
            match (op.value, op.loc) {
                (Value::Var(var), Some(place)) if op.role == Role::Output => {
                    state.insert(place, Content::Var(var));
                }
                (_, Some(place)) => {
                    state.remove(&place);
                }
                (_, None) => {
                    located(op, id)?;
                }
            }
        }
        for op in inst.operands.iter() {
            if matches!(op.role, Role::Alive | Role::State) && op.var().is_some() {
                let (var, place) = located(op, id)?;
                expect(cat, &state, var, place, &what)?;
            }
        }
        if let Some(rm) = &inst.safepoint {
            for place in rm.places() {
                if !matches!(state.get(&place), Some(Content::Var(var)) if lir.vars[*var].is_ref())
                {
                    return Err(AllocError::InternalError(format!(
                        "{what}: the reference map includes {}, which holds no reference",
                        place_str(cat, place)
                    )));
                }
            }
        }
        apply(cat, &mut state, &inst.moves_after, &what)?;
    }

    let what = format!("end of bb{}", bidx.index());
    for loc in maps[bidx].end.iter() {
        expect(cat, &state, loc.var, loc.place, &what)?;
    }
    Ok(state)
}

fn verify_edge(
    lir: &Lir,
    cat: &RegisterCatalog,
    maps: &AllocMaps,
    df: &Dataflow,
    end: &State,
    pred: BlockIdx,
    succ: BlockIdx,
) -> Result<(), AllocError> {
    let what = format!("bb{} -> bb{}", pred.index(), succ.index());
    let mut state = end.clone();
    let moves = if lir.blocks[pred].succs.len() == 1 {
        &lir.blocks[pred].moves_out
    } else {
        &lir.blocks[succ].moves_in
    };
    apply(cat, &mut state, moves, &what)?;

    for var in df.live_in(succ).iter_set_bits(..).map(VarIdx::from_usize) {
        let place = maps[succ].begin.place(var).ok_or_else(|| {
            AllocError::InternalError(format!("{what}: %{} has no location", var.index()))
        })?;
        expect(cat, &state, var, place, &what)?;
    }

    if let Some(phis) = &lir.blocks[succ].phis {
        let ins = phis
            .inputs_from(pred)
            .ok_or_else(|| AllocError::InternalError(format!("{what}: no phi inputs")))?;
        for (out, input) in phis.outputs.iter().zip(ins) {
            let (_, place) = located(out, lir.blocks[succ].first_id())?;
            let want = match input.value {
                Value::Const(c) => Content::Const(c),
                Value::Var(var) => Content::Var(var),
                Value::Reg(_) | Value::Stack(_) => {
                    return Err(AllocError::InternalError(format!(
                        "{what}: phi input is neither a variable nor a constant"
                    )));
                }
            };
            if state.get(&place) != Some(&want) {
                return Err(AllocError::InternalError(format!(
                    "{what}: phi output in {} has the wrong value",
                    place_str(cat, place)
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AllocConfig, RegAllocator, Strategy,
        frame::{FrameMap, SlotIdx},
        lir::{Location, parser::str_to_lir},
        log::Log,
        regalloc::{AllocCtx, greedy, resolve::resolve},
        target::{RegIdx, test_catalog},
    };

    /// Allocate `s` greedily, let `corrupt` damage the result, then verify it.
    fn corrupted(s: &str, corrupt: impl FnOnce(&mut Lir)) -> Result<(), AllocError> {
        let cat = test_catalog(2, 0);
        let mut lir = str_to_lir(&cat, s);
        let log = Log::new().unwrap();
        let cx = AllocCtx { cat: &cat, log: &log };
        let df = Dataflow::analyse(&mut lir, &cat)?;
        let mut frame = FrameMap::new(lir.fixed_slots);
        let maps = greedy::allocate(&mut lir, &cx, &df, &mut frame)?;
        resolve(&mut lir, &maps, &df, &mut frame)?;
        corrupt(&mut lir);
        verify(&lir, &cat, &maps, &df)
    }

    const SPILLY: &str = "
      bb0 -> bb1, bb2:
        def out(%0: i64), out(%1: i64)
        br in(%0)
      bb1 -> bb3:
        def out(%2: i64)
        use in(%0), in(%2)
      bb2 -> bb3:
        jmp
      bb3:
        ret in(%1)
    ";

    fn reg(x: usize) -> Placement {
        Placement::Reg(RegIdx::from_usize(x))
    }

    #[test]
    fn accepts_allocations() {
        corrupted(SPILLY, |_| ()).unwrap();
        let cat = test_catalog(2, 0);
        let ra = RegAllocator::new(
            cat.clone(),
            AllocConfig {
                strategy: Strategy::SpillAll,
                verify: true,
            },
        );
        ra.allocate(&mut str_to_lir(&cat, SPILLY)).unwrap();
    }

    #[test]
    fn wrong_operand() {
        let e = corrupted(SPILLY, |lir| {
            lir.blocks[BlockIdx::from_usize(3)].insts[0].operands[0].loc = Some(reg(0));
        });
        assert!(matches!(e, Err(AllocError::InternalError(_))));
    }

    #[test]
    fn missing_edge_move() {
        let e = corrupted(SPILLY, |lir| {
            lir.blocks[BlockIdx::from_usize(1)].moves_out.clear();
        });
        assert!(matches!(e, Err(AllocError::InternalError(_))));
    }

    #[test]
    fn clobbered_by_a_move() {
        let e = corrupted(SPILLY, |lir| {
            let var = VarIdx::from_usize(1);
            lir.blocks[BlockIdx::from_usize(0)].insts[1]
                .moves_before
                .push(Move::from_const(
                    3,
                    Location::new(var, Placement::Stack(SlotIdx::from_usize(5))),
                ));
            lir.blocks[BlockIdx::from_usize(0)].insts[1]
                .moves_before
                .push(Move::from_const(3, Location::new(var, reg(1))));
        });
        assert!(matches!(e, Err(AllocError::InternalError(_))));
    }

    #[test]
    fn aliased_operands() {
        let e = corrupted(
            "
          bb0:
            def out(%0: i64), out(%1: i64)
            ret in(%0), in(%1)
        ",
            |lir| {
                lir.blocks[BlockIdx::from_usize(0)].insts[0].operands[1].loc = Some(reg(0));
            },
        );
        assert!(matches!(e, Err(AllocError::InternalError(_))));
    }
}
