//! Resolution of control-flow edges.
//!
//! An allocator only guarantees that a block's beginning state is consistent with its dominator.
//! For every other edge `pred -> succ`, values may be somewhere other than where `succ` expects
//! them, and phi outputs must be filled from the values `pred` supplies. The moves needed are
//! placed in `pred`'s outgoing moves if `pred` has a single successor, or else in `succ`'s incoming
//! moves if `succ` has a single predecessor. Critical edges (neither) must have been split before
//! allocation.

use super::{AllocError, AllocMaps, dataflow::Dataflow, moves::MoveGroup};
use crate::{
    frame::FrameMap,
    lir::{BlockIdx, Lir, Move, Value, VarIdx},
};

/// Insert the moves needed on every edge of `lir`, returning how many moves were inserted.
pub(crate) fn resolve(
    lir: &mut Lir,
    maps: &AllocMaps,
    df: &Dataflow,
    frame: &mut FrameMap,
) -> Result<usize, AllocError> {
    let mut nmoves = 0;
    for bidx in lir.blocks.indices() {
        let succs = lir.blocks[bidx].succs.clone();
        for succ in succs {
            let group = edge_moves(lir, maps, df, bidx, succ)?;
            if group.is_empty() {
                continue;
            }
            let moves = group.sequentialize(frame);
            nmoves += moves.len();
            if lir.blocks[bidx].succs.len() == 1 {
                lir.blocks[bidx].moves_out.extend(moves);
            } else if lir.blocks[succ].preds.len() == 1 {
                lir.blocks[succ].moves_in.splice(0..0, moves);
            } else {
                return Err(AllocError::InternalError(format!(
                    "Critical edge bb{} -> bb{} needs moves",
                    bidx.index(),
                    succ.index()
                )));
            }
        }
    }
    Ok(nmoves)
}

/// The parallel move needed on the edge `pred -> succ`.
fn edge_moves(
    lir: &Lir,
    maps: &AllocMaps,
    df: &Dataflow,
    pred: BlockIdx,
    succ: BlockIdx,
) -> Result<MoveGroup, AllocError> {
    let mut group = MoveGroup::new();
    let end = &maps[pred].end;
    let begin = &maps[succ].begin;
    for var in df.live_in(succ).iter_set_bits(..).map(VarIdx::from_usize) {
        match (end.get(var), begin.get(var)) {
            (Some(from), Some(to)) => group.push(Move::new(from, to)),
            _ => {
                return Err(AllocError::InternalError(format!(
                    "%{} is live on bb{} -> bb{} but has no location at one end",
                    var.index(),
                    pred.index(),
                    succ.index()
                )));
            }
        }
    }

    if let Some(phis) = &lir.blocks[succ].phis {
        let ins = phis.inputs_from(pred).ok_or_else(|| {
            AllocError::InternalError(format!(
                "bb{} supplies no values to bb{}'s phis",
                pred.index(),
                succ.index()
            ))
        })?;
        for (out, input) in phis.outputs.iter().zip(ins) {
            let missing = || {
                AllocError::InternalError(format!(
                    "Unallocated phi on bb{} -> bb{}",
                    pred.index(),
                    succ.index()
                ))
            };
            let to = out.location().ok_or_else(missing)?;
            match input.value {
                Value::Const(c) => group.push(Move::from_const(c, to)),
                Value::Var(_) => group.push(Move::new(input.location().ok_or_else(missing)?, to)),
                Value::Reg(_) | Value::Stack(_) => return Err(missing()),
            }
        }
    }
    Ok(group)
}

#[cfg(test)]
mod tests {
    use crate::{
        Strategy,
        regalloc::{
            AllocError,
            test::{alloc_and_test, allocate_str},
        },
        target::test_catalog,
    };

    #[test]
    fn diamond() {
        // bb1 spills %1 and %2 to make room, so the join needs them reloaded on the bb1 edge.
        alloc_and_test(
            &test_catalog(2, 0),
            Strategy::Greedy,
            "
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
        ",
            "
          bb0 -> bb1, bb2:
            0: def out(%0=r0), out(%1=r1)
            2: br in(%0=r0)
          bb1 -> bb3:
            move %0=r0 -> %0=@0
            4: def out(%2=r0)
            move %1=r1 -> %1=@1
            move %0=@0 -> %0=r1
            6: use in(%0=r1), in(%2=r0)
            move %1=@1 -> %1=r1
          bb2 -> bb3:
            8: jmp
          bb3:
            10: ret in(%1=r1)
        ",
        );
    }

    #[test]
    fn phi_swap() {
        // The back edge supplies the header's phis with each other's values.
        alloc_and_test(
            &test_catalog(2, 0),
            Strategy::Greedy,
            "
          bb0 -> bb1(%0, %1):
            def out(%0: i64), out(%1: i64)
          bb1(%2: i64, %3: i64) -> bb2, bb3:
            br in(%2), in(%3)
          bb2 -> bb1(%3, %2):
            jmp
          bb3:
            ret
        ",
            "
          bb0 -> bb1(%0=r0, %1=r1):
            0: def out(%0=r0), out(%1=r1)
          bb1(%2=r0, %3=r1) -> bb2, bb3:
            2: br in(%2=r0), in(%3=r1)
          bb2 -> bb1(%3=r1, %2=r0):
            4: jmp
            move %3=r1 -> %3=@0
            move %2=r0 -> %3=r1
            move %3=@0 -> %2=r0
          bb3:
            6: ret
        ",
        );
    }

    #[test]
    fn critical_edge() {
        // bb0 -> bb2 leaves a block with two successors for a block with two predecessors, and
        // the phi needs %1 moved from r1 to r2 on it.
        let e = allocate_str(
            &test_catalog(3, 0),
            Strategy::Greedy,
            "
          bb0 -> bb1, bb2(%1):
            def out(%0: i64), out(%1: i64)
            br in(%0)
          bb1 -> bb2(5):
            jmp
          bb2(%2: i64):
            ret in(%0), in(%1), in(%2)
        ",
        )
        .unwrap_err();
        match e {
            AllocError::InternalError(msg) => {
                assert_eq!(msg, "Critical edge bb0 -> bb2 needs moves")
            }
            e => panic!("{e:?}"),
        }
    }
}
