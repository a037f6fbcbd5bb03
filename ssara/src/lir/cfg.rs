//! Dominators and loops.

use super::{BlockIdx, Lir, Loop, LoopIdx};
use crate::regalloc::AllocError;
use index_vec::{IndexVec, index_vec};
use vob::Vob;

/// Compute the immediate dominator of every block with the iterative algorithm of Cooper, Harvey,
/// and Kennedy. The entry block is the first block; every other block must be reachable from it.
pub(super) fn compute_dominators(lir: &mut Lir) -> Result<(), AllocError> {
    let nblocks = lir.blocks.len();
    let entry = BlockIdx::from_usize(0);

    // Reverse postorder, computed with an explicit stack so that deep CFGs can't overflow.
    let mut postorder = Vec::with_capacity(nblocks);
    let mut visited = Vob::from_elem(false, nblocks);
    let mut stack = vec![(entry, 0)];
    visited.set(entry.index(), true);
    while let Some((bidx, i)) = stack.pop() {
        if let Some(succ) = lir.blocks[bidx].succs.get(i).copied() {
            stack.push((bidx, i + 1));
            if !visited[succ.index()] {
                visited.set(succ.index(), true);
                stack.push((succ, 0));
            }
        } else {
            postorder.push(bidx);
        }
    }
    if postorder.len() != nblocks {
        let bidx = (0..nblocks).find(|x| !visited[*x]).unwrap();
        return Err(AllocError::InternalError(format!(
            "bb{bidx} is unreachable from the entry block"
        )));
    }
    let mut rpo_num: IndexVec<BlockIdx, usize> = index_vec![0; nblocks];
    for (i, bidx) in postorder.iter().rev().enumerate() {
        rpo_num[*bidx] = i;
    }

    let mut doms: IndexVec<BlockIdx, Option<BlockIdx>> = index_vec![None; nblocks];
    doms[entry] = Some(entry);
    let mut changed = true;
    while changed {
        changed = false;
        for bidx in postorder.iter().rev().skip(1) {
            let mut new_idom = None;
            for pred in &lir.blocks[*bidx].preds {
                if doms[*pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => *pred,
                    Some(cur) => intersect(&doms, &rpo_num, *pred, cur),
                });
            }
            if new_idom.is_some() && doms[*bidx] != new_idom {
                doms[*bidx] = new_idom;
                changed = true;
            }
        }
    }

    for (bidx, blk) in lir.blocks.iter_mut_enumerated() {
        blk.dom = if bidx == entry { None } else { doms[bidx] };
    }
    Ok(())
}

fn intersect(
    doms: &IndexVec<BlockIdx, Option<BlockIdx>>,
    rpo_num: &IndexVec<BlockIdx, usize>,
    mut b1: BlockIdx,
    mut b2: BlockIdx,
) -> BlockIdx {
    while b1 != b2 {
        while rpo_num[b1] > rpo_num[b2] {
            b1 = doms[b1].unwrap();
        }
        while rpo_num[b2] > rpo_num[b1] {
            b2 = doms[b2].unwrap();
        }
    }
    b1
}

/// Does `a` dominate `b`?
pub(crate) fn dominates(lir: &Lir, a: BlockIdx, b: BlockIdx) -> bool {
    let mut cur = Some(b);
    while let Some(bidx) = cur {
        if bidx == a {
            return true;
        }
        cur = lir.blocks[bidx].dom;
    }
    false
}

/// Find the natural loops of `lir`. Back edges to the same header form a single loop. Must be
/// called after [compute_dominators].
pub(super) fn compute_loops(lir: &mut Lir) {
    let nblocks = lir.blocks.len();
    let mut loops: IndexVec<LoopIdx, Loop> = IndexVec::new();
    for header in lir.blocks.indices() {
        let mut body = Vob::from_elem(false, nblocks);
        let mut work = Vec::new();
        for pred in &lir.blocks[header].preds {
            if dominates(lir, header, *pred) {
                work.push(*pred);
            }
        }
        if work.is_empty() {
            continue;
        }
        body.set(header.index(), true);
        while let Some(bidx) = work.pop() {
            if body[bidx.index()] {
                continue;
            }
            body.set(bidx.index(), true);
            work.extend(lir.blocks[bidx].preds.iter().copied());
        }
        loops.push(Loop {
            header,
            blocks: body.iter_set_bits(..).map(BlockIdx::from_usize).collect(),
        });
    }

    for (lidx, lp) in loops.iter_enumerated() {
        lir.blocks[lp.header].header_of = Some(lidx);
        for bidx in &lp.blocks {
            lir.blocks[*bidx].loops.push(lidx);
        }
    }
    for blk in lir.blocks.iter_mut() {
        // Nested loops have strictly smaller bodies than the loops containing them.
        blk.loops
            .sort_by_key(|lidx| std::cmp::Reverse(loops[*lidx].blocks.len()));
        blk.loop_depth = u32::try_from(blk.loops.len()).unwrap();
        blk.loop_idx = blk.loops.last().copied();
    }
    lir.loops = loops;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{Inst, Kind, LirBuilder, Operand, Value};

    /// ```text
    /// bb0 -> bb1 -> bb2 -> bb3 -> bb4
    ///         ^      ^------'|
    ///         '--------------'
    /// ```
    #[test]
    fn nested_loops() {
        let mut lb = LirBuilder::new();
        let v = lb.new_var(Kind::I64);
        let bbs = (0..5).map(|_| lb.new_block()).collect::<Vec<_>>();
        lb.push_inst(bbs[0], Inst::new("def").with_operand(Operand::output(Value::Var(v))));
        for b in &bbs[1..] {
            lb.push_inst(*b, Inst::new("nop"));
        }
        lb.add_edge(bbs[0], bbs[1], vec![]);
        lb.add_edge(bbs[1], bbs[2], vec![]);
        lb.add_edge(bbs[2], bbs[3], vec![]);
        lb.add_edge(bbs[3], bbs[2], vec![]);
        lb.add_edge(bbs[3], bbs[1], vec![]);
        lb.add_edge(bbs[3], bbs[4], vec![]);
        let lir = lb.build().unwrap();

        assert_eq!(lir.loops.len(), 2);
        let outer = lir.blocks[bbs[1]].header_of.unwrap();
        let inner = lir.blocks[bbs[2]].header_of.unwrap();
        assert_eq!(lir.loops[outer].blocks, vec![bbs[1], bbs[2], bbs[3]]);
        assert_eq!(lir.loops[inner].blocks, vec![bbs[2], bbs[3]]);
        assert_eq!(lir.blocks[bbs[3]].loop_depth, 2);
        assert_eq!(lir.blocks[bbs[3]].loop_idx, Some(inner));
        assert_eq!(lir.blocks[bbs[3]].loops.as_slice(), &[outer, inner]);
        assert_eq!(lir.blocks[bbs[1]].loop_idx, Some(outer));
        assert_eq!(lir.blocks[bbs[4]].loop_depth, 0);
        assert_eq!(lir.blocks[bbs[4]].dom, Some(bbs[3]));
        assert_eq!(lir.blocks[bbs[2]].dom, Some(bbs[1]));
        assert!(dominates(&lir, bbs[1], bbs[4]));
        assert!(!dominates(&lir, bbs[4], bbs[1]));
    }

    #[test]
    fn unreachable() {
        let mut lb = LirBuilder::new();
        let b0 = lb.new_block();
        let b1 = lb.new_block();
        lb.push_inst(b0, Inst::new("ret"));
        lb.push_inst(b1, Inst::new("ret"));
        assert!(matches!(lb.build(), Err(AllocError::InternalError(_))));
    }
}
