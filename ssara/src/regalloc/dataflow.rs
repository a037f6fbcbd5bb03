//! Liveness analysis.
//!
//! Blocks are visited once, in reverse order, scanning instructions backwards. Successors which
//! have not yet been visited (i.e. those reached along loop back edges) contribute nothing to a
//! block's live-out set; this is corrected when the loop's header is reached, at which point
//! everything live into the header is made live throughout the loop. This relies on the block
//! order placing a dominator before the blocks it dominates.

use crate::{
    lir::{BlockIdx, Lir, OpId, Role, Value, VarIdx},
    regalloc::AllocError,
    target::{RegIdx, RegisterCatalog},
};
use index_vec::{IndexVec, index_vec};
use smallvec::SmallVec;
use std::fmt::Write;
use vob::Vob;

/// The values whose live range ends at a program point.
#[derive(Clone, Debug, Default)]
pub(crate) struct Kills {
    pub(crate) vars: SmallVec<[VarIdx; 2]>,
    /// Fixed registers.
    pub(crate) regs: SmallVec<[RegIdx; 1]>,
}

#[derive(Debug)]
pub(crate) struct Dataflow {
    /// For each block, the variables live on entry (excluding the block's phi outputs).
    live_in: IndexVec<BlockIdx, Vob>,
    /// Indexed by [OpId::index].
    kills: Vec<Kills>,
    defs: IndexVec<VarIdx, Option<OpId>>,
}

impl Dataflow {
    /// Number the instructions of `lir` and compute its liveness.
    pub(crate) fn analyse(lir: &mut Lir, cat: &RegisterCatalog) -> Result<Self, AllocError> {
        for (bidx, blk) in lir.blocks.iter_enumerated() {
            if let Some(dom) = blk.dom
                && dom >= bidx
            {
                return Err(AllocError::InternalError(format!(
                    "bb{} dominates bb{} but does not precede it",
                    dom.index(),
                    bidx.index()
                )));
            }
        }

        let mut next_id = 0;
        for blk in lir.blocks.iter_mut() {
            for inst in blk.insts.iter_mut() {
                inst.id = OpId::new(next_id);
                next_id += 2;
            }
        }

        let nvars = lir.num_vars();
        let mut df = Dataflow {
            live_in: index_vec![Vob::from_elem(false, nvars); lir.blocks.len()],
            kills: vec![Kills::default(); usize::try_from(next_id).unwrap()],
            defs: index_vec![None; nvars],
        };

        let mut processed = Vob::from_elem(false, lir.blocks.len());
        for bidx in lir.blocks.indices().rev() {
            let blk = &lir.blocks[bidx];
            let mut live = Vob::from_elem(false, nvars);
            for succ in &blk.succs {
                if processed[succ.index()] {
                    live.or(&df.live_in[*succ]);
                }
            }
            let end = blk.last_id().end();
            for succ in &blk.succs {
                if let Some(ins) = lir.blocks[*succ]
                    .phis
                    .as_ref()
                    .and_then(|x| x.inputs_from(bidx))
                {
                    for op in ins {
                        if let Value::Var(v) = op.value
                            && !live[v.index()]
                        {
                            live.set(v.index(), true);
                            df.kills[end.index()].vars.push(v);
                        }
                    }
                }
            }

            let mut reg_live = Vob::from_elem(false, cat.len());
            for inst in blk.insts.iter().rev() {
                let id = inst.id;
                for op in inst.operands.iter() {
                    if !matches!(op.role, Role::Output | Role::Temp) {
                        continue;
                    }
                    match op.value {
                        Value::Var(v) => {
                            df.define(v, id)?;
                            if live[v.index()] {
                                live.set(v.index(), false);
                            } else {
                                df.kills[id.end().index()].vars.push(v);
                            }
                        }
                        Value::Reg(reg) => {
                            if reg_live[reg.index()] {
                                reg_live.set(reg.index(), false);
                            } else {
                                df.kills[id.end().index()].regs.push(reg);
                            }
                        }
                        Value::Const(_) | Value::Stack(_) => (),
                    }
                }
                for (roles, kill_at) in [
                    (&[Role::Alive, Role::State][..], id.end()),
                    (&[Role::Input][..], id),
                ] {
                    for op in inst.operands.iter() {
                        if !roles.contains(&op.role) {
                            continue;
                        }
                        match op.value {
                            Value::Var(v) => {
                                if !live[v.index()] {
                                    live.set(v.index(), true);
                                    df.kills[kill_at.index()].vars.push(v);
                                }
                            }
                            Value::Reg(reg) => {
                                if !reg_live[reg.index()] {
                                    reg_live.set(reg.index(), true);
                                    df.kills[kill_at.index()].regs.push(reg);
                                }
                            }
                            Value::Const(_) | Value::Stack(_) => (),
                        }
                    }
                }
            }

            if let Some(phis) = &blk.phis {
                let first = blk.first_id();
                for op in &phis.outputs {
                    if let Value::Var(v) = op.value {
                        df.define(v, first)?;
                        if live[v.index()] {
                            live.set(v.index(), false);
                        } else {
                            df.kills[first.end().index()].vars.push(v);
                        }
                    }
                }
            }

            if let Some(reg) = reg_live.iter_set_bits(..).next() {
                return Err(AllocError::InternalError(format!(
                    "Fixed register {} is live into bb{}",
                    cat.name(RegIdx::from_usize(reg)),
                    bidx.index()
                )));
            }
            df.live_in[bidx] = live;
            processed.set(bidx.index(), true);

            if let Some(lidx) = blk.header_of {
                let header_live = df.live_in[bidx].clone();
                for lbidx in &lir.loops[lidx].blocks {
                    df.live_in[*lbidx].or(&header_live);
                    let lblk = &lir.blocks[*lbidx];
                    for id in lblk.first_id().index()..=lblk.last_id().end().index() {
                        df.kills[id].vars.retain(|v| !header_live[v.index()]);
                    }
                }
            }
        }

        let entry = BlockIdx::from_usize(0);
        if let Some(v) = df.live_in[entry].iter_set_bits(..).next() {
            return Err(AllocError::InternalError(format!(
                "%{v} is used before it is defined"
            )));
        }

        Ok(df)
    }

    fn define(&mut self, var: VarIdx, id: OpId) -> Result<(), AllocError> {
        if let Some(prev) = self.defs[var] {
            return Err(AllocError::InternalError(format!(
                "%{} is defined at both {prev} and {id}",
                var.index()
            )));
        }
        self.defs[var] = Some(id);
        Ok(())
    }

    /// The variables live on entry to `bidx`. Phi outputs of `bidx` are not included.
    pub(crate) fn live_in(&self, bidx: BlockIdx) -> &Vob {
        &self.live_in[bidx]
    }

    /// The values whose live range ends at `id`.
    pub(crate) fn kills(&self, id: OpId) -> &Kills {
        &self.kills[id.index()]
    }

    /// Where is `var` defined?
    pub(crate) fn def(&self, var: VarIdx) -> Option<OpId> {
        self.defs[var]
    }

    /// The variables live on exit from `bidx`: everything live into a successor, plus the values
    /// supplied to successors' phis.
    pub(crate) fn live_out(&self, lir: &Lir, bidx: BlockIdx) -> Vob {
        let mut live = Vob::from_elem(false, lir.num_vars());
        for succ in &lir.blocks[bidx].succs {
            live.or(&self.live_in[*succ]);
            if let Some(ins) = lir.blocks[*succ]
                .phis
                .as_ref()
                .and_then(|x| x.inputs_from(bidx))
            {
                for v in ins.iter().filter_map(|x| x.var()) {
                    live.set(v.index(), true);
                }
            }
        }
        live
    }

    /// A human readable summary of the analysis, for `SSARA_LOG_IR`.
    pub(crate) fn dump(&self) -> String {
        let mut s = String::new();
        for (bidx, live) in self.live_in.iter_enumerated() {
            let vars = live
                .iter_set_bits(..)
                .map(|x| format!("%{x}"))
                .collect::<Vec<_>>();
            writeln!(s, "bb{} live-in: {}", bidx.index(), vars.join(" ")).ok();
        }
        for (i, k) in self.kills.iter().enumerate() {
            if k.vars.is_empty() && k.regs.is_empty() {
                continue;
            }
            let vars = k
                .vars
                .iter()
                .map(|x| format!("%{}", x.index()))
                .collect::<Vec<_>>();
            writeln!(s, "kill {i}: {}", vars.join(" ")).ok();
        }
        s
    }
}
