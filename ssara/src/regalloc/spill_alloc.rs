//! The conservative spill allocator.
//!
//! Every variable lives in its own "home" stack slot for its whole live range. Operands which
//! accept a stack slot use the home slot directly; all others get a register for the duration of
//! one instruction only, loaded from (or, for outputs, stored back to) the home slot. This makes
//! far more moves than [super::greedy] but succeeds whenever each instruction, considered in
//! isolation, can be given enough registers.

use super::{
    AllocCtx, AllocError, AllocMaps, BlockMaps, LocationMap, RState, RStates, dataflow::Dataflow,
    moves::MoveGroup,
};
use crate::{
    frame::{FrameMap, SlotIdx},
    lir::{BlockIdx, Kind, Lir, Location, Move, OpId, Placement, Role, Value, VarIdx},
    target::{RegClass, RegIdx},
};
use index_vec::{IndexVec, index_vec};
use smallvec::SmallVec;

pub(crate) fn allocate(
    lir: &mut Lir,
    cx: &AllocCtx,
    df: &Dataflow,
    frame: &mut FrameMap,
) -> Result<AllocMaps, AllocError> {
    let mut sa = SpillAll {
        cx,
        df,
        kinds: lir.vars.clone(),
        home: index_vec![None; lir.num_vars()],
        in_state: RStates::new(cx.cat.len()),
        out_state: RStates::new(cx.cat.len()),
        cur: LocationMap::new(lir.num_vars()),
    };
    let mut maps = IndexVec::with_capacity(lir.blocks.len());
    for bidx in lir.blocks.indices() {
        maps.push(sa.alloc_block(lir, frame, bidx)?);
    }
    Ok(maps)
}

struct SpillAll<'a> {
    cx: &'a AllocCtx<'a>,
    df: &'a Dataflow,
    kinds: IndexVec<VarIdx, Kind>,
    home: IndexVec<VarIdx, Option<SlotIdx>>,
    /// Register states only describe the instruction being allocated: between instructions, the
    /// only registers that aren't free are blocked fixed registers.
    in_state: RStates,
    out_state: RStates,
    cur: LocationMap,
}

impl SpillAll<'_> {
    fn alloc_block(
        &mut self,
        lir: &mut Lir,
        frame: &mut FrameMap,
        bidx: BlockIdx,
    ) -> Result<BlockMaps, AllocError> {
        self.cur = LocationMap::new(self.kinds.len());
        for var in self.df.live_in(bidx).iter_set_bits(..).map(VarIdx::from_usize) {
            let slot = self.home[var].ok_or_else(|| {
                AllocError::InternalError(format!(
                    "%{} is live into bb{} before it is defined",
                    var.index(),
                    bidx.index()
                ))
            })?;
            self.cur.set(var, Placement::Stack(slot));
        }
        let begin = self.cur.clone();
        self.out_state = RStates::new(self.cx.cat.len());

        if let Some(phis) = lir.blocks[bidx].phis.as_mut() {
            for op in phis.outputs.iter_mut() {
                if let Some(var) = op.var() {
                    let place = Placement::Stack(self.home_slot(frame, var));
                    self.cur.set(var, place);
                    op.loc = Some(place);
                }
            }
        }

        let ninsts = lir.blocks[bidx].insts.len();
        for pos in 0..ninsts {
            self.alloc_inst(lir, frame, bidx, pos, pos + 1 == ninsts)?;
        }
        Ok(BlockMaps {
            begin,
            end: self.cur.clone(),
        })
    }

    fn alloc_inst(
        &mut self,
        lir: &mut Lir,
        frame: &mut FrameMap,
        bidx: BlockIdx,
        pos: usize,
        is_last: bool,
    ) -> Result<(), AllocError> {
        let df = self.df;
        let inst = &lir.blocks[bidx].insts[pos];
        let id = inst.id;
        let is_call = inst.is_call;
        let ops = inst.operands.clone();
        let mut locs = ops
            .iter()
            .map(|x| x.fixed_place())
            .collect::<SmallVec<[_; 4]>>();
        self.in_state = self.out_state.clone();
        for reg in &df.kills(id).regs {
            self.out_state.unblock(*reg);
        }
        for op in &ops {
            if let Value::Reg(reg) = op.value {
                match op.role {
                    Role::Output => self.out_state.set(reg, RState::Blocked),
                    Role::Temp => {
                        self.in_state.set(reg, RState::Blocked);
                        self.out_state.set(reg, RState::Blocked);
                    }
                    Role::Input | Role::Alive | Role::State => (),
                }
            }
        }

        let mut loads = MoveGroup::new();
        for role in [Role::Alive, Role::Input] {
            for (i, op) in ops.iter().enumerate() {
                if op.role != role {
                    continue;
                }
                let Some(var) = op.var() else { continue };
                let home = self.cur.place(var).ok_or_else(|| {
                    AllocError::InternalError(format!("%{} has no location at {id}", var.index()))
                })?;
                if op.flags.allows_stack() {
                    locs[i] = Some(home);
                    continue;
                }
                // A variable used twice by one instruction only needs loading once.
                if let Some(reg) = self.in_state.find(var) {
                    locs[i] = Some(Placement::Reg(reg));
                    continue;
                }
                let alive = role == Role::Alive;
                let reg =
                    self.free_reg(self.kinds[var].reg_class(), alive, alive && is_call, id)?;
                self.in_state.set(reg, RState::Var(var));
                if alive {
                    self.out_state.set(reg, RState::Var(var));
                }
                loads.push(Move::new(
                    Location::new(var, home),
                    Location::new(var, Placement::Reg(reg)),
                ));
                locs[i] = Some(Placement::Reg(reg));
            }
        }

        for var in &df.kills(id).vars {
            self.cur.clear(*var);
        }

        let mut stores = Vec::new();
        for role in [Role::Temp, Role::Output] {
            for (i, op) in ops.iter().enumerate() {
                if op.role != role {
                    continue;
                }
                let Some(var) = op.var() else { continue };
                let class = self.kinds[var].reg_class();
                if role == Role::Temp {
                    let reg = self.free_reg(class, true, false, id)?;
                    self.in_state.set(reg, RState::Var(var));
                    self.out_state.set(reg, RState::Var(var));
                    locs[i] = Some(Placement::Reg(reg));
                    continue;
                }
                let home = Placement::Stack(self.home_slot(frame, var));
                self.cur.set(var, home);
                if op.flags.allows_stack() {
                    locs[i] = Some(home);
                } else {
                    let reg = self.free_out_reg(class, id)?;
                    self.out_state.set(reg, RState::Var(var));
                    stores.push(Move::new(
                        Location::new(var, Placement::Reg(reg)),
                        Location::new(var, home),
                    ));
                    locs[i] = Some(Placement::Reg(reg));
                }
            }
        }

        for (i, op) in ops.iter().enumerate() {
            if op.role == Role::State
                && let Some(var) = op.var()
            {
                locs[i] = Some(self.cur.place(var).ok_or_else(|| {
                    AllocError::InternalError(format!("%{} has no location at {id}", var.index()))
                })?);
            }
        }

        let loads = loads.sequentialize(frame);
        let inst = &mut lir.blocks[bidx].insts[pos];
        for (op, loc) in inst.operands.iter_mut().zip(locs) {
            op.loc = loc;
        }
        inst.moves_before.extend(loads);
        inst.moves_after.extend(stores);

        if is_last {
            for succ in lir.blocks[bidx].succs.clone() {
                let Some(ins) = lir.blocks[succ]
                    .phis
                    .as_mut()
                    .and_then(|x| x.inputs_from_mut(bidx))
                else {
                    continue;
                };
                for op in ins.iter_mut() {
                    if let Some(var) = op.var() {
                        op.loc = self.cur.place(var);
                    }
                }
            }
        }

        let end = df.kills(id.end());
        for var in &end.vars {
            self.cur.clear(*var);
        }
        for reg in &end.regs {
            self.out_state.unblock(*reg);
        }
        self.out_state.clear_vars();
        Ok(())
    }

    fn home_slot(&mut self, frame: &mut FrameMap, var: VarIdx) -> SlotIdx {
        let kind = self.kinds[var];
        *self.home[var].get_or_insert_with(|| frame.alloc_spill_slot(kind))
    }

    /// Find a register of class `class` free as the instruction starts (and, if `need_out`, also
    /// as it ends). A register that must survive a call must be callee-saved.
    fn free_reg(
        &self,
        class: RegClass,
        need_out: bool,
        survive_call: bool,
        id: OpId,
    ) -> Result<RegIdx, AllocError> {
        let cat = self.cx.cat;
        cat.allocatable(class)
            .find(|x| {
                self.in_state.is_free(*x)
                    && (!need_out || self.out_state.is_free(*x))
                    && !(survive_call && cat.is_caller_saved(*x))
            })
            .ok_or_else(|| {
                AllocError::NoFulfillableConstraint(format!(
                    "No {class} register available at {id}"
                ))
            })
    }

    fn free_out_reg(&self, class: RegClass, id: OpId) -> Result<RegIdx, AllocError> {
        self.cx
            .cat
            .allocatable(class)
            .find(|x| self.out_state.is_free(*x))
            .ok_or_else(|| {
                AllocError::NoFulfillableConstraint(format!(
                    "No {class} register available for an output at {id}"
                ))
            })
    }
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
    fn everything_goes_home() {
        alloc_and_test(
            &test_catalog(2, 0),
            Strategy::SpillAll,
            "
          bb0:
            def out(%0: i64), out(%1: i64)
            add in(%0), in(%1), out(%2: i64)
            ret in(%2)
        ",
            "
          bb0:
            0: def out(%0=r0), out(%1=r1)
            move %0=r0 -> %0=@0
            move %1=r1 -> %1=@1
            move %0=@0 -> %0=r0
            move %1=@1 -> %1=r1
            2: add in(%0=r0), in(%1=r1), out(%2=r0)
            move %2=r0 -> %2=@2
            move %2=@2 -> %2=r0
            4: ret in(%2=r0)
        ",
        );
    }

    #[test]
    fn stack_operands_and_state() {
        alloc_and_test(
            &test_catalog(1, 0),
            Strategy::SpillAll,
            "
          bb0:
            def out(%0: ref, stack)
            call [call, safepoint] in(%0, stack), state(%0)
            ret in(%0)
        ",
            "
          bb0:
            0: def out(%0=@0, stack)
            2: call [call, safepoint(@0)] in(%0=@0, stack), state(%0=@0)
            move %0=@0 -> %0=r0
            4: ret in(%0=r0)
        ",
        );
    }

    #[test]
    fn alive_across_call() {
        alloc_and_test(
            &test_catalog(2, 0),
            Strategy::SpillAll,
            "
          bb0:
            def out(%0: i64)
            call [call] alive(%0), out(%1: i64)
            ret in(%1)
        ",
            "
          bb0:
            0: def out(%0=r0)
            move %0=r0 -> %0=@0
            move %0=@0 -> %0=r1
            2: call [call] alive(%0=r1), out(%1=r0)
            move %1=r0 -> %1=@1
            move %1=@1 -> %1=r0
            4: ret in(%1=r0)
        ",
        );

        // With no callee-saved register, nothing can survive the call.
        let e = allocate_str(
            &test_catalog(1, 0),
            Strategy::SpillAll,
            "
          bb0:
            def out(%0: i64)
            call [call] alive(%0)
            ret in(%0)
        ",
        )
        .unwrap_err();
        assert!(matches!(e, AllocError::NoFulfillableConstraint(_)));
    }

    #[test]
    fn phis_and_constants() {
        alloc_and_test(
            &test_catalog(1, 0),
            Strategy::SpillAll,
            "
          bb0 -> bb1, bb2:
            def out(%0: i64)
            br in(%0)
          bb1 -> bb3(%0):
            jmp
          bb2 -> bb3(9):
            jmp
          bb3(%1: i64):
            ret in(%1)
        ",
            "
          bb0 -> bb1, bb2:
            0: def out(%0=r0)
            move %0=r0 -> %0=@0
            move %0=@0 -> %0=r0
            2: br in(%0=r0)
          bb1 -> bb3(%0=@0):
            4: jmp
            move %0=@0 -> %1=@1
          bb2 -> bb3(9):
            6: jmp
            move 9 -> %1=@1
          bb3(%1=@1):
            move %1=@1 -> %1=r0
            8: ret in(%1=r0)
        ",
        );
    }
}
