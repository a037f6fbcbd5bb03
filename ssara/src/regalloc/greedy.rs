//! The greedy allocator.
//!
//! Blocks are allocated in order, and within a block instructions are allocated in order. A
//! block starts with the locations its dominator ended with (restricted to the variables live
//! into the block); the [super::resolve] pass later patches up the edges where that assumption
//! does not hold.
//!
//! Each instruction is viewed through two register states: `in_state` describes the registers as
//! the instruction starts (when its inputs are read), `out_state` as it ends (when its outputs have
//! been written). A value which dies as the instruction starts occupies its register in
//! `in_state` only, so that an output can reuse it; a temporary occupies its register in both.
//!
//! Every variable has at most one "canonical" stack slot, assigned the first time it has to be
//! spilled: all subsequent spills of the variable reuse that slot. Since a variable's value never
//! changes, once the slot is known to hold the variable within a block (because the block started
//! with it there, or stored it there), spilling the variable again needs no further store. A
//! block's beginning state records only one location per variable, so a store made by an earlier
//! block is forgotten once the variable is back in a register.

use super::{
    AllocCtx, AllocError, AllocMaps, BlockMaps, LocationMap, RState, RStates, dataflow::Dataflow,
    moves::MoveGroup,
};
use crate::{
    frame::{FrameMap, SlotIdx},
    lir::{
        BlockIdx, Kind, Lir, Location, Move, OpId, OperandFlags, Placement, Role, Value, VarIdx,
    },
    log::Verbosity,
    target::{RegClass, RegIdx},
};
use index_vec::{IndexVec, index_vec};
use smallvec::SmallVec;
use vob::Vob;

/// Which register states must a register be free in to be allocated?
#[derive(Clone, Copy, Debug, PartialEq)]
enum Need {
    Out,
    Both,
}

pub(crate) fn allocate(
    lir: &mut Lir,
    cx: &AllocCtx,
    df: &Dataflow,
    frame: &mut FrameMap,
) -> Result<AllocMaps, AllocError> {
    let nvars = lir.num_vars();
    let nblocks = lir.blocks.len();
    let mut ga = Greedy {
        cx,
        df,
        kinds: lir.vars.clone(),
        in_state: RStates::new(cx.cat.len()),
        out_state: RStates::new(cx.cat.len()),
        cur: LocationMap::new(nvars),
        canonical: index_vec![None; nvars],
        stored: Vob::from_elem(false, nvars),
        last_use: index_vec![None; nvars],
        begin_maps: index_vec![None; nblocks],
        end_maps: index_vec![None; nblocks],
        pending: MoveGroup::new(),
    };
    for bidx in lir.blocks.indices() {
        ga.alloc_block(lir, frame, bidx)?;
    }
    ga.begin_maps
        .into_iter()
        .zip(ga.end_maps)
        .map(|(begin, end)| match (begin, end) {
            (Some(begin), Some(end)) => Ok(BlockMaps { begin, end }),
            _ => Err(AllocError::InternalError("Unallocated block".into())),
        })
        .collect()
}

struct Greedy<'a> {
    cx: &'a AllocCtx<'a>,
    df: &'a Dataflow,
    kinds: IndexVec<VarIdx, Kind>,
    in_state: RStates,
    out_state: RStates,
    /// The current location of every live variable, as of the end of the instruction being
    /// allocated.
    cur: LocationMap,
    canonical: IndexVec<VarIdx, Option<SlotIdx>>,
    /// The variables whose canonical slot has been written in the current block.
    stored: Vob,
    /// For each variable, the id of the last instruction which used it so far. Variables used by
    /// the current instruction are never chosen for spilling.
    last_use: IndexVec<VarIdx, Option<OpId>>,
    begin_maps: IndexVec<BlockIdx, Option<LocationMap>>,
    end_maps: IndexVec<BlockIdx, Option<LocationMap>>,
    /// The moves needed before the current instruction.
    pending: MoveGroup,
}

impl Greedy<'_> {
    fn alloc_block(
        &mut self,
        lir: &mut Lir,
        frame: &mut FrameMap,
        bidx: BlockIdx,
    ) -> Result<(), AllocError> {
        let mut begin = match lir.blocks[bidx].dom {
            None => LocationMap::new(self.kinds.len()),
            Some(dom) => self.end_maps[dom].clone().ok_or_else(|| {
                AllocError::InternalError(format!(
                    "bb{} is allocated before its dominator bb{}",
                    bidx.index(),
                    dom.index()
                ))
            })?,
        };
        let live_in = self.df.live_in(bidx);
        for var in self.kinds.indices() {
            if !live_in[var.index()] {
                begin.clear(var);
            } else if begin.place(var).is_none() {
                return Err(AllocError::InternalError(format!(
                    "%{} is live into bb{} but has no location at the end of its dominator",
                    var.index(),
                    bidx.index()
                )));
            }
        }
        self.begin_maps[bidx] = Some(begin.clone());
        self.stored = Vob::from_elem(false, self.kinds.len());

        self.out_state = RStates::new(self.cx.cat.len());
        for loc in begin.iter() {
            match loc.place {
                Placement::Reg(reg) => self.out_state.set(reg, RState::Var(loc.var)),
                Placement::Stack(slot) => {
                    if self.canonical[loc.var] == Some(slot) {
                        self.stored.set(loc.var.index(), true);
                    }
                }
            }
        }
        self.in_state = self.out_state.clone();
        self.cur = begin;

        // Phis are defined as the block starts. They take a free register if there is one, but
        // never cause a spill.
        if let Some(phis) = lir.blocks[bidx].phis.as_mut() {
            for op in phis.outputs.iter_mut() {
                let Some(var) = op.var() else { continue };
                let place = match self.free_reg(self.kinds[var].reg_class(), Need::Both, false) {
                    Some(reg) => {
                        self.out_state.set(reg, RState::Var(var));
                        self.in_state.set(reg, RState::Var(var));
                        Placement::Reg(reg)
                    }
                    None => {
                        self.stored.set(var.index(), true);
                        Placement::Stack(self.canonical_slot(frame, var))
                    }
                };
                self.cur.set(var, place);
                op.loc = Some(place);
            }
        }

        let ninsts = lir.blocks[bidx].insts.len();
        for pos in 0..ninsts {
            self.alloc_inst(lir, frame, bidx, pos, pos + 1 == ninsts)?;
        }
        self.end_maps[bidx] = Some(self.cur.clone());
        Ok(())
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

        // Fixed registers whose last use is as this instruction starts can be reused by its
        // outputs.
        for reg in &df.kills(id).regs {
            self.out_state.unblock(*reg);
        }
        for op in &ops {
            if let Value::Reg(reg) = op.value {
                match op.role {
                    Role::Output => self.block_reg(frame, reg, Need::Out, id),
                    Role::Temp => self.block_reg(frame, reg, Need::Both, id),
                    Role::Input | Role::Alive | Role::State => (),
                }
            }
        }

        for op in &ops {
            if matches!(op.role, Role::Input | Role::Alive)
                && let Some(var) = op.var()
            {
                self.last_use[var] = Some(id);
            }
        }
        for role in [Role::Alive, Role::Input] {
            for (i, op) in ops.iter().enumerate() {
                if op.role == role
                    && let Some(var) = op.var()
                {
                    locs[i] =
                        Some(self.use_var(frame, var, op.flags, role == Role::Alive, id, is_call)?);
                }
            }
        }

        for var in &df.kills(id).vars {
            self.kill(*var);
        }

        if is_call {
            self.spill_caller_saved(frame, id);
        }

        for role in [Role::Temp, Role::Output] {
            for (i, op) in ops.iter().enumerate() {
                if op.role == role
                    && let Some(var) = op.var()
                {
                    locs[i] = Some(self.define(frame, var, role, op.flags, id)?);
                }
            }
        }

        // Values that must survive the instruction in a register may have been evicted by a call.
        for (i, op) in ops.iter().enumerate() {
            if op.role == Role::Alive
                && let Some(var) = op.var()
                && let Some(Placement::Reg(reg)) = locs[i]
                && self.out_state.get(reg) != RState::Var(var)
            {
                locs[i] = Some(self.fixup_alive(frame, var, reg, op.flags, id, is_call)?);
            }
        }

        for (i, op) in ops.iter().enumerate() {
            if op.role == Role::State
                && let Some(var) = op.var()
            {
                locs[i] = Some(self.cur.place(var).ok_or_else(|| {
                    AllocError::InternalError(format!(
                        "%{} has no location at {id}",
                        var.index()
                    ))
                })?);
            }
        }

        let moves = std::mem::take(&mut self.pending).sequentialize(frame);
        let inst = &mut lir.blocks[bidx].insts[pos];
        for (op, loc) in inst.operands.iter_mut().zip(locs) {
            op.loc = loc;
        }
        inst.moves_before.extend(moves);

        if is_last {
            self.phi_inputs(lir, bidx, id)?;
        }

        let end = df.kills(id.end());
        for var in &end.vars {
            self.kill(*var);
        }
        for reg in &end.regs {
            self.out_state.unblock(*reg);
        }
        Ok(())
    }

    /// The values a block supplies to its successors' phis are used, from wherever they currently
    /// are, as the block's last instruction ends.
    fn phi_inputs(&mut self, lir: &mut Lir, bidx: BlockIdx, id: OpId) -> Result<(), AllocError> {
        let succs = lir.blocks[bidx].succs.clone();
        for succ in succs {
            let Some(phis) = lir.blocks[succ].phis.as_mut() else {
                continue;
            };
            let ins = phis.inputs_from_mut(bidx).ok_or_else(|| {
                AllocError::InternalError(format!(
                    "bb{} supplies no values to bb{}'s phis",
                    bidx.index(),
                    succ.index()
                ))
            })?;
            for op in ins.iter_mut() {
                if let Some(var) = op.var() {
                    self.last_use[var] = Some(id);
                    op.loc = Some(self.cur.place(var).ok_or_else(|| {
                        AllocError::InternalError(format!(
                            "%{} has no location at the end of bb{}",
                            var.index(),
                            bidx.index()
                        ))
                    })?);
                }
            }
        }
        Ok(())
    }

    /// Reserve the fixed register `reg`, evicting any variable in it.
    fn block_reg(&mut self, frame: &mut FrameMap, reg: RegIdx, need: Need, id: OpId) {
        self.evict(frame, reg, need, id);
        self.out_state.set(reg, RState::Blocked);
        if need == Need::Both {
            self.in_state.set(reg, RState::Blocked);
        }
    }

    /// Make `reg` free in the states described by `need`, spilling any variable it holds.
    fn evict(&mut self, frame: &mut FrameMap, reg: RegIdx, need: Need, id: OpId) {
        if let RState::Var(var) = self.out_state.get(reg) {
            self.out_state.set(reg, RState::Free);
            // A value which dies as the instruction starts is still in the register for
            // `in_state`, and doesn't need to be anywhere afterwards.
            if !self.df.kills(id).vars.contains(&var) {
                self.spill(frame, var, reg, id);
            }
        }
        if need == Need::Both
            && let RState::Var(var) = self.in_state.get(reg)
        {
            self.in_state.set(reg, RState::Free);
            self.spill(frame, var, reg, id);
        }
    }

    /// If `var` is currently in `reg`, move it to its canonical stack slot. If the slot already
    /// holds `var`, no store is needed.
    fn spill(&mut self, frame: &mut FrameMap, var: VarIdx, reg: RegIdx, id: OpId) {
        if self.cur.place(var) == Some(Placement::Reg(reg)) {
            let slot = self.canonical_slot(frame, var);
            self.cur.set(var, Placement::Stack(slot));
            if self.stored[var.index()] {
                return;
            }
            self.pending.push_chained(Move::new(
                Location::new(var, Placement::Reg(reg)),
                Location::new(var, Placement::Stack(slot)),
            ));
            self.stored.set(var.index(), true);
            self.cx.log.log(
                Verbosity::AllocEvent,
                &format!(
                    "spill %{} from {} to @{} at {id}",
                    var.index(),
                    self.cx.cat.name(reg),
                    slot.index()
                ),
            );
        }
    }

    fn canonical_slot(&mut self, frame: &mut FrameMap, var: VarIdx) -> SlotIdx {
        let kind = self.kinds[var];
        *self.canonical[var].get_or_insert_with(|| frame.alloc_spill_slot(kind))
    }

    fn is_free(&self, reg: RegIdx, need: Need) -> bool {
        self.out_state.is_free(reg) && (need == Need::Out || self.in_state.is_free(reg))
    }

    /// Find a free register of class `class`, if there is one.
    fn free_reg(&self, class: RegClass, need: Need, prefer_callee_saved: bool) -> Option<RegIdx> {
        let cat = self.cx.cat;
        if prefer_callee_saved
            && let Some(reg) = cat
                .allocatable(class)
                .find(|x| !cat.is_caller_saved(*x) && self.is_free(*x, need))
        {
            return Some(reg);
        }
        cat.allocatable(class).find(|x| self.is_free(*x, need))
    }

    /// Find a register of class `class`, spilling if necessary. Only variables whose last use is
    /// strictly before `id` are spilled: those with a canonical stack slot are preferred, then
    /// those defined earliest.
    fn alloc_reg(
        &mut self,
        frame: &mut FrameMap,
        class: RegClass,
        need: Need,
        id: OpId,
        prefer_callee_saved: bool,
        only_callee_saved: bool,
    ) -> Result<RegIdx, AllocError> {
        let cat = self.cx.cat;
        if let Some(reg) = self.free_reg(class, need, prefer_callee_saved || only_callee_saved)
            && !(only_callee_saved && cat.is_caller_saved(reg))
        {
            return Ok(reg);
        }

        let mut best = None;
        for reg in cat.allocatable(class) {
            if only_callee_saved && cat.is_caller_saved(reg) {
                continue;
            }
            let mut states = vec![self.out_state.get(reg)];
            if need == Need::Both {
                states.push(self.in_state.get(reg));
            }
            let mut key = None;
            let mut ok = true;
            for rstate in states {
                match rstate {
                    RState::Free => (),
                    RState::Blocked => ok = false,
                    RState::Var(var) => {
                        if self.last_use[var].is_some_and(|x| x >= id) {
                            ok = false;
                        } else {
                            let k = (self.canonical[var].is_none(), self.df.def(var));
                            if key.is_none_or(|x| k < x) {
                                key = Some(k);
                            }
                        }
                    }
                }
            }
            if !ok {
                continue;
            }
            if let Some(key) = key
                && best.is_none_or(|(_, x)| key < x)
            {
                best = Some((reg, key));
            }
        }

        match best {
            Some((reg, _)) => {
                self.evict(frame, reg, need, id);
                Ok(reg)
            }
            None => Err(AllocError::NoFulfillableConstraint(format!(
                "No {class} register available at {id}"
            ))),
        }
    }

    /// Resolve an input (or, if `alive`, an alive) use of `var`.
    fn use_var(
        &mut self,
        frame: &mut FrameMap,
        var: VarIdx,
        flags: OperandFlags,
        alive: bool,
        id: OpId,
        is_call: bool,
    ) -> Result<Placement, AllocError> {
        let cur = self.cur.place(var).ok_or_else(|| {
            AllocError::InternalError(format!("%{} has no location at {id}", var.index()))
        })?;
        if flags.allows_stack()
            && let Placement::Stack(_) = cur
        {
            return Ok(cur);
        }
        let in_reg = self.in_state.find(var);
        if let Some(reg) = in_reg
            && (!alive || self.out_state.get(reg) == RState::Var(var))
        {
            return Ok(Placement::Reg(reg));
        }

        let src = in_reg.map(Placement::Reg).unwrap_or(cur);
        let reg = self.alloc_reg(
            frame,
            self.kinds[var].reg_class(),
            Need::Both,
            id,
            alive && is_call,
            false,
        )?;
        self.pending.push_chained(Move::new(
            Location::new(var, src),
            Location::new(var, Placement::Reg(reg)),
        ));
        self.in_state.set(reg, RState::Var(var));
        self.out_state.set(reg, RState::Var(var));
        self.cur.set(var, Placement::Reg(reg));
        Ok(Placement::Reg(reg))
    }

    fn define(
        &mut self,
        frame: &mut FrameMap,
        var: VarIdx,
        role: Role,
        flags: OperandFlags,
        id: OpId,
    ) -> Result<Placement, AllocError> {
        let class = self.kinds[var].reg_class();
        let place = if role == Role::Temp {
            let reg = self.alloc_reg(frame, class, Need::Both, id, false, false)?;
            self.in_state.set(reg, RState::Var(var));
            self.out_state.set(reg, RState::Var(var));
            Placement::Reg(reg)
        } else {
            match self.alloc_reg(frame, class, Need::Out, id, false, false) {
                Ok(reg) => {
                    self.out_state.set(reg, RState::Var(var));
                    Placement::Reg(reg)
                }
                Err(_) if flags.allows_stack() => {
                    self.stored.set(var.index(), true);
                    Placement::Stack(self.canonical_slot(frame, var))
                }
                Err(e) => return Err(e),
            }
        };
        self.cur.set(var, place);
        self.last_use[var] = Some(id);
        Ok(place)
    }

    /// An alive `var` was in `reg` as the instruction started, but was then evicted by a call.
    /// Find it somewhere that survives the call.
    fn fixup_alive(
        &mut self,
        frame: &mut FrameMap,
        var: VarIdx,
        reg: RegIdx,
        flags: OperandFlags,
        id: OpId,
        is_call: bool,
    ) -> Result<Placement, AllocError> {
        if flags.allows_stack()
            && let Some(Placement::Stack(slot)) = self.cur.place(var)
        {
            return Ok(Placement::Stack(slot));
        }
        let new = self.alloc_reg(
            frame,
            self.kinds[var].reg_class(),
            Need::Both,
            id,
            true,
            is_call,
        )?;
        self.pending.push_chained(Move::new(
            Location::new(var, Placement::Reg(reg)),
            Location::new(var, Placement::Reg(new)),
        ));
        self.in_state.set(new, RState::Var(var));
        self.out_state.set(new, RState::Var(var));
        self.cur.set(var, Placement::Reg(new));
        Ok(Placement::Reg(new))
    }

    fn kill(&mut self, var: VarIdx) {
        if let Some(Placement::Reg(reg)) = self.cur.place(var)
            && self.out_state.get(reg) == RState::Var(var)
        {
            self.out_state.set(reg, RState::Free);
        }
        self.cur.clear(var);
    }

    /// Spill every variable held in a caller-saved register at the end of a call.
    fn spill_caller_saved(&mut self, frame: &mut FrameMap, id: OpId) {
        let regs = self
            .out_state
            .iter()
            .filter_map(|(reg, rstate)| match rstate {
                RState::Var(var) if self.cx.cat.is_caller_saved(reg) => Some((reg, var)),
                _ => None,
            })
            .collect::<Vec<_>>();
        for (reg, var) in regs {
            self.out_state.set(reg, RState::Free);
            self.spill(frame, var, reg, id);
        }
    }
}
