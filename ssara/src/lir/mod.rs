//! The low-level IR (LIR) that register allocation operates on.
//!
//! A [Lir] is a control-flow graph of [Block]s, each an ordered list of [Inst]s whose
//! [Operand]s are tagged with a [Role]. Values crossing block boundaries in more than one way are
//! merged by phis: a block's [PhiMap] records the variables it defines on entry and, for each
//! predecessor, the values that predecessor supplies.
//!
//! The structure of a [Lir] is fixed once it has been built with [LirBuilder]: register
//! allocation only fills in operand locations, inserts moves, and fills in safepoint reference
//! maps.

use crate::{
    frame::SlotIdx,
    regalloc::AllocError,
    target::{RegClass, RegIdx, RegisterCatalog},
};
use index_vec::IndexVec;
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};
use strum::{Display, EnumString};
use vob::Vob;

mod cfg;
#[cfg(test)]
pub(crate) mod parser;

index_vec::define_index_type! {
    pub struct BlockIdx = u32;
}

index_vec::define_index_type! {
    pub struct VarIdx = u32;
}

index_vec::define_index_type! {
    pub struct LoopIdx = u32;
}

/// An instruction id. Instructions are numbered `0, 2, 4, ...` in block order, leaving the odd
/// ids free to denote the end of an instruction: values killed at `id` are dead once the
/// instruction has read its inputs; values killed at `id + 1` are dead once the instruction has
/// completed.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OpId(u32);

impl OpId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::try_from(self.0).unwrap()
    }

    /// The end of the instruction whose id is `self`.
    pub fn end(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a variable.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum Kind {
    #[strum(serialize = "i32")]
    I32,
    #[strum(serialize = "i64")]
    I64,
    #[strum(serialize = "f32")]
    F32,
    #[strum(serialize = "f64")]
    F64,
    /// A reference that the garbage collector must be told about at safepoints.
    #[strum(serialize = "ref")]
    Ref,
}

impl Kind {
    pub fn reg_class(self) -> RegClass {
        match self {
            Kind::I32 | Kind::I64 | Kind::Ref => RegClass::Gp,
            Kind::F32 | Kind::F64 => RegClass::Fp,
        }
    }

    pub fn byte_size(self) -> usize {
        match self {
            Kind::I32 | Kind::F32 => 4,
            Kind::I64 | Kind::F64 | Kind::Ref => 8,
        }
    }

    pub fn is_ref(self) -> bool {
        self == Kind::Ref
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Value {
    Const(i64),
    /// A fixed physical register.
    Reg(RegIdx),
    /// A fixed stack slot.
    Stack(SlotIdx),
    Var(VarIdx),
}

/// How an instruction uses an operand.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Role {
    /// Read at the start of the instruction.
    #[strum(to_string = "in")]
    Input,
    /// Read at the start of the instruction, and must remain intact until its end.
    #[strum(to_string = "alive")]
    Alive,
    /// Clobbered during the instruction.
    #[strum(to_string = "temp")]
    Temp,
    /// Written by the instruction.
    #[strum(to_string = "out")]
    Output,
    /// Must be recoverable (e.g. for deoptimisation) while the instruction executes.
    #[strum(to_string = "state")]
    State,
}

const OPERANDFLAGS_STACK: u8 = 1;

/// What an instruction allows of an operand's location beyond "a register".
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OperandFlags(u8);

impl OperandFlags {
    /// Create a blank [OperandFlags] i.e. one that only accepts registers.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Return the current [OperandFlags] extended to accept stack slots.
    pub const fn with_stack(self) -> Self {
        Self(self.0 | OPERANDFLAGS_STACK)
    }

    pub const fn allows_stack(&self) -> bool {
        (self.0 & OPERANDFLAGS_STACK) != 0
    }
}

/// Where a value physically resides.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Placement {
    Reg(RegIdx),
    Stack(SlotIdx),
}

/// A variable in a particular [Placement].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Location {
    pub var: VarIdx,
    pub place: Placement,
}

impl Location {
    pub fn new(var: VarIdx, place: Placement) -> Self {
        Self { var, place }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MoveSrc {
    Loc(Location),
    Const(i64),
}

/// A copy of a value into a [Location]. The moves at a single program point form an ordered list:
/// they are executed in sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Move {
    pub from: MoveSrc,
    pub to: Location,
}

impl Move {
    pub fn new(from: Location, to: Location) -> Self {
        Self {
            from: MoveSrc::Loc(from),
            to,
        }
    }

    pub fn from_const(c: i64, to: Location) -> Self {
        Self {
            from: MoveSrc::Const(c),
            to,
        }
    }

    /// The placement this move reads from, if any.
    pub fn src_place(&self) -> Option<Placement> {
        match self.from {
            MoveSrc::Loc(l) => Some(l.place),
            MoveSrc::Const(_) => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Operand {
    pub role: Role,
    pub value: Value,
    pub flags: OperandFlags,
    /// Filled in by register allocation.
    pub loc: Option<Placement>,
}

impl Operand {
    pub fn new(role: Role, value: Value) -> Self {
        Self {
            role,
            value,
            flags: OperandFlags::new(),
            loc: None,
        }
    }

    pub fn input(value: Value) -> Self {
        Self::new(Role::Input, value)
    }

    pub fn alive(value: Value) -> Self {
        Self::new(Role::Alive, value)
    }

    pub fn temp(value: Value) -> Self {
        Self::new(Role::Temp, value)
    }

    pub fn output(value: Value) -> Self {
        Self::new(Role::Output, value)
    }

    pub fn state(value: Value) -> Self {
        Self::new(Role::State, value)
    }

    pub fn with_stack(mut self) -> Self {
        self.flags = self.flags.with_stack();
        self
    }

    /// If this operand names a fixed register or stack slot, return its placement.
    pub fn fixed_place(&self) -> Option<Placement> {
        match self.value {
            Value::Reg(reg) => Some(Placement::Reg(reg)),
            Value::Stack(slot) => Some(Placement::Stack(slot)),
            Value::Const(_) | Value::Var(_) => None,
        }
    }

    pub fn var(&self) -> Option<VarIdx> {
        match self.value {
            Value::Var(var) => Some(var),
            _ => None,
        }
    }

    /// The annotated [Location] of this operand, if it is an allocated variable.
    pub fn location(&self) -> Option<Location> {
        match (self.value, self.loc) {
            (Value::Var(var), Some(place)) => Some(Location::new(var, place)),
            _ => None,
        }
    }
}

/// The references live across a safepoint.
#[derive(Clone, Debug)]
pub struct RefMap {
    pub regs: Vob,
    pub slots: Vob,
}

impl Default for RefMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RefMap {
    pub fn new() -> Self {
        Self {
            regs: Vob::new(),
            slots: Vob::new(),
        }
    }

    pub(crate) fn set(&mut self, place: Placement) {
        let (vob, i) = match place {
            Placement::Reg(reg) => (&mut self.regs, reg.index()),
            Placement::Stack(slot) => (&mut self.slots, slot.index()),
        };
        if vob.len() <= i {
            vob.resize(i + 1, false);
        }
        vob.set(i, true);
    }

    pub fn contains(&self, place: Placement) -> bool {
        match place {
            Placement::Reg(reg) => self.regs.get(reg.index()).unwrap_or(false),
            Placement::Stack(slot) => self.slots.get(slot.index()).unwrap_or(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.places().next().is_none()
    }

    /// Iterate over the placements in this map: registers first, then stack slots.
    pub fn places(&self) -> impl Iterator<Item = Placement> + '_ {
        self.regs
            .iter_set_bits(..)
            .map(|x| Placement::Reg(RegIdx::from_usize(x)))
            .chain(
                self.slots
                    .iter_set_bits(..)
                    .map(|x| Placement::Stack(SlotIdx::from_usize(x))),
            )
    }
}

#[derive(Clone, Debug)]
pub struct Inst {
    /// Assigned by liveness analysis.
    pub id: OpId,
    pub name: String,
    pub operands: SmallVec<[Operand; 4]>,
    /// Does this instruction clobber caller-saved registers?
    pub is_call: bool,
    /// If this instruction is a safepoint, the references live across it.
    pub safepoint: Option<RefMap>,
    pub moves_before: Vec<Move>,
    pub moves_after: Vec<Move>,
}

impl Inst {
    pub fn new(name: &str) -> Self {
        Self {
            id: OpId::default(),
            name: name.to_owned(),
            operands: SmallVec::new(),
            is_call: false,
            safepoint: None,
            moves_before: Vec::new(),
            moves_after: Vec::new(),
        }
    }

    pub fn with_operand(mut self, op: Operand) -> Self {
        self.operands.push(op);
        self
    }

    pub fn with_call(mut self) -> Self {
        self.is_call = true;
        self
    }

    pub fn with_safepoint(mut self) -> Self {
        self.safepoint = Some(RefMap::new());
        self
    }

    /// Iterate over the operands with role `role`, alongside their position in
    /// [Self::operands].
    pub fn operands_with(&self, role: Role) -> impl Iterator<Item = (usize, &Operand)> {
        self.operands
            .iter()
            .enumerate()
            .filter(move |(_, op)| op.role == role)
    }
}

/// The phis of a block.
#[derive(Clone, Debug, Default)]
pub struct PhiMap {
    /// The variables defined on entry to the block, as [Role::Output] operands.
    pub outputs: Vec<Operand>,
    /// For each predecessor, the values it supplies, in the same order as [Self::outputs], as
    /// stack-permitting [Role::Input] operands.
    pub inputs: Vec<(BlockIdx, Vec<Operand>)>,
}

impl PhiMap {
    pub fn inputs_from(&self, pred: BlockIdx) -> Option<&[Operand]> {
        self.inputs
            .iter()
            .find(|(b, _)| *b == pred)
            .map(|(_, ops)| ops.as_slice())
    }

    pub fn inputs_from_mut(&mut self, pred: BlockIdx) -> Option<&mut Vec<Operand>> {
        self.inputs
            .iter_mut()
            .find(|(b, _)| *b == pred)
            .map(|(_, ops)| ops)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub insts: Vec<Inst>,
    pub preds: SmallVec<[BlockIdx; 2]>,
    pub succs: SmallVec<[BlockIdx; 2]>,
    /// The immediate dominator. `None` only for the entry block.
    pub dom: Option<BlockIdx>,
    /// The innermost loop containing this block.
    pub loop_idx: Option<LoopIdx>,
    pub loop_depth: u32,
    /// All the loops containing this block, outermost first.
    pub loops: SmallVec<[LoopIdx; 2]>,
    /// If this block is a loop header, the loop it heads.
    pub header_of: Option<LoopIdx>,
    pub phis: Option<PhiMap>,
    /// Moves executed on entry to the block, before any instruction.
    pub moves_in: Vec<Move>,
    /// Moves executed on exit from the block, after the final instruction has consumed its
    /// operands but before control is transferred.
    pub moves_out: Vec<Move>,
}

impl Block {
    pub fn first_id(&self) -> OpId {
        self.insts[0].id
    }

    pub fn last_id(&self) -> OpId {
        self.insts[self.insts.len() - 1].id
    }

    pub fn is_loop_header(&self) -> bool {
        self.header_of.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Loop {
    pub header: BlockIdx,
    /// The blocks of the loop, including the header and the blocks of nested loops, in block
    /// order.
    pub blocks: Vec<BlockIdx>,
}

#[derive(Clone, Debug)]
pub struct Lir {
    pub blocks: IndexVec<BlockIdx, Block>,
    pub vars: IndexVec<VarIdx, Kind>,
    pub loops: IndexVec<LoopIdx, Loop>,
    /// How many fixed stack slots (`@0..@n`) this unit uses.
    pub fixed_slots: usize,
}

impl Lir {
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn inst(&self, bidx: BlockIdx, pos: usize) -> &Inst {
        &self.blocks[bidx].insts[pos]
    }

    /// Remove everything register allocation has added, so that allocation can be rerun from
    /// scratch.
    pub fn reset_allocation(&mut self) {
        for blk in self.blocks.iter_mut() {
            blk.moves_in.clear();
            blk.moves_out.clear();
            for inst in blk.insts.iter_mut() {
                inst.moves_before.clear();
                inst.moves_after.clear();
                if let Some(sp) = inst.safepoint.as_mut() {
                    *sp = RefMap::new();
                }
                for op in inst.operands.iter_mut() {
                    op.loc = op.fixed_place();
                }
            }
            if let Some(phis) = blk.phis.as_mut() {
                for op in phis.outputs.iter_mut() {
                    op.loc = None;
                }
                for (_, ops) in phis.inputs.iter_mut() {
                    for op in ops.iter_mut() {
                        op.loc = None;
                    }
                }
            }
        }
    }

    /// Count the moves inserted by register allocation.
    pub fn num_moves(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| {
                b.moves_in.len()
                    + b.moves_out.len()
                    + b.insts
                        .iter()
                        .map(|i| i.moves_before.len() + i.moves_after.len())
                        .sum::<usize>()
            })
            .sum()
    }

    /// Return an object that displays this LIR using register names from `cat`.
    pub fn display<'a>(&'a self, cat: &'a RegisterCatalog) -> DisplayableLir<'a> {
        DisplayableLir { lir: self, cat }
    }
}

/// Builds a well-formed [Lir]: predecessors, dominators, and loops are derived from the edges
/// added with [LirBuilder::add_edge].
#[derive(Default)]
pub struct LirBuilder {
    blocks: IndexVec<BlockIdx, Block>,
    vars: IndexVec<VarIdx, Kind>,
    /// For each block, the variables its phis define.
    phi_outputs: IndexVec<BlockIdx, Vec<VarIdx>>,
    /// `(pred, succ, values)` for each edge.
    edges: Vec<(BlockIdx, BlockIdx, Vec<Value>)>,
}

impl LirBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_var(&mut self, kind: Kind) -> VarIdx {
        self.vars.push(kind)
    }

    pub fn new_block(&mut self) -> BlockIdx {
        self.phi_outputs.push(Vec::new());
        self.blocks.push(Block::default())
    }

    pub fn push_inst(&mut self, bidx: BlockIdx, inst: Inst) {
        self.blocks[bidx].insts.push(inst);
    }

    /// Add an edge `pred -> succ`, with `phi_args` being the values `pred` supplies to `succ`'s
    /// phis. Successors are ordered by the order edges are added.
    pub fn add_edge(&mut self, pred: BlockIdx, succ: BlockIdx, phi_args: Vec<Value>) {
        self.edges.push((pred, succ, phi_args));
    }

    pub fn set_phis(&mut self, bidx: BlockIdx, outputs: Vec<VarIdx>) {
        self.phi_outputs[bidx] = outputs;
    }

    pub fn build(mut self) -> Result<Lir, AllocError> {
        if self.blocks.is_empty() {
            return Err(AllocError::InternalError("No blocks".into()));
        }
        for (bidx, blk) in self.blocks.iter_enumerated() {
            if blk.insts.is_empty() {
                return Err(AllocError::InternalError(format!(
                    "bb{} is empty",
                    bidx.index()
                )));
            }
        }

        for (bidx, outputs) in self.phi_outputs.iter_enumerated() {
            if !outputs.is_empty() {
                self.blocks[bidx].phis = Some(PhiMap {
                    outputs: outputs
                        .iter()
                        .map(|v| Operand::output(Value::Var(*v)))
                        .collect(),
                    inputs: Vec::new(),
                });
            }
        }

        for (pred, succ, args) in std::mem::take(&mut self.edges) {
            if self.blocks[pred].succs.contains(&succ) {
                return Err(AllocError::InternalError(format!(
                    "Duplicate edge bb{} -> bb{}",
                    pred.index(),
                    succ.index()
                )));
            }
            self.blocks[pred].succs.push(succ);
            self.blocks[succ].preds.push(pred);
            let nphis = self.phi_outputs[succ].len();
            if args.len() != nphis {
                return Err(AllocError::InternalError(format!(
                    "bb{} supplies {} values to bb{}'s {nphis} phis",
                    pred.index(),
                    args.len(),
                    succ.index()
                )));
            }
            if let Some(phis) = self.blocks[succ].phis.as_mut() {
                let mut ops = Vec::with_capacity(args.len());
                for v in args {
                    if !matches!(v, Value::Var(_) | Value::Const(_)) {
                        return Err(AllocError::InternalError(format!(
                            "Phi input from bb{} to bb{} is neither a variable nor a constant",
                            pred.index(),
                            succ.index()
                        )));
                    }
                    ops.push(Operand::input(v).with_stack());
                }
                phis.inputs.push((pred, ops));
            }
        }

        self.check_temps()?;

        let mut fixed_slots = 0;
        for blk in self.blocks.iter_mut() {
            for inst in blk.insts.iter_mut() {
                for op in inst.operands.iter_mut() {
                    op.loc = op.fixed_place();
                    if let Value::Stack(slot) = op.value {
                        fixed_slots = fixed_slots.max(slot.index() + 1);
                    }
                }
            }
        }

        let mut lir = Lir {
            blocks: self.blocks,
            vars: self.vars,
            loops: IndexVec::new(),
            fixed_slots,
        };
        cfg::compute_dominators(&mut lir)?;
        cfg::compute_loops(&mut lir);
        Ok(lir)
    }

    /// Temporaries are private to their instruction: a variable used as a [Role::Temp] must not
    /// appear anywhere else.
    fn check_temps(&self) -> Result<(), AllocError> {
        let mut temps = Vob::from_elem(false, self.vars.len());
        let mut seen = Vob::from_elem(false, self.vars.len());
        let mut visit = |op: &Operand| -> Result<(), AllocError> {
            if let Value::Var(v) = op.value {
                if v.index() >= self.vars.len() {
                    return Err(AllocError::InternalError(format!(
                        "Unknown variable %{}",
                        v.index()
                    )));
                }
                let is_temp = op.role == Role::Temp;
                if (is_temp && seen.get(v.index()) == Some(true))
                    || (!is_temp && temps.get(v.index()) == Some(true))
                {
                    return Err(AllocError::InternalError(format!(
                        "Temporary %{} used outside its instruction",
                        v.index()
                    )));
                }
                if is_temp {
                    temps.set(v.index(), true);
                }
                seen.set(v.index(), true);
            }
            Ok(())
        };
        for blk in self.blocks.iter() {
            for inst in blk.insts.iter() {
                for op in inst.operands.iter() {
                    visit(op)?;
                }
            }
            if let Some(phis) = &blk.phis {
                for op in phis.outputs.iter() {
                    visit(op)?;
                }
                for (_, ops) in phis.inputs.iter() {
                    for op in ops.iter() {
                        visit(op)?;
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct DisplayableLir<'a> {
    lir: &'a Lir,
    cat: &'a RegisterCatalog,
}

impl DisplayableLir<'_> {
    fn place(&self, place: Placement) -> String {
        match place {
            Placement::Reg(reg) => self.cat.name(reg).to_owned(),
            Placement::Stack(slot) => format!("@{}", slot.index()),
        }
    }

    fn value(&self, op: &Operand) -> String {
        match op.value {
            Value::Const(c) => c.to_string(),
            Value::Reg(reg) => self.cat.name(reg).to_owned(),
            Value::Stack(slot) => format!("@{}", slot.index()),
            Value::Var(var) => match op.loc {
                Some(place) => format!("%{}={}", var.index(), self.place(place)),
                None => format!("%{}", var.index()),
            },
        }
    }

    fn mv(&self, mv: &Move) -> String {
        let from = match mv.from {
            MoveSrc::Loc(l) => format!("%{}={}", l.var.index(), self.place(l.place)),
            MoveSrc::Const(c) => c.to_string(),
        };
        format!(
            "move {from} -> %{}={}",
            mv.to.var.index(),
            self.place(mv.to.place)
        )
    }

    fn refmap(&self, rm: &RefMap) -> String {
        rm.places()
            .map(|x| self.place(x))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Display for DisplayableLir<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (bidx, blk) in self.lir.blocks.iter_enumerated() {
            write!(f, "bb{}", bidx.index())?;
            if let Some(phis) = &blk.phis {
                let outs = phis
                    .outputs
                    .iter()
                    .map(|x| self.value(x))
                    .collect::<Vec<_>>();
                write!(f, "({})", outs.join(", "))?;
            }
            if !blk.succs.is_empty() {
                let succs = blk
                    .succs
                    .iter()
                    .map(|succ| {
                        match self.lir.blocks[*succ]
                            .phis
                            .as_ref()
                            .and_then(|x| x.inputs_from(bidx))
                        {
                            Some(ins) => format!(
                                "bb{}({})",
                                succ.index(),
                                ins.iter().map(|x| self.value(x)).collect::<Vec<_>>().join(", ")
                            ),
                            None => format!("bb{}", succ.index()),
                        }
                    })
                    .collect::<Vec<_>>();
                write!(f, " -> {}", succs.join(", "))?;
            }
            writeln!(f, ":")?;
            for mv in &blk.moves_in {
                writeln!(f, "  {}", self.mv(mv))?;
            }
            for inst in &blk.insts {
                for mv in &inst.moves_before {
                    writeln!(f, "  {}", self.mv(mv))?;
                }
                write!(f, "  {}: {}", inst.id, inst.name)?;
                let mut attrs = Vec::new();
                if inst.is_call {
                    attrs.push("call".to_owned());
                }
                if let Some(rm) = &inst.safepoint {
                    if rm.is_empty() {
                        attrs.push("safepoint".to_owned());
                    } else {
                        attrs.push(format!("safepoint({})", self.refmap(rm)));
                    }
                }
                if !attrs.is_empty() {
                    write!(f, " [{}]", attrs.join(", "))?;
                }
                let ops = inst
                    .operands
                    .iter()
                    .map(|op| {
                        if op.flags.allows_stack() {
                            format!("{}({}, stack)", op.role, self.value(op))
                        } else {
                            format!("{}({})", op.role, self.value(op))
                        }
                    })
                    .collect::<Vec<_>>();
                if !ops.is_empty() {
                    write!(f, " {}", ops.join(", "))?;
                }
                writeln!(f)?;
                for mv in &inst.moves_after {
                    writeln!(f, "  {}", self.mv(mv))?;
                }
            }
            for mv in &blk.moves_out {
                writeln!(f, "  {}", self.mv(mv))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::test_catalog;

    #[test]
    fn operand_flags() {
        assert!(!OperandFlags::new().allows_stack());
        assert!(OperandFlags::new().with_stack().allows_stack());
        assert!(Operand::input(Value::Const(1)).with_stack().flags.allows_stack());
    }

    #[test]
    fn kinds() {
        assert_eq!("ref".parse::<Kind>().unwrap(), Kind::Ref);
        assert_eq!(Kind::F32.to_string(), "f32");
        assert_eq!(Kind::F64.reg_class(), RegClass::Fp);
        assert_eq!(Kind::Ref.reg_class(), RegClass::Gp);
        assert!("i8".parse::<Kind>().is_err());
    }

    #[test]
    fn refmap() {
        let mut rm = RefMap::new();
        assert!(rm.is_empty());
        rm.set(Placement::Stack(SlotIdx::from_usize(5)));
        rm.set(Placement::Reg(RegIdx::from_usize(1)));
        assert!(!rm.is_empty());
        assert!(rm.contains(Placement::Stack(SlotIdx::from_usize(5))));
        assert!(!rm.contains(Placement::Stack(SlotIdx::from_usize(4))));
        assert!(!rm.contains(Placement::Stack(SlotIdx::from_usize(50))));
        assert!(rm.contains(Placement::Reg(RegIdx::from_usize(1))));
    }

    #[test]
    fn build_diamond() {
        let mut lb = LirBuilder::new();
        let v0 = lb.new_var(Kind::I64);
        let v1 = lb.new_var(Kind::I64);
        let bbs = (0..4).map(|_| lb.new_block()).collect::<Vec<_>>();
        lb.push_inst(bbs[0], Inst::new("def").with_operand(Operand::output(Value::Var(v0))));
        lb.push_inst(bbs[0], Inst::new("br").with_operand(Operand::input(Value::Var(v0))));
        lb.push_inst(bbs[1], Inst::new("jmp"));
        lb.push_inst(bbs[2], Inst::new("jmp"));
        lb.push_inst(bbs[3], Inst::new("ret").with_operand(Operand::input(Value::Var(v1))));
        lb.set_phis(bbs[3], vec![v1]);
        lb.add_edge(bbs[0], bbs[1], vec![]);
        lb.add_edge(bbs[0], bbs[2], vec![]);
        lb.add_edge(bbs[1], bbs[3], vec![Value::Var(v0)]);
        lb.add_edge(bbs[2], bbs[3], vec![Value::Const(3)]);
        let lir = lb.build().unwrap();
        assert_eq!(lir.blocks[bbs[3]].dom, Some(bbs[0]));
        assert_eq!(lir.blocks[bbs[1]].dom, Some(bbs[0]));
        assert_eq!(lir.blocks[bbs[0]].dom, None);
        assert_eq!(lir.blocks[bbs[3]].preds.as_slice(), &[bbs[1], bbs[2]]);
        assert!(lir.loops.is_empty());
        let phis = lir.blocks[bbs[3]].phis.as_ref().unwrap();
        assert_eq!(
            phis.inputs_from(bbs[2]).unwrap()[0].value,
            Value::Const(3)
        );
        assert!(phis.inputs_from(bbs[0]).is_none());

        let cat = test_catalog(2, 0);
        let s = lir.display(&cat).to_string();
        assert!(s.contains("bb1 -> bb3(%0):"));
        assert!(s.contains("bb3(%1):"));
    }

    #[test]
    fn build_errors() {
        let mut lb = LirBuilder::new();
        lb.new_block();
        assert!(matches!(lb.build(), Err(AllocError::InternalError(_))));

        let mut lb = LirBuilder::new();
        let v0 = lb.new_var(Kind::I64);
        let b0 = lb.new_block();
        let b1 = lb.new_block();
        lb.push_inst(b0, Inst::new("jmp"));
        lb.push_inst(b1, Inst::new("ret"));
        lb.set_phis(b1, vec![v0]);
        lb.add_edge(b0, b1, vec![]);
        assert!(matches!(lb.build(), Err(AllocError::InternalError(_))));

        let mut lb = LirBuilder::new();
        let v0 = lb.new_var(Kind::I64);
        let b0 = lb.new_block();
        lb.push_inst(b0, Inst::new("x").with_operand(Operand::temp(Value::Var(v0))));
        lb.push_inst(b0, Inst::new("y").with_operand(Operand::input(Value::Var(v0))));
        assert!(matches!(lb.build(), Err(AllocError::InternalError(_))));
    }
}
