//! Register allocation.
//!
//! Allocation of a compilation unit proceeds in passes:
//!
//!   1. [dataflow] numbers instructions and computes, for every block, the variables live on
//!      entry and, for every program point, the values whose live range ends there.
//!   2. An allocator ([greedy] or [spill_alloc]) walks the blocks in order and gives every operand
//!      a location, inserting moves within blocks as needed. It records a [LocationMap] at the
//!      beginning and end of every block.
//!   3. [resolve] inserts moves on control-flow edges where the end state of a predecessor does
//!      not match the beginning state of its successor (including phis).
//!   4. [refmap] computes, for every safepoint, the registers and stack slots holding live
//!      references.
//!   5. Optionally, [verify] checks the result.

use crate::{
    lir::{BlockIdx, Location, Placement, VarIdx},
    log::Log,
    target::{RegIdx, RegisterCatalog},
};
use index_vec::{IndexVec, index_vec};
use thiserror::Error;

pub(crate) mod dataflow;
pub(crate) mod greedy;
pub(crate) mod moves;
pub(crate) mod refmap;
pub(crate) mod resolve;
pub(crate) mod spill_alloc;
pub(crate) mod verify;

/// A failure to allocate a compilation unit.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("No fulfillable constraint: {0}")]
    /// An operand's constraints could not be satisfied with the registers available. The unit may
    /// still be allocatable with a different strategy.
    NoFulfillableConstraint(String),
    #[error("Internal error: {0}")]
    /// The input, or the allocator's own output, violated an invariant: this is a bug either in
    /// the producer of the LIR or in the allocator.
    InternalError(String),
}

impl AllocError {
    /// Can the caller sensibly retry allocation with a different strategy?
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AllocError::NoFulfillableConstraint(_))
    }
}

/// Where is each variable at a given program point? Maps are snapshots: they are copied, never
/// shared.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationMap {
    places: IndexVec<VarIdx, Option<Placement>>,
}

impl LocationMap {
    pub fn new(nvars: usize) -> Self {
        Self {
            places: index_vec![None; nvars],
        }
    }

    pub fn get(&self, var: VarIdx) -> Option<Location> {
        self.places[var].map(|place| Location::new(var, place))
    }

    pub fn place(&self, var: VarIdx) -> Option<Placement> {
        self.places[var]
    }

    pub fn set(&mut self, var: VarIdx, place: Placement) {
        self.places[var] = Some(place);
    }

    pub fn clear(&mut self, var: VarIdx) {
        self.places[var] = None;
    }

    /// Iterate over the variables which have a location.
    pub fn iter(&self) -> impl Iterator<Item = Location> + '_ {
        self.places
            .iter_enumerated()
            .filter_map(|(var, place)| place.map(|place| Location::new(var, place)))
    }
}

/// The locations of variables on entry to, and exit from, a block.
#[derive(Clone, Debug)]
pub struct BlockMaps {
    pub begin: LocationMap,
    pub end: LocationMap,
}

/// What an allocator hands on to the later passes.
pub(crate) type AllocMaps = IndexVec<BlockIdx, BlockMaps>;

/// The state shared, read-only, by the passes of a single allocation run.
pub(crate) struct AllocCtx<'a> {
    pub(crate) cat: &'a RegisterCatalog,
    pub(crate) log: &'a Log,
}

/// The state of a register at a program point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum RState {
    Free,
    Var(VarIdx),
    /// Reserved for a fixed-register operand.
    Blocked,
}

#[derive(Clone, Debug)]
pub(crate) struct RStates {
    rstates: IndexVec<RegIdx, RState>,
}

impl RStates {
    pub(crate) fn new(nregs: usize) -> Self {
        Self {
            rstates: index_vec![RState::Free; nregs],
        }
    }

    pub(crate) fn get(&self, reg: RegIdx) -> RState {
        self.rstates[reg]
    }

    pub(crate) fn set(&mut self, reg: RegIdx, rstate: RState) {
        self.rstates[reg] = rstate;
    }

    pub(crate) fn is_free(&self, reg: RegIdx) -> bool {
        self.rstates[reg] == RState::Free
    }

    /// Which register, if any, holds `var`?
    pub(crate) fn find(&self, var: VarIdx) -> Option<RegIdx> {
        self.rstates
            .iter_enumerated()
            .find(|(_, x)| **x == RState::Var(var))
            .map(|(reg, _)| reg)
    }

    /// Free every register holding a variable, leaving blocked registers blocked.
    pub(crate) fn clear_vars(&mut self) {
        for x in self.rstates.iter_mut() {
            if let RState::Var(_) = x {
                *x = RState::Free;
            }
        }
    }

    /// Unblock `reg` if it is blocked.
    pub(crate) fn unblock(&mut self, reg: RegIdx) {
        if self.rstates[reg] == RState::Blocked {
            self.rstates[reg] = RState::Free;
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (RegIdx, RState)> + '_ {
        self.rstates.iter_enumerated().map(|(reg, x)| (reg, *x))
    }
}
