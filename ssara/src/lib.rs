//! An SSA register allocator for a low-level IR.
//!
//! A [lir::Lir] is built with [lir::LirBuilder] and handed to [RegAllocator::allocate], which
//! gives every operand a register or stack slot, inserts the moves needed between them, and
//! records which locations hold live references at each safepoint. The per-block
//! [LocationMap]s and the final [frame::FrameLayout] are returned for code emission.
//!
//! Allocation can be configured with the following environment variables (see
//! [AllocConfig::from_env] and [RegAllocator::from_env]):
//!
//!   * `SSARA_ALLOCATOR=greedy|spill|greedy-then-spill`
//!   * `SSARA_VERIFY=0|1`
//!   * `SSARA_LOG=[<path|->:]<level>`
//!   * `SSARA_LOG_STATS=<path|->`
//!   * `SSARA_LOG_IR=[<path>:]<phase_1>[,...,<phase_n>]` (with the `ssarad` feature only)

mod config;
pub mod frame;
pub mod lir;
mod log;
mod regalloc;
pub mod target;

pub use config::{AllocConfig, Strategy};
pub use regalloc::{AllocError, BlockMaps, LocationMap};

use crate::{
    frame::{FrameLayout, FrameMap},
    lir::{BlockIdx, Lir},
    log::{
        IRPhase, Log, Verbosity, log_ir, should_log_ir,
        stats::{AllocPhase, Stats},
    },
    regalloc::{
        AllocCtx, AllocMaps, dataflow::Dataflow, greedy, refmap, resolve::resolve, spill_alloc,
        verify::verify,
    },
    target::RegisterCatalog,
};
use index_vec::IndexVec;
use std::{error::Error, sync::LazyLock, time::Instant};

static STATS: LazyLock<Stats> = LazyLock::new(Stats::new);

/// Output the statistics gathered by every allocation run in this process to the path given by
/// `SSARA_LOG_STATS`. If `SSARA_LOG_STATS` is not set, this does nothing.
pub fn output_stats() {
    STATS.output();
}

/// The result of allocating a unit.
#[derive(Debug)]
pub struct Allocation {
    /// The locations of live variables at the beginning and end of each block.
    pub maps: IndexVec<BlockIdx, BlockMaps>,
    pub frame: FrameLayout,
    /// The allocator that produced this allocation. This differs from the configured strategy
    /// only if [Strategy::GreedyThenSpill] fell back to [Strategy::SpillAll].
    pub strategy: Strategy,
}

/// Allocates units for one register catalog.
pub struct RegAllocator {
    catalog: RegisterCatalog,
    config: AllocConfig,
    log: Log,
}

impl RegAllocator {
    /// Create an allocator for `catalog` with `config`. If `SSARA_LOG` is malformed, logging
    /// falls back to its defaults.
    pub fn new(catalog: RegisterCatalog, config: AllocConfig) -> Self {
        Self {
            catalog,
            config,
            log: Log::new().unwrap_or_default(),
        }
    }

    /// Create an allocator for `catalog` configured by the `SSARA_*` environment variables.
    pub fn from_env(catalog: RegisterCatalog) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            catalog,
            config: AllocConfig::from_env()?,
            log: Log::new()?,
        })
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    /// Allocate `lir` in place. Any previous allocation of `lir` is discarded first. On error,
    /// `lir` is left partially allocated.
    pub fn allocate(&self, lir: &mut Lir) -> Result<Allocation, AllocError> {
        match self.run(lir) {
            Ok(x) => {
                STATS.unit_allocated_ok();
                Ok(x)
            }
            Err(e) => {
                STATS.unit_allocated_err();
                self.log.log(Verbosity::Error, &e.to_string());
                Err(e)
            }
        }
    }

    fn run(&self, lir: &mut Lir) -> Result<Allocation, AllocError> {
        lir.reset_allocation();
        if should_log_ir(IRPhase::PreAlloc) {
            log_ir(&format!(
                "--- Begin pre-alloc ---\n{}--- End pre-alloc ---\n",
                lir.display(&self.catalog)
            ));
        }

        let df = timed(AllocPhase::Dataflow, || {
            Dataflow::analyse(lir, &self.catalog)
        })?;
        if should_log_ir(IRPhase::Dataflow) {
            log_ir(&format!(
                "--- Begin dataflow ---\n{}--- End dataflow ---\n",
                df.dump()
            ));
        }

        let cx = AllocCtx {
            cat: &self.catalog,
            log: &self.log,
        };
        let (maps, mut frame, strategy) =
            timed(AllocPhase::Allocation, || self.run_strategy(lir, &cx, &df))?;
        STATS.allocator_moves(lir.num_moves());

        let n = timed(AllocPhase::Resolution, || {
            resolve(lir, &maps, &df, &mut frame)
        })?;
        STATS.resolver_moves(n);
        timed(AllocPhase::RefMaps, || refmap::compute(lir, &maps, &df))?;
        if self.config.verify {
            timed(AllocPhase::Verification, || {
                verify(lir, &self.catalog, &maps, &df)
            })?;
        }

        if should_log_ir(IRPhase::PostAlloc) {
            log_ir(&format!(
                "--- Begin post-alloc ---\n{}--- End post-alloc ---\n",
                lir.display(&self.catalog)
            ));
        }
        Ok(Allocation {
            maps,
            frame: frame.layout(),
            strategy,
        })
    }

    /// Run the configured allocator, returning its maps, the frame it built, and the strategy
    /// that produced them.
    fn run_strategy(
        &self,
        lir: &mut Lir,
        cx: &AllocCtx,
        df: &Dataflow,
    ) -> Result<(AllocMaps, FrameMap, Strategy), AllocError> {
        let mut frame = FrameMap::new(lir.fixed_slots);
        match self.config.strategy {
            Strategy::Greedy => {
                let maps = greedy::allocate(lir, cx, df, &mut frame)?;
                Ok((maps, frame, Strategy::Greedy))
            }
            Strategy::SpillAll => {
                let maps = spill_alloc::allocate(lir, cx, df, &mut frame)?;
                Ok((maps, frame, Strategy::SpillAll))
            }
            Strategy::GreedyThenSpill => match greedy::allocate(lir, cx, df, &mut frame) {
                Ok(maps) => Ok((maps, frame, Strategy::Greedy)),
                Err(e) if e.is_recoverable() => {
                    self.log.log(
                        Verbosity::Warning,
                        &format!("Falling back to the spill allocator: {e}"),
                    );
                    STATS.strategy_fallback();
                    lir.reset_allocation();
                    let mut frame = FrameMap::new(lir.fixed_slots);
                    let maps = spill_alloc::allocate(lir, cx, df, &mut frame)?;
                    Ok((maps, frame, Strategy::SpillAll))
                }
                Err(e) => Err(e),
            },
        }
    }
}

/// Run `f`, adding the time it took to `phase`.
fn timed<T>(phase: AllocPhase, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let x = f();
    STATS.timing(phase, start.elapsed());
    x
}
