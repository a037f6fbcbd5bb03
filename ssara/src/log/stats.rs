//! This module records statistics about allocation runs. "Durations" are wall-clock time, so
//! they are best effort only: they fail to account for context switches and the like.

use parking_lot::Mutex;
#[cfg(not(test))]
use std::env;
use std::{fs, time::Duration};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record allocation statistics if enabled. In non-testing mode, this is only enabled if the end
/// user defines the environment variable `SSARA_LOG_STATS`. In testing mode, this is always
/// enabled, with output being sent to `stderr`.
pub(crate) struct Stats {
    // Most users won't want statistics, so the check for "are any stats to be recorded?" should be
    // as quick as possible: only if stats are to be recorded do we have to lock a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many units were allocated successfully?
    units_allocated_ok: u64,
    /// How many units failed to allocate?
    units_allocated_err: u64,
    /// How many times did the greedy allocator give up, leaving the unit to the spill allocator?
    strategy_fallbacks: u64,
    /// How many moves did allocators insert within blocks?
    allocator_moves: u64,
    /// How many moves did edge resolution insert?
    resolver_moves: u64,
    /// The time spent in each [AllocPhase].
    durations: [Duration; AllocPhase::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub(crate) fn new() -> Self {
        Self {
            inner: env::var("SSARA_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If `SSARA_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut *mtx.lock());
        }
    }

    /// Increment the "a unit has been allocated successfully" count.
    pub(crate) fn unit_allocated_ok(&self) {
        self.update_with(|inner| inner.units_allocated_ok += 1);
    }

    /// Increment the "a unit has failed to allocate" count.
    pub(crate) fn unit_allocated_err(&self) {
        self.update_with(|inner| inner.units_allocated_err += 1);
    }

    pub(crate) fn strategy_fallback(&self) {
        self.update_with(|inner| inner.strategy_fallbacks += 1);
    }

    /// Record that an allocator inserted `n` moves.
    pub(crate) fn allocator_moves(&self, n: usize) {
        self.update_with(|inner| inner.allocator_moves += u64::try_from(n).unwrap());
    }

    /// Record that edge resolution inserted `n` moves.
    pub(crate) fn resolver_moves(&self, n: usize) {
        self.update_with(|inner| inner.resolver_moves += u64::try_from(n).unwrap());
    }

    /// Add `d` to the time spent in `phase`.
    pub(crate) fn timing(&self, phase: AllocPhase, d: Duration) {
        self.update_with(|inner| {
            inner.durations[phase as usize] = inner.durations[phase as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    #[cfg(test)]
    pub(crate) fn to_json(&self) -> String {
        self.inner
            .as_ref()
            .map(|x| x.lock().to_json())
            .unwrap_or_default()
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            units_allocated_ok: 0,
            units_allocated_err: 0,
            strategy_fallbacks: 0,
            allocator_moves: 0,
            resolver_moves: 0,
            durations: [Duration::new(0, 0); AllocPhase::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is guaranteed to be sorted by field name so
    /// that textual matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            (
                "units_allocated_ok".to_owned(),
                self.units_allocated_ok.to_string(),
            ),
            (
                "units_allocated_err".to_owned(),
                self.units_allocated_err.to_string(),
            ),
            (
                "strategy_fallbacks".to_owned(),
                self.strategy_fallbacks.to_string(),
            ),
            (
                "allocator_moves".to_owned(),
                self.allocator_moves.to_string(),
            ),
            ("resolver_moves".to_owned(), self.resolver_moves.to_string()),
        ];
        for v in AllocPhase::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The phases of an allocation run.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
// New phases must have a `strum` `to_string` that produces the name of the key that will appear
// in the JSON stats. If `to_string` produces the empty string, that value will not appear in the
// JSON stats. Don't assign numbers to any of the variants with `= <int>`!
pub(crate) enum AllocPhase {
    #[strum(to_string = "duration_dataflow")]
    Dataflow,
    /// Either allocator, including any fallback run.
    #[strum(to_string = "duration_allocation")]
    Allocation,
    #[strum(to_string = "duration_resolution")]
    Resolution,
    #[strum(to_string = "duration_refmaps")]
    RefMaps,
    #[strum(to_string = "duration_verification")]
    Verification,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regalloc::test::fmatcher;

    #[test]
    fn json() {
        let stats = Stats::new();
        stats.unit_allocated_ok();
        stats.unit_allocated_ok();
        stats.strategy_fallback();
        stats.allocator_moves(7);
        stats.timing(AllocPhase::Resolution, Duration::from_millis(1500));
        fmatcher(
            r#"{
    "allocator_moves": 7,
    "duration_allocation": 0.000,
    "duration_dataflow": 0.000,
    "duration_refmaps": 0.000,
    "duration_resolution": 1.500,
    "duration_verification": 0.000,
    "resolver_moves": 0,
    "strategy_fallbacks": 1,
    "units_allocated_err": 0,
    "units_allocated_ok": 2
}"#,
        )
        .matches(&stats.to_json())
        .unwrap();
    }
}
