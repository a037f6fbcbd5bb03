//! Parallel moves.
//!
//! The moves needed at a single program point are collected into a [MoveGroup], whose moves
//! conceptually happen simultaneously: every source is read before any destination is written.
//! [MoveGroup::sequentialize] turns such a group into an ordered list of moves with the same
//! effect.

use crate::{
    frame::FrameMap,
    lir::{Location, Move, MoveSrc, Placement},
};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct MoveGroup {
    moves: Vec<Move>,
}

impl MoveGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Add `mv` to the group. Moves whose source and destination are the same, and moves already
    /// in the group, are dropped.
    pub(crate) fn push(&mut self, mv: Move) {
        if mv.src_place() == Some(mv.to.place) || self.moves.contains(&mv) {
            return;
        }
        debug_assert!(self.moves.iter().all(|x| x.to.place != mv.to.place));
        self.moves.push(mv);
    }

    /// Add `mv` to the group, where `mv` is conceptually executed after the moves already in the
    /// group. If `mv` reads the same variable from a location an earlier move writes, it is
    /// rewritten to read from that earlier move's source instead.
    pub(crate) fn push_chained(&mut self, mut mv: Move) {
        if let MoveSrc::Loc(from) = mv.from
            && let Some(prev) = self.moves.iter().find(|x| x.to == from)
        {
            mv.from = prev.from;
        }
        self.push(mv);
    }

    /// Order the moves of this group such that no move overwrites a value needed by a later
    /// move, breaking cycles with scratch stack slots from `frame`.
    pub(crate) fn sequentialize(self, frame: &mut FrameMap) -> Vec<Move> {
        // If there are 0 or 1 moves, there is no chance of overlap.
        if self.moves.len() <= 1 {
            return self.moves;
        }

        // Moves from constants can't be overwritten: they are done last, after any move that reads
        // their destination.
        let (const_moves, mut moves): (Vec<_>, Vec<_>) = self
            .moves
            .into_iter()
            .partition(|x| matches!(x.from, MoveSrc::Const(_)));

        // Moves that save a value into a scratch slot, breaking a cycle. These are done first.
        let mut saves = Vec::new();

        // This is a fixed-point algorithm which produces an ordered set of moves without cycles.
        //
        // On each iteration we attempt a topological sort of the moves using Kahn's algorithm,
        // where placements are nodes and moves define edges. If the topological sort fails, we
        // have detected a cycle: we save one of the placements in the cycle to a scratch slot,
        // rewrite the moves reading from that placement to read from the scratch slot, and try
        // again.
        loop {
            let mut nodes = Vec::new();
            let mut indegrees = HashMap::new();
            for mv in &moves {
                let src = mv.src_place().unwrap();
                for place in [src, mv.to.place] {
                    if !indegrees.contains_key(&place) {
                        indegrees.insert(place, 0usize);
                        nodes.push(place);
                    }
                }
                *indegrees.get_mut(&mv.to.place).unwrap() += 1;
            }

            let mut queue = nodes
                .iter()
                .filter(|x| indegrees[*x] == 0)
                .copied()
                .collect::<Vec<_>>();
            let mut ordered = Vec::with_capacity(nodes.len());
            while let Some(place) = queue.pop() {
                ordered.push(place);
                for mv in &moves {
                    if mv.src_place() == Some(place) {
                        let d = indegrees.get_mut(&mv.to.place).unwrap();
                        assert!(*d > 0);
                        *d -= 1;
                        if *d == 0 {
                            queue.push(mv.to.place);
                        }
                    }
                }
            }

            if ordered.len() == nodes.len() {
                // The topological sort has given us an ordered sequence of nodes, from which we
                // derive an order for the moves: a move must happen before any move which writes
                // to its source, so moves whose destinations come last in the topological order
                // go first.
                let pos = |p: Placement| ordered.iter().position(|x| *x == p).unwrap();
                moves.sort_by_key(|mv| std::cmp::Reverse(pos(mv.to.place)));
                saves.extend(moves);
                saves.extend(const_moves);
                return saves;
            }

            // Every placement left in the graph has a non-zero indegree, and is written by exactly
            // one move. Following the moves backwards from any such placement must therefore lead
            // us round a cycle.
            let mut cur = nodes.iter().copied().find(|x| indegrees[x] > 0).unwrap();
            let mut seen = Vec::new();
            while !seen.contains(&cur) {
                seen.push(cur);
                cur = moves
                    .iter()
                    .find(|x| x.to.place == cur)
                    .and_then(|x| x.src_place())
                    .unwrap();
            }
            let var = moves
                .iter()
                .find(|x| x.src_place() == Some(cur))
                .map(|x| match x.from {
                    MoveSrc::Loc(l) => l.var,
                    MoveSrc::Const(_) => unreachable!(),
                })
                .unwrap();
            let scratch = Location::new(var, Placement::Stack(frame.scratch_slot(saves.len())));
            saves.push(Move::new(Location::new(var, cur), scratch));
            for mv in moves.iter_mut() {
                if mv.src_place() == Some(cur) {
                    mv.from = MoveSrc::Loc(scratch);
                }
            }
        }
    }
}
