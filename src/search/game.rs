// src/search/game.rs
//! One search/self-play game slot: a position plus a pointer into the tree,
//! driven by the worker as a two-phase coroutine around batched predictions.

use crate::cache::{ChunkHandle, PredictionCache, MAX_CACHED_MOVES};
use crate::config::MiscConfig;
use crate::game::{flip_value, map_tanh_value, InputPlanes, MoveCodec, Mv, OutputPlanes};
use crate::position::{Position, PositionError};
use crate::search::arena::{NodeArena, NodeId};
use crate::search::node::TerminalValue;
use crate::storage::SavedGame;
use chess::Color;

/// Explicit coroutine state for a game slot. The worker owns the
/// continuation: a slot parks in `WaitingForPrediction` until the batched
/// evaluator fills its value/policy buffers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SelfPlayState {
    Working,
    WaitingForPrediction,
    Finished,
}

pub struct SearchGame<P: Position> {
    pos: P,
    root: Option<NodeId>,
    try_hard: bool,
    search_root_ply: i32,

    // Real-game bookkeeping (unused by scratch copies).
    history: Vec<Mv>,
    child_visits: Vec<Vec<(Mv, f32)>>,
    result: f32,

    // Coroutine state carried across the two phases.
    image_key: u64,
    cached_moves: Vec<Mv>,
    cached_priors: Vec<f32>,
}

impl<P: Position> SearchGame<P> {
    /// Fresh game at the starting position with its own tree root.
    pub fn new(arena: &mut NodeArena) -> Self {
        Self::with_position(arena, P::default(), false)
    }

    pub fn from_fen(
        arena: &mut NodeArena,
        fen: &str,
        moves: &[Mv],
        try_hard: bool,
    ) -> Result<Self, PositionError> {
        let mut pos = P::default();
        pos.set_from(fen, moves)?;
        Ok(Self::with_position(arena, pos, try_hard))
    }

    /// Slot placeholder with no position history and no tree; filled in by
    /// the worker's set-up paths.
    pub fn empty() -> Self {
        SearchGame {
            pos: P::default(),
            root: None,
            try_hard: false,
            search_root_ply: 0,
            history: Vec::new(),
            child_visits: Vec::new(),
            result: f32::NAN,
            image_key: 0,
            cached_moves: Vec::new(),
            cached_priors: Vec::new(),
        }
    }

    pub fn set_try_hard(&mut self, try_hard: bool) {
        self.try_hard = try_hard;
    }

    fn with_position(arena: &mut NodeArena, pos: P, try_hard: bool) -> Self {
        SearchGame {
            pos,
            root: Some(arena.alloc(0.0)),
            try_hard,
            search_root_ply: 0,
            history: Vec::new(),
            child_visits: Vec::new(),
            result: f32::NAN,
            image_key: 0,
            cached_moves: Vec::new(),
            cached_priors: Vec::new(),
        }
    }

    /// Turn this slot into a scratch copy of `other` for one simulation.
    /// The search root ply freezes at `other`'s current position; history
    /// and statistics stay behind.
    pub fn clone_scratch_from(&mut self, other: &Self) {
        self.pos.clone_from(&other.pos);
        self.root = other.root;
        self.try_hard = other.try_hard;
        self.search_root_ply = other.pos.ply();
    }

    /// Shadow slot for tree-parallel search: aliases the same tree but runs
    /// its own simulations with its own prediction buffers. The spawning
    /// slot remains the tree's owner for pruning.
    pub fn spawn_shadow(&self) -> Self {
        SearchGame {
            pos: self.pos.clone(),
            root: self.root,
            try_hard: self.try_hard,
            search_root_ply: self.pos.ply(),
            history: Vec::new(),
            child_visits: Vec::new(),
            result: f32::NAN,
            image_key: 0,
            cached_moves: Vec::new(),
            cached_priors: Vec::new(),
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn root_id(&self) -> NodeId {
        self.root.expect("game has no tree")
    }

    pub fn position(&self) -> &P {
        &self.pos
    }

    pub fn to_play(&self) -> Color {
        self.pos.to_play()
    }

    pub fn ply(&self) -> i32 {
        self.pos.ply()
    }

    pub fn try_hard(&self) -> bool {
        self.try_hard
    }

    pub fn history(&self) -> &[Mv] {
        &self.history
    }

    /// Final game result from White's perspective; only valid after
    /// [`SearchGame::complete`].
    pub fn result(&self) -> f32 {
        debug_assert!(!self.result.is_nan(), "complete() not called");
        self.result
    }

    pub fn apply_move_with_root(&mut self, mv: Mv, new_root: Option<NodeId>) {
        self.pos.apply_move(mv);
        self.root = new_root;
        // No visit adjustment here; scratch games come through this path too.
    }

    /// Apply a real game move, record it, and fix the new root's visit count
    /// to match the sum of its children from now on: zero for a terminal
    /// root, otherwise minus the one visit it received as a leaf before
    /// expansion.
    pub fn apply_move_with_root_and_history(
        &mut self,
        arena: &mut NodeArena,
        mv: Mv,
        new_root: NodeId,
    ) {
        self.apply_move_with_root(mv, Some(new_root));
        self.history.push(mv);

        let node = arena.node_mut(new_root);
        if node.children.is_empty() {
            node.visit_count = 0;
        } else {
            node.visit_count -= 1;
        }

        #[cfg(debug_assertions)]
        {
            let child_sum: i32 = arena
                .node(new_root)
                .children
                .iter()
                .map(|(_, child)| arena.node(*child).visit_count)
                .sum();
            debug_assert_eq!(arena.node(new_root).visit_count, child_sum);
        }
    }

    /// Two-phase expansion coroutine.
    ///
    /// Phase `Working`: immediate terminals and cache hits resolve on the
    /// CPU; otherwise legal moves and draw rules are checked, and if a
    /// network evaluation is needed the input planes are filled, the state
    /// flips to `WaitingForPrediction` and NaN comes back.
    ///
    /// Second call (after the evaluator ran): softmax the legal-move logits
    /// into priors, store through the retained cache handle, create the
    /// children, and return the value — always from the parent's to-play
    /// perspective, hence the flip of the network's self-perspective value.
    #[allow(clippy::too_many_arguments)]
    pub fn expand_and_evaluate(
        &mut self,
        state: &mut SelfPlayState,
        arena: &mut NodeArena,
        cache: &PredictionCache,
        misc: &MiscConfig,
        image: &mut InputPlanes,
        raw_value: f32,
        policy: &OutputPlanes,
        cache_store: &mut Option<ChunkHandle>,
    ) -> f32 {
        let root = self.root_id();
        debug_assert!(!arena.node(root).is_expanded());

        // A known-terminal leaf stays a leaf; answer repeat visits directly.
        if arena.node(root).terminal.is_immediate() {
            *state = SelfPlayState::Working;
            return arena.node(root).terminal.immediate_value();
        }

        if *state == SelfPlayState::Working {
            // Probe the cache. Self-play only probes up to a max ply: past
            // the opening it sees enough unique positions to thrash the
            // cache, while search wants everything recent kept hot.
            *cache_store = None;
            self.image_key = self.pos.zobrist_key();
            let mut cache_hit = None;
            if self.try_hard || self.pos.ply() <= misc.prediction_cache_max_ply {
                let (handle, hit) =
                    cache.probe(self.image_key, &mut self.cached_moves, &mut self.cached_priors);
                *cache_store = Some(handle);
                cache_hit = hit;
            }
            if let Some(hit) = cache_hit {
                for i in 0..hit.move_count {
                    let child = arena.alloc(self.cached_priors[i]);
                    arena
                        .node_mut(root)
                        .children
                        .push((self.cached_moves[i], child));
                }
                return hit.value;
            }

            self.pos.generate_legal_moves(&mut self.cached_moves);

            // No moves: checkmate (a win for the parent who delivered it)
            // or stalemate.
            if self.cached_moves.is_empty() {
                let terminal = if self.pos.is_in_check() {
                    TerminalValue::MateIn(1)
                } else {
                    TerminalValue::Draw
                };
                arena.node_mut(root).terminal = terminal;
                return terminal.immediate_value();
            }

            // Draw by 50-move rule, or by repetition relative to the search
            // root: one repetition strictly inside the search counts, two
            // anywhere count. Valid because the tree is path-dependent.
            let ply_to_search_root = self.pos.ply() - self.search_root_ply;
            if self.pos.is_draw_by_rule_or_repetition(ply_to_search_root) {
                arena.node_mut(root).terminal = TerminalValue::Draw;
                return TerminalValue::Draw.immediate_value();
            }

            self.pos.generate_input_planes(image);
            *state = SelfPlayState::WaitingForPrediction;
            return f32::NAN;
        }

        // A prediction arrived. Parent-perspective value.
        let value = flip_value(map_tanh_value(raw_value));

        self.cached_priors.clear();
        self.cached_priors.extend(
            self.cached_moves
                .iter()
                .map(|mv| MoveCodec::policy_logit(policy, *mv)),
        );
        softmax(&mut self.cached_priors);

        if let Some(handle) = *cache_store {
            // The cache caps the branching; apply the same cap to the tree
            // so a later hit expands the same children.
            if self.cached_moves.len() > MAX_CACHED_MOVES {
                limit_branching_to_best(
                    &mut self.cached_moves,
                    &mut self.cached_priors,
                    MAX_CACHED_MOVES,
                );
            }
            cache.store(
                handle,
                self.image_key,
                value,
                &self.cached_moves,
                &self.cached_priors,
            );
        }

        for (mv, prior) in self.cached_moves.iter().zip(&self.cached_priors) {
            let child = arena.alloc(*prior);
            arena.node_mut(root).children.push((*mv, child));
        }

        *state = SelfPlayState::Working;
        value
    }

    /// Record the root's normalized child-visit distribution for training.
    pub fn store_search_statistics(&mut self, arena: &NodeArena) {
        let root = arena.node(self.root_id());
        let child_visit_sum = root.visit_count.max(1) as f32;
        let visits = root
            .children
            .iter()
            .map(|(mv, child)| (*mv, arena.node(*child).visit_count as f32 / child_visit_sum))
            .collect();
        self.child_visits.push(visits);
    }

    /// Finish the game: derive the result from the root's terminal value
    /// (flipped from the parent's perspective to White's) and release the
    /// whole tree.
    pub fn complete(&mut self, arena: &mut NodeArena) {
        let immediate = arena.node(self.root_id()).terminal.immediate_value();
        let parent_to_play = !self.pos.to_play();
        self.result = if parent_to_play == Color::White {
            immediate
        } else {
            flip_value(immediate)
        };
        self.prune_all(arena);
    }

    pub fn save(&self) -> SavedGame {
        SavedGame {
            result: self.result(),
            moves: self.history.clone(),
            child_visits: self.child_visits.clone(),
        }
    }

    /// Free `old_root` and all siblings of the kept subtree. The caller must
    /// already have re-rooted this game at `kept`.
    pub fn prune_except(&mut self, arena: &mut NodeArena, old_root: NodeId, kept: NodeId) {
        debug_assert_eq!(self.root, Some(kept));
        debug_assert!(old_root != kept);
        arena.prune_except(old_root, kept);
    }

    pub fn prune_all(&mut self, arena: &mut NodeArena) {
        if let Some(root) = self.root.take() {
            arena.prune_all(root);
        }
    }
}

/// In-place softmax via log-sum-exp; invariant under additive shifts of the
/// input logits.
pub fn softmax(distribution: &mut [f32]) {
    if distribution.is_empty() {
        return;
    }
    let max = distribution.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum: f32 = distribution.iter().map(|x| (x - max).exp()).sum();
    let log_sum_exp = exp_sum.ln() + max;
    for x in distribution.iter_mut() {
        *x = (*x - log_sum_exp).exp();
    }
}

/// Keep the `limit` highest-prior moves, by partial selection sort so the
/// surviving order (highest first, ties by earlier original index) is the
/// order callers will see from the cache.
pub fn limit_branching_to_best(moves: &mut Vec<Mv>, priors: &mut Vec<f32>, limit: usize) {
    debug_assert!(moves.len() > limit);
    debug_assert_eq!(moves.len(), priors.len());
    for i in 0..limit {
        let mut max = i;
        for j in (i + 1)..priors.len() {
            if priors[j] > priors[max] {
                max = j;
            }
        }
        if max != i {
            moves.swap(i, max);
            priors.swap(i, max);
        }
    }
    moves.truncate(limit);
    priors.truncate(limit);
}
