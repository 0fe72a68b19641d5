// src/search/worker.rs
//! The MCTS worker: N game slots driven cooperatively on the CPU, one
//! batched network prediction once every slot has parked or finished a
//! simulation. Selection, backpropagation, mate proving and principal
//! variation maintenance all live here, as does the UCI-facing search loop.

use crate::cache::{ChunkHandle, PredictionCache};
use crate::config::Config;
use crate::evaluator::{EvalError, Evaluator};
use crate::game::{
    flip_value, probability_to_centipawns, zeroed_input_planes, zeroed_output_planes, InputPlanes,
    Mv, OutputPlanes,
};
use crate::position::{Position, STARTING_POSITION};
use crate::search::arena::{NodeArena, NodeId};
use crate::search::game::{SearchGame, SelfPlayState};
use crate::search::node::{Node, TerminalValue};
use crate::search::time::{allowed_clock_time_ms, TimeControl};
use crate::storage::{GameStore, WorkCoordinator};
use parking_lot::{Condvar, Mutex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// Thread-local deterministic RNGs, diverging across workers in the same
// process via entropy + time + a global counter.
static THREAD_SEED: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::seed_from_u64(
        rand::random::<u64>()
            .wrapping_add(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0),
            )
            .wrapping_add(THREAD_SEED.fetch_add(1, Ordering::Relaxed)),
    ));
}

fn with_rng<T>(f: impl FnOnce(&mut SmallRng) -> T) -> T {
    THREAD_RNG.with(|rng| f(&mut rng.borrow_mut()))
}

/// Live search bookkeeping for the slot-0 game of a searching worker.
pub struct SearchState {
    pub position_fen: String,
    pub position_moves: Vec<Mv>,
    pub searching: bool,
    pub search_start: Instant,
    pub last_principal_variation_print: Instant,
    pub time_control: TimeControl,
    pub node_count: i64,
    pub failed_node_count: i64,
    pub principal_variation_changed: bool,
}

impl Default for SearchState {
    fn default() -> Self {
        SearchState {
            position_fen: String::new(),
            position_moves: Vec::new(),
            searching: false,
            search_start: Instant::now(),
            last_principal_variation_print: Instant::now(),
            time_control: TimeControl::default(),
            node_count: 0,
            failed_node_count: 0,
            principal_variation_changed: false,
        }
    }
}

/// UCI-to-worker signal block. Flags are atomics polled between simulations
/// and batches; the strings and time control travel under the mutex. The
/// condvars wake the worker for `go`/`quit` and let the front end wait for
/// readiness.
pub struct SearchSignals {
    shared: Mutex<SignalShared>,
    signal_uci: Condvar,
    signal_ready: Condvar,
    pub quit: AtomicBool,
    pub debug: AtomicBool,
    search_updated: AtomicBool,
    search: AtomicBool,
    position_updated: AtomicBool,
}

#[derive(Default)]
struct SignalShared {
    ready: bool,
    time_control: TimeControl,
    position_fen: String,
    position_moves: Vec<Mv>,
}

impl Default for SearchSignals {
    fn default() -> Self {
        SearchSignals {
            shared: Mutex::new(SignalShared::default()),
            signal_uci: Condvar::new(),
            signal_ready: Condvar::new(),
            quit: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            search_updated: AtomicBool::new(false),
            search: AtomicBool::new(false),
            position_updated: AtomicBool::new(false),
        }
    }
}

impl SearchSignals {
    pub fn new() -> Self {
        SearchSignals::default()
    }

    pub fn signal_debug(&self, on: bool) {
        self.debug.store(on, Ordering::SeqCst);
    }

    pub fn signal_position(&self, fen: String, moves: Vec<Mv>) {
        let mut shared = self.shared.lock();
        shared.position_fen = fen;
        shared.position_moves = moves;
        self.position_updated.store(true, Ordering::SeqCst);
    }

    pub fn signal_search_go(&self, time_control: TimeControl) {
        let mut shared = self.shared.lock();
        shared.time_control = time_control;
        self.search_updated.store(true, Ordering::SeqCst);
        self.search.store(true, Ordering::SeqCst);
        self.signal_uci.notify_all();
    }

    pub fn signal_search_stop(&self) {
        let _shared = self.shared.lock();
        self.search_updated.store(true, Ordering::SeqCst);
        self.search.store(false, Ordering::SeqCst);
    }

    pub fn signal_quit(&self) {
        let _shared = self.shared.lock();
        self.quit.store(true, Ordering::SeqCst);
        self.signal_uci.notify_all();
    }

    pub fn wait_until_ready(&self) {
        let mut shared = self.shared.lock();
        while !shared.ready {
            self.signal_ready.wait(&mut shared);
        }
    }
}

/// A worker drives `prediction_batch_size` game slots. Each slot advances on
/// the CPU until it finishes a simulation or parks awaiting a prediction;
/// the caller then runs one batched prediction and resumes everyone. The
/// worker owns one node arena: trees never migrate across workers.
pub struct SearchWorker<P: Position> {
    config: Config,
    cache: Arc<PredictionCache>,
    arena: NodeArena,

    states: Vec<SelfPlayState>,
    images: Vec<InputPlanes>,
    values: Vec<f32>,
    policies: Vec<OutputPlanes>,

    games: Vec<SearchGame<P>>,
    scratch: Vec<SearchGame<P>>,
    game_starts: Vec<Instant>,
    simulations: Vec<i32>,
    search_paths: Vec<Vec<(Mv, NodeId)>>,
    cache_stores: Vec<Option<ChunkHandle>>,

    search_state: SearchState,
}

impl<P: Position> SearchWorker<P> {
    pub fn new(config: Config, cache: Arc<PredictionCache>) -> Self {
        let batch = config.self_play.prediction_batch_size.max(1);
        SearchWorker {
            config,
            cache,
            arena: NodeArena::new(),
            states: vec![SelfPlayState::Working; batch],
            images: vec![zeroed_input_planes(); batch],
            values: vec![0.0; batch],
            policies: vec![zeroed_output_planes(); batch],
            games: (0..batch).map(|_| SearchGame::empty()).collect(),
            scratch: (0..batch).map(|_| SearchGame::empty()).collect(),
            game_starts: vec![Instant::now(); batch],
            simulations: vec![0; batch],
            search_paths: (0..batch).map(|_| Vec::new()).collect(),
            cache_stores: vec![None; batch],
            search_state: SearchState::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.games.len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }

    pub fn game(&self, index: usize) -> &SearchGame<P> {
        &self.games[index]
    }

    pub fn game_mut(&mut self, index: usize) -> &mut SearchGame<P> {
        &mut self.games[index]
    }

    pub fn state(&self, index: usize) -> SelfPlayState {
        self.states[index]
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn policies_mut(&mut self) -> &mut [OutputPlanes] {
        &mut self.policies
    }

    pub fn search_state(&self) -> &SearchState {
        &self.search_state
    }

    pub fn search_state_mut(&mut self) -> &mut SearchState {
        &mut self.search_state
    }

    fn clear_game(&mut self, index: usize) {
        self.states[index] = SelfPlayState::Working;
        self.game_starts[index] = Instant::now();
        self.simulations[index] = 0;
        self.search_paths[index].clear();
        self.cache_stores[index] = None;
    }

    /// Fresh self-play game at the starting position.
    pub fn set_up_game(&mut self, index: usize) {
        self.clear_game(index);
        self.games[index].prune_all(&mut self.arena);
        self.games[index] = SearchGame::new(&mut self.arena);
    }

    pub fn set_up_game_from(
        &mut self,
        index: usize,
        fen: &str,
        moves: &[Mv],
        try_hard: bool,
    ) -> Result<(), crate::position::PositionError> {
        self.clear_game(index);
        self.games[index].prune_all(&mut self.arena);
        self.games[index] = SearchGame::from_fen(&mut self.arena, fen, moves, try_hard)?;
        Ok(())
    }

    /// Extend the existing game by `moves[offset..]`, preserving the matching
    /// subtree for each move that already has a child, else rebuilding.
    pub fn set_up_game_existing(
        &mut self,
        index: usize,
        moves: &[Mv],
        offset: usize,
        try_hard: bool,
    ) {
        self.clear_game(index);
        let Self { arena, games, .. } = self;
        let game = &mut games[index];
        game.set_try_hard(try_hard);

        for (i, mv) in moves.iter().enumerate().skip(offset) {
            let root = game.root();
            let child = root.and_then(|id| arena.node(id).child(*mv));
            match (root, child) {
                (Some(root_id), Some(child_id)) => {
                    game.apply_move_with_root_and_history(arena, *mv, child_id);
                    game.prune_except(arena, root_id, child_id);
                }
                _ => {
                    // No subtree to keep. Only the final position needs a
                    // live root.
                    let new_root = (i == moves.len() - 1).then(|| arena.alloc(0.0));
                    game.prune_all(arena);
                    game.apply_move_with_root(*mv, new_root);
                }
            }
        }
    }

    pub fn reset_games(&mut self) {
        for index in 0..self.games.len() {
            self.set_up_game(index);
        }
    }

    fn is_terminal(&self, index: usize) -> bool {
        let game = &self.games[index];
        self.arena.node(game.root_id()).terminal.is_immediate()
            || game.ply() >= self.config.self_play.max_moves
    }

    /// One CPU pass for a self-play slot: run simulations until the slot
    /// parks for a prediction, and apply a real move whenever a simulation
    /// budget completes. Ends the game when the root goes terminal or the
    /// move cap is hit.
    pub fn play(&mut self, index: usize) {
        {
            let Self {
                config,
                cache,
                arena,
                states,
                images,
                values,
                policies,
                games,
                cache_stores,
                ..
            } = self;
            let game = &mut games[index];
            if !arena.node(game.root_id()).is_expanded() {
                game.expand_and_evaluate(
                    &mut states[index],
                    arena,
                    cache,
                    &config.misc,
                    &mut images[index],
                    values[index],
                    &policies[index],
                    &mut cache_stores[index],
                );
                if states[index] == SelfPlayState::WaitingForPrediction {
                    return;
                }
            }
        }

        while !self.is_terminal(index) {
            let selected = self.run_mcts(index);
            if self.states[index] == SelfPlayState::WaitingForPrediction {
                return;
            }
            let Some((mv, new_root)) = selected else {
                // Self-play simulations cannot fail; no move means the tree
                // is in no state to continue this game.
                log::error!(
                    "no move selectable at ply {}; abandoning game",
                    self.games[index].ply()
                );
                break;
            };

            let Self {
                arena,
                games,
                search_state,
                ..
            } = self;
            let game = &mut games[index];
            let old_root = game.root_id();
            game.store_search_statistics(arena);
            game.apply_move_with_root_and_history(arena, mv, new_root);
            game.prune_except(arena, old_root, new_root);
            // The first move of the old principal variation is gone.
            search_state.principal_variation_changed = true;
        }

        let Self {
            arena,
            games,
            states,
            ..
        } = self;
        games[index].complete(arena);
        states[index] = SelfPlayState::Finished;
    }

    /// Run simulations for one slot until the budget completes (returning
    /// the selected move) or the slot parks/fails (returning None).
    pub fn run_mcts(&mut self, index: usize) -> Option<(Mv, NodeId)> {
        let Self {
            config,
            cache,
            arena,
            states,
            images,
            values,
            policies,
            games,
            scratch,
            simulations,
            search_paths,
            cache_stores,
            search_state,
            ..
        } = self;
        run_mcts_slot(
            config,
            arena,
            cache,
            &mut games[index],
            &mut scratch[index],
            &mut states[index],
            &mut simulations[index],
            &mut search_paths[index],
            &mut cache_stores[index],
            &mut images[index],
            values[index],
            &policies[index],
            search_state,
        )
    }

    /// Self-play driver: keep all slots busy, hand finished games to
    /// storage, and fire one batched prediction per pass.
    pub fn play_games(
        &mut self,
        coordinator: &WorkCoordinator,
        storage: &mut dyn GameStore,
        evaluator: &dyn Evaluator,
    ) -> Result<(), EvalError> {
        while coordinator.wait_for_work_items() {
            // Discard games in progress so new ones use the new network.
            self.reset_games();

            while !coordinator.all_work_items_completed() {
                for index in 0..self.games.len() {
                    self.play(index);

                    // Whole games can finish on the CPU via the prediction
                    // cache, so loop.
                    while self.states[index] == SelfPlayState::Finished
                        && !coordinator.all_work_items_completed()
                    {
                        self.save_to_storage_and_log(index, storage);
                        coordinator.on_work_item_completed();
                        self.set_up_game(index);
                        self.play(index);
                    }
                }

                evaluator.predict_batch(
                    self.games.len(),
                    &self.images,
                    &mut self.values,
                    &mut self.policies,
                )?;
            }
        }
        Ok(())
    }

    fn save_to_storage_and_log(&mut self, index: usize, storage: &mut dyn GameStore) {
        let game = &self.games[index];
        let ply = game.ply();
        let result = game.result();
        let game_number = storage.add_game(game.save());
        let game_time = self.game_starts[index].elapsed().as_secs_f32();
        log::info!(
            "game {}, ply {}, time {:.1}s, mcts time {:.3}s, result {}",
            game_number,
            ply,
            game_time,
            game_time / ply.max(1) as f32,
            result
        );
    }

    // ---- UCI search ----

    /// Worker half of the UCI state machine: sleep until `go`, then pump
    /// tree-parallel simulations through batched predictions until told to
    /// stop, the clock runs out, or the position changes underneath.
    pub fn search_loop(&mut self, signals: &SearchSignals, evaluator: &dyn Evaluator) {
        // A naked "go" searches the starting position.
        {
            let mut shared = signals.shared.lock();
            if !signals.position_updated.load(Ordering::SeqCst) {
                signals.position_updated.store(true, Ordering::SeqCst);
                shared.position_fen = STARTING_POSITION.to_string();
                shared.position_moves.clear();
            }
        }

        let parallelism = self
            .config
            .misc
            .search_mcts_parallelism
            .min(self.games.len())
            .max(1);

        while !signals.quit.load(Ordering::SeqCst) {
            {
                let mut shared = signals.shared.lock();
                if !shared.ready {
                    shared.ready = true;
                    signals.signal_ready.notify_all();
                }
                while !signals.quit.load(Ordering::SeqCst) && !signals.search.load(Ordering::SeqCst)
                {
                    signals.signal_uci.wait(&mut shared);
                }
            }
            if signals.quit.load(Ordering::SeqCst) {
                break;
            }

            self.update_position(signals);
            self.update_search(signals);
            if !self.search_state.searching {
                continue;
            }

            self.search_initialize(parallelism);

            let mut evaluator_failed = false;
            while !signals.quit.load(Ordering::SeqCst)
                && !signals.position_updated.load(Ordering::SeqCst)
                && self.search_state.searching
            {
                self.search_play(parallelism);
                if let Err(error) = evaluator.predict_batch(
                    parallelism,
                    &self.images,
                    &mut self.values,
                    &mut self.policies,
                ) {
                    log::error!("evaluator failed during search: {}", error);
                    evaluator_failed = true;
                    break;
                }
                self.check_print_info(signals.debug.load(Ordering::SeqCst));
                self.check_time_control();
                self.update_search(signals);
            }
            self.on_search_finished(signals, evaluator_failed);
        }

        let Self { arena, games, .. } = self;
        games[0].prune_all(arena);
    }

    fn update_position(&mut self, signals: &SearchSignals) {
        debug_assert!(!self.search_state.searching);
        if !signals.position_updated.load(Ordering::SeqCst) {
            return;
        }

        // Take the position and clear the flag under one lock: a quick
        // double update either lands entirely before the take or re-raises
        // the flag after, and both are fine.
        let (fen, moves) = {
            let mut shared = signals.shared.lock();
            let fen = std::mem::take(&mut shared.position_fen);
            let moves = std::mem::take(&mut shared.position_moves);
            signals.position_updated.store(false, Ordering::SeqCst);
            (fen, moves)
        };

        let extends_current = self.games[0].root().is_some()
            && fen == self.search_state.position_fen
            && moves.len() >= self.search_state.position_moves.len()
            && moves.starts_with(&self.search_state.position_moves);

        if extends_current {
            if signals.debug.load(Ordering::SeqCst) {
                println!(
                    "info string [position] reusing tree with {} additional moves",
                    moves.len() - self.search_state.position_moves.len()
                );
            }
            let offset = self.search_state.position_moves.len();
            self.set_up_game_existing(0, &moves, offset, true);
        } else {
            if signals.debug.load(Ordering::SeqCst) {
                println!("info string [position] creating new position");
            }
            if let Err(error) = self.set_up_game_from(0, &fen, &moves, true) {
                log::warn!("bad position '{}': {}; using start position", fen, error);
                let _ = self.set_up_game_from(0, STARTING_POSITION, &[], true);
            }
        }

        self.search_state.position_fen = fen;
        self.search_state.position_moves = moves;
    }

    fn update_search(&mut self, signals: &SearchSignals) {
        if !signals.search_updated.load(Ordering::SeqCst) {
            return;
        }
        let shared = signals.shared.lock();
        self.search_state.searching = signals.search.load(Ordering::SeqCst);

        if self.search_state.searching {
            self.search_state.search_start = Instant::now();
            self.search_state.last_principal_variation_print = self.search_state.search_start;
            self.search_state.time_control = shared.time_control;
            self.search_state.node_count = 0;
            self.search_state.failed_node_count = 0;
            // Print an initial PV.
            self.search_state.principal_variation_changed = true;
        }

        // Drop the instruction so the worker sleeps when this search ends,
        // unless another "go" arrives meanwhile.
        signals.search.store(false, Ordering::SeqCst);
        signals.search_updated.store(false, Ordering::SeqCst);
    }

    fn search_initialize(&mut self, parallelism: usize) {
        self.clear_game(0);

        // Shadow slots share slot 0's tree but keep their own prediction
        // buffers. Slot 0 stays the owner for pruning.
        for index in 1..parallelism {
            self.clear_game(index);
            let state = self.states[0];
            let start = self.game_starts[0];
            let shadow = self.games[0].spawn_shadow();
            self.states[index] = state;
            self.game_starts[index] = start;
            self.games[index] = shadow;
        }

        self.cache.reset_probe_metrics();
    }

    fn search_play(&mut self, parallelism: usize) {
        {
            let Self {
                config,
                cache,
                arena,
                states,
                images,
                values,
                policies,
                games,
                cache_stores,
                ..
            } = self;
            let game = &mut games[0];
            if !arena.node(game.root_id()).is_expanded() {
                game.expand_and_evaluate(
                    &mut states[0],
                    arena,
                    cache,
                    &config.misc,
                    &mut images[0],
                    values[0],
                    &policies[0],
                    &mut cache_stores[0],
                );
                if states[0] == SelfPlayState::WaitingForPrediction {
                    return;
                }
            }
        }

        for index in 0..parallelism {
            self.run_mcts(index);
        }
    }

    fn on_search_finished(&mut self, signals: &SearchSignals, evaluator_failed: bool) {
        // We may have finished via stop, position update or quit.
        self.search_state.searching = false;

        if evaluator_failed {
            println!("bestmove 0000");
        } else {
            let best = {
                let Self {
                    config,
                    arena,
                    games,
                    ..
                } = self;
                select_move(config, arena, &games[0])
            };
            self.print_principal_variation(signals.debug.load(Ordering::SeqCst));
            match best {
                Some((mv, _)) => println!("bestmove {}", mv),
                None => println!("bestmove 0000"),
            }
        }

        // Clear "search" so the worker sleeps, but only if no new search
        // arrived while we were finishing.
        let _shared = signals.shared.lock();
        if !signals.search_updated.load(Ordering::SeqCst) {
            signals.search.store(false, Ordering::SeqCst);
        }
    }

    fn check_print_info(&mut self, debug: bool) {
        if self.search_state.principal_variation_changed
            || self.search_state.last_principal_variation_print.elapsed()
                >= Duration::from_secs(5)
        {
            self.print_principal_variation(debug);
            self.search_state.principal_variation_changed = false;
        }
    }

    /// Stop-condition priority: always at least one simulation, then
    /// infinite, fixed move time, node budget, game clock, and finally a
    /// plain simulation budget.
    fn check_time_control(&mut self) {
        let Some(root) = self.games[0].root() else {
            return;
        };
        if self.arena.node(root).best_child.is_none() {
            return;
        }

        let time_control = self.search_state.time_control;
        if time_control.infinite {
            return;
        }

        let elapsed_ms = self.search_state.search_start.elapsed().as_millis() as i64;

        if time_control.move_time_ms > 0 {
            if elapsed_ms >= time_control.move_time_ms {
                self.search_state.searching = false;
            }
            return;
        }

        if time_control.node_budget > 0 {
            if self.search_state.node_count >= time_control.node_budget {
                self.search_state.searching = false;
            }
            return;
        }

        if let Some(allowed_ms) =
            allowed_clock_time_ms(&time_control, self.games[0].to_play(), &self.config.misc)
        {
            if elapsed_ms >= allowed_ms {
                self.search_state.searching = false;
            }
            return;
        }

        // No usable clock at all: make a quick training-style move.
        if self.simulations[0] >= self.config.self_play.num_simulations {
            self.search_state.searching = false;
        }
    }

    fn print_principal_variation(&mut self, debug: bool) {
        let Some(root_id) = self.games[0].root() else {
            return;
        };
        if self.arena.node(root_id).best_child.is_none() {
            return;
        }

        let mut principal_variation = Vec::new();
        let mut node_id = root_id;
        while let Some((mv, next)) = self.arena.node(node_id).best_child {
            principal_variation.push(mv);
            node_id = next;
        }

        self.search_state.last_principal_variation_print = Instant::now();

        // The first PV node's value is from the parent's perspective, which
        // is exactly the root's point of view.
        let (_, first_id) = self.arena.node(root_id).best_child.unwrap();
        let first = self.arena.node(first_id);
        let either_mate_n = first.terminal.either_mate_n();
        let value = first.value();
        let depth = principal_variation.len();
        let search_time_ms = self.search_state.search_start.elapsed().as_millis() as i64;
        let node_count = self.search_state.node_count;
        let nodes_per_second = node_count * 1000 / search_time_ms.max(1);
        let hashfull = self.cache.permille_full();

        let score = if either_mate_n != 0 {
            format!("mate {}", either_mate_n)
        } else {
            format!("cp {}", probability_to_centipawns(value))
        };
        let pv_text: Vec<String> = principal_variation.iter().map(Mv::to_string).collect();
        println!(
            "info depth {} score {} nodes {} nps {} time {} hashfull {} pv {}",
            depth,
            score,
            node_count,
            nodes_per_second,
            search_time_ms,
            hashfull,
            pv_text.join(" ")
        );

        if debug {
            println!(
                "info string [cache] hitrate {} evictionrate {} failednodes {}",
                self.cache.permille_hits(),
                self.cache.permille_evictions(),
                self.search_state.failed_node_count
            );
        }
    }
}

/// One slot's simulation loop. Searching slots cap each burst so the
/// controller can check PV changes and stopping between batches even when
/// cache hits and terminals keep everything on the CPU.
#[allow(clippy::too_many_arguments)]
fn run_mcts_slot<P: Position>(
    config: &Config,
    arena: &mut NodeArena,
    cache: &PredictionCache,
    game: &mut SearchGame<P>,
    scratch: &mut SearchGame<P>,
    state: &mut SelfPlayState,
    simulation: &mut i32,
    search_path: &mut Vec<(Mv, NodeId)>,
    cache_store: &mut Option<ChunkHandle>,
    image: &mut InputPlanes,
    raw_value: f32,
    policy: &OutputPlanes,
    search_state: &mut SearchState,
) -> Option<(Mv, NodeId)> {
    let target_simulations = if game.try_hard() {
        *simulation + 1000
    } else {
        config.self_play.num_simulations
    };

    while *simulation < target_simulations {
        if *state == SelfPlayState::Working {
            if *simulation == 0 && !game.try_hard() {
                add_exploration_noise(config, arena, game.root_id());
            }

            // Tree parallelism needs guidance away from repeating the same
            // deterministic selections: virtual visits lower the UCB
            // incentive along in-flight paths, and reserved leaves are
            // skipped outright.
            scratch.clone_scratch_from(game);
            search_path.clear();
            search_path.push((Mv::NONE, scratch.root_id()));
            arena.node_mut(scratch.root_id()).visiting_count += 1;

            while arena.node(scratch.root_id()).is_expanded() {
                let Some((mv, child)) = select_child(config, arena, scratch.root_id()) else {
                    // Every child is being expanded elsewhere. Give up on
                    // this simulation; just unwind the virtual visits.
                    debug_assert!(game.try_hard());
                    for (_, node_id) in search_path.iter() {
                        arena.node_mut(*node_id).visiting_count -= 1;
                    }
                    search_state.failed_node_count += 1;
                    return None;
                };
                scratch.apply_move_with_root(mv, Some(child));
                search_path.push((mv, child));
                arena.node_mut(child).visiting_count += 1;
            }
        }

        let was_immediate_mate =
            arena.node(scratch.root_id()).terminal == TerminalValue::MateIn(1);
        let value = scratch.expand_and_evaluate(
            state,
            arena,
            cache,
            &config.misc,
            image,
            raw_value,
            policy,
            cache_store,
        );
        if *state == SelfPlayState::WaitingForPrediction {
            // The leaf will expand when the prediction returns but is not
            // yet visibly expanded; mark it off-limits to parallel
            // selectors.
            arena.node_mut(scratch.root_id()).expanding = true;
            return None;
        }
        arena.node_mut(scratch.root_id()).expanding = false;

        // The value is from the final scratch node's parent perspective;
        // start applying it at the real game's root perspective, flipping
        // once if the two sides to play differ.
        debug_assert!(!value.is_nan());
        let value = if game.to_play() != scratch.to_play() {
            flip_value(value)
        } else {
            value
        };
        backpropagate(arena, search_path, value);
        search_state.node_count += 1;

        // If this leaf just turned out to be a checkmate, prove it backwards
        // as far as possible.
        if !was_immediate_mate && arena.node(scratch.root_id()).terminal.is_mate_in_n() {
            backpropagate_mate(arena, search_path, config.self_play.max_moves, search_state);
        }

        update_principal_variation(arena, search_path, config.self_play.max_moves, search_state);
        #[cfg(debug_assertions)]
        validate_principal_variation(arena, scratch.root_id(), config.self_play.max_moves);

        *simulation += 1;
    }

    *simulation = 0;
    select_move(config, arena, game)
}

/// Pick the highest-UCB child that is not reserved by a parallel expansion.
/// `None` when every child is blocked.
pub fn select_child(config: &Config, arena: &NodeArena, parent: NodeId) -> Option<(Mv, NodeId)> {
    let parent_node = arena.node(parent);
    let mut max_score = f32::NEG_INFINITY;
    let mut max_child = None;
    for (mv, child_id) in &parent_node.children {
        let child = arena.node(*child_id);
        if child.expanding {
            continue;
        }
        let score = calculate_ucb_score(config, parent_node, child);
        if score > max_score {
            max_score = score;
            max_child = Some((*mv, *child_id));
        }
    }
    max_child
}

/// PUCT with virtual visits folded into both visit counts, plus the
/// tabulated incentive for proven mates.
pub fn calculate_ucb_score(config: &Config, parent: &Node, child: &Node) -> f32 {
    let self_play = &config.self_play;
    let parent_virtual_exploration = (parent.visit_count + parent.visiting_count) as f32;
    let child_virtual_exploration = (child.visit_count + child.visiting_count) as f32;
    let exploration_rate = (((parent_virtual_exploration + self_play.exploration_rate_base + 1.0)
        / self_play.exploration_rate_base)
        .ln()
        + self_play.exploration_rate_init)
        * parent_virtual_exploration.sqrt()
        / (child_virtual_exploration + 1.0);

    let prior_score = exploration_rate * child.prior;
    let mate_score = child.terminal.mate_score(exploration_rate);

    child.value() + prior_score + mate_score
}

/// Commit one simulation's value along the path, retiring the virtual
/// visits. Each ply flips the perspective.
pub fn backpropagate(arena: &mut NodeArena, search_path: &[(Mv, NodeId)], mut value: f32) {
    for (_, node_id) in search_path {
        let node = arena.node_mut(*node_id);
        node.visiting_count -= 1;
        node.visit_count += 1;
        node.value_sum += value;
        value = flip_value(value);
    }
}

/// Exact mate propagation after a leaf became `MateIn(n)`.
///
/// From scratch the rules would be: a parent with *any* mate-in-N child is
/// opponent-mate-in-N (taking the fastest); a parent whose children are
/// *all* opponent-mates is mate-in-(M+1) (the opponent takes the slowest).
/// Values were consistent before this leaf changed, so alternating
/// odd/even checks that stop at the first no-change suffice.
pub fn backpropagate_mate(
    arena: &mut NodeArena,
    search_path: &[(Mv, NodeId)],
    max_moves: i32,
    search_state: &mut SearchState,
) {
    let mut child_is_mate = true;
    for i in (0..search_path.len().saturating_sub(1)).rev() {
        let parent_id = search_path[i].1;

        if child_is_mate {
            // The path child just became a mate, or a faster mate. Does that
            // make the parent a (faster) opponent mate?
            let child_id = search_path[i + 1].1;
            let new_mate_n = arena.node(child_id).terminal.mate_n();
            debug_assert!(new_mate_n > 0);
            let parent_terminal = arena.node(parent_id).terminal;
            if !parent_terminal.is_opponent_mate_in_n()
                || new_mate_n < parent_terminal.opponent_mate_n()
            {
                arena.node_mut(parent_id).terminal =
                    TerminalValue::OpponentMateIn(new_mate_n as u16);

                // The parent just became worse, so the grandparent may need
                // a different best child; the regular PV update assumes the
                // search path only ever improves.
                if i >= 1 {
                    let grandparent_id = search_path[i - 1].1;
                    fix_principal_variation(
                        arena,
                        search_path,
                        grandparent_id,
                        max_moves,
                        search_state,
                    );
                }
            } else {
                return;
            }
        } else {
            // The path child became an opponent mate. The parent is a mate
            // only if every child now is; the mated side holds out with the
            // slowest one.
            let child_count = arena.node(parent_id).children.len();
            let mut longest_child_opponent_mate_n = 0;
            for child_index in 0..child_count {
                let child_id = arena.node(parent_id).children[child_index].1;
                let child_opponent_mate_n = arena.node(child_id).terminal.opponent_mate_n();
                if child_opponent_mate_n <= 0 {
                    return;
                }
                longest_child_opponent_mate_n =
                    longest_child_opponent_mate_n.max(child_opponent_mate_n);
            }
            debug_assert!(longest_child_opponent_mate_n > 0);
            arena.node_mut(parent_id).terminal =
                TerminalValue::MateIn((longest_child_opponent_mate_n + 1) as u16);
        }

        child_is_mate = !child_is_mate;
    }
}

/// Re-run the best-child comparison over all of `parent`'s children after
/// one of them got worse. Flags a PV change only if `parent` was on the PV.
pub fn fix_principal_variation(
    arena: &mut NodeArena,
    search_path: &[(Mv, NodeId)],
    parent_id: NodeId,
    max_moves: i32,
    search_state: &mut SearchState,
) {
    let mut updated_best_child = false;
    let child_count = arena.node(parent_id).children.len();
    for child_index in 0..child_count {
        let (mv, child_id) = arena.node(parent_id).children[child_index];
        let best = arena.node(parent_id).best_child;
        let best_node = best.map(|(_, id)| arena.node(id));
        if worse_than(best_node, arena.node(child_id), max_moves) {
            arena.node_mut(parent_id).best_child = Some((mv, child_id));
            updated_best_child = true;
        }
    }

    if updated_best_child {
        for i in 0..search_path.len().saturating_sub(1) {
            if search_path[i].1 == parent_id {
                search_state.principal_variation_changed = true;
                break;
            }
            let on_pv = arena.node(search_path[i].1).best_child.map(|(_, id)| id)
                == Some(search_path[i + 1].1);
            if !on_pv {
                break;
            }
        }
    }
}

/// Walk the path and promote any node that now beats its parent's best
/// child. Sets the PV-changed flag only while still on the existing PV.
pub fn update_principal_variation(
    arena: &mut NodeArena,
    search_path: &[(Mv, NodeId)],
    max_moves: i32,
    search_state: &mut SearchState,
) {
    let mut is_principal_variation = true;
    for i in 0..search_path.len().saturating_sub(1) {
        let parent_id = search_path[i].1;
        let (mv, next_id) = search_path[i + 1];
        let best = arena.node(parent_id).best_child;
        let best_node = best.map(|(_, id)| arena.node(id));
        if worse_than(best_node, arena.node(next_id), max_moves) {
            arena.node_mut(parent_id).best_child = Some((mv, next_id));
            search_state.principal_variation_changed |= is_principal_variation;
        } else {
            is_principal_variation &= best.map(|(_, id)| id) == Some(next_id);
        }
    }
}

/// Debug check: no visited child may beat its parent's best child anywhere
/// along the best-child chain from `node_id` down.
pub fn validate_principal_variation(arena: &NodeArena, mut node_id: NodeId, max_moves: i32) {
    loop {
        let node = arena.node(node_id);
        for (_, child_id) in &node.children {
            if arena.node(*child_id).visit_count > 0 {
                let best_node = node.best_child.map(|(_, id)| arena.node(id));
                debug_assert!(
                    !worse_than(best_node, arena.node(*child_id), max_moves),
                    "best child is not best"
                );
            }
        }
        match node.best_child {
            Some((_, next)) => node_id = next,
            None => break,
        }
    }
}

/// Strict sibling ordering: faster self-mates first, then unknown/draw by
/// visit count, then slower opponent-mates first. An undefined LHS loses to
/// any defined RHS.
pub fn worse_than(lhs: Option<&Node>, rhs: &Node, max_moves: i32) -> bool {
    let Some(lhs) = lhs else {
        return true;
    };

    let mut lhs_either_mate_n = lhs.terminal.either_mate_n();
    let mut rhs_either_mate_n = rhs.terminal.either_mate_n();
    if lhs_either_mate_n != rhs_either_mate_n {
        // For categories (>0, 0, <0), bigger is better. Within categories
        // (1 vs. 3, -2 vs. -4), smaller is better. Add a large term opposing
        // the category sign, then say smaller is better overall.
        lhs_either_mate_n +=
            ((lhs_either_mate_n < 0) as i32 - (lhs_either_mate_n > 0) as i32) * 2 * max_moves;
        rhs_either_mate_n +=
            ((rhs_either_mate_n < 0) as i32 - (rhs_either_mate_n > 0) as i32) * 2 * max_moves;
        return lhs_either_mate_n > rhs_either_mate_n;
    }

    lhs.visit_count < rhs.visit_count
}

/// Dirichlet exploration noise over the root's children, self-play only:
/// per-child gamma draws normalized and blended into the priors.
pub fn add_exploration_noise(config: &Config, arena: &mut NodeArena, root: NodeId) {
    let child_count = arena.node(root).children.len();
    if child_count == 0 {
        return;
    }

    let Ok(gamma) = Gamma::<f32>::new(config.self_play.root_dirichlet_alpha, 1.0) else {
        log::warn!(
            "invalid dirichlet alpha {}; skipping exploration noise",
            config.self_play.root_dirichlet_alpha
        );
        return;
    };
    let mut noise = Vec::with_capacity(child_count);
    with_rng(|rng| {
        for _ in 0..child_count {
            noise.push(gamma.sample(rng));
        }
    });
    let noise_sum: f32 = noise.iter().sum();
    if noise_sum <= 0.0 {
        return;
    }

    let fraction = config.self_play.root_exploration_fraction;
    for (child_index, noise) in noise.iter().enumerate() {
        let child_id = arena.node(root).children[child_index].1;
        let normalized = noise / noise_sum;
        debug_assert!(!normalized.is_nan());
        let child = arena.node_mut(child_id);
        child.prior = child.prior * (1.0 - fraction) + normalized * fraction;
    }
}

/// Pick the real move to play: temperature-1 visit sampling early in
/// self-play, otherwise the best child (which already encodes mate
/// preferences and visit counts).
pub fn select_move<P: Position>(
    config: &Config,
    arena: &NodeArena,
    game: &SearchGame<P>,
) -> Option<(Mv, NodeId)> {
    let root = arena.node(game.root_id());

    if !game.try_hard() && game.ply() < config.self_play.num_sampling_moves {
        // Temperature 1: visit counts are already the distribution.
        let sum_child_visits = root.visit_count;
        if sum_child_visits > 0 {
            let mut sample = with_rng(|rng| rng.gen_range(0..sum_child_visits));
            for (mv, child_id) in &root.children {
                let visit_count = arena.node(*child_id).visit_count;
                if sample < visit_count {
                    return Some((*mv, *child_id));
                }
                sample -= visit_count;
            }
        }
        // Inconsistent counts; fall through to the best child.
    }

    if let Some(best) = root.best_child {
        return Some(best);
    }

    log::error!("no best child at move selection; degrading to most-visited");
    root.children
        .iter()
        .max_by_key(|(_, child_id)| arena.node(*child_id).visit_count)
        .map(|(mv, child_id)| (*mv, *child_id))
}
