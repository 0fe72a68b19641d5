// src/storage.rs
//! Hand-off seam for completed self-play games, plus the little gate that
//! dispenses game quotas to worker threads.

use crate::game::Mv;
use parking_lot::{Condvar, Mutex};

/// A finished game as training data: White-perspective result, the move
/// list, and the per-move normalized child-visit distributions.
#[derive(Clone, Debug)]
pub struct SavedGame {
    pub result: f32,
    pub moves: Vec<Mv>,
    pub child_visits: Vec<Vec<(Mv, f32)>>,
}

/// Where completed games go. Chunked/TFRecord storage lives behind this
/// trait, outside the search core.
pub trait GameStore: Send {
    /// Store a game, returning its game number.
    fn add_game(&mut self, game: SavedGame) -> usize;

    fn games_stored(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryStore {
    games: Vec<SavedGame>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }

    pub fn games(&self) -> &[SavedGame] {
        &self.games
    }
}

impl GameStore for InMemoryStore {
    fn add_game(&mut self, game: SavedGame) -> usize {
        self.games.push(game);
        self.games.len()
    }

    fn games_stored(&self) -> usize {
        self.games.len()
    }
}

/// Store shared by several worker threads; a coarse lock is fine because
/// games complete at a human-scale rate.
pub struct SharedStore<S: GameStore> {
    inner: std::sync::Arc<Mutex<S>>,
}

impl<S: GameStore> SharedStore<S> {
    pub fn new(inner: std::sync::Arc<Mutex<S>>) -> Self {
        SharedStore { inner }
    }
}

impl<S: GameStore> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        SharedStore {
            inner: self.inner.clone(),
        }
    }
}

impl<S: GameStore> GameStore for SharedStore<S> {
    fn add_game(&mut self, game: SavedGame) -> usize {
        self.inner.lock().add_game(game)
    }

    fn games_stored(&self) -> usize {
        self.inner.lock().games_stored()
    }
}

/// Counts work items (games) out to self-play workers. A coordinator thread
/// posts a quota; workers block until work exists, tick items off as games
/// finish, and drain out when the quota is spent or the gate shuts down.
pub struct WorkCoordinator {
    state: Mutex<CoordinatorState>,
    work_available: Condvar,
}

struct CoordinatorState {
    remaining: i64,
    shut_down: bool,
}

impl Default for WorkCoordinator {
    fn default() -> Self {
        WorkCoordinator::new()
    }
}

impl WorkCoordinator {
    pub fn new() -> Self {
        WorkCoordinator {
            state: Mutex::new(CoordinatorState {
                remaining: 0,
                shut_down: false,
            }),
            work_available: Condvar::new(),
        }
    }

    pub fn post_work(&self, items: i64) {
        let mut state = self.state.lock();
        state.remaining = items;
        self.work_available.notify_all();
    }

    pub fn shut_down(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        self.work_available.notify_all();
    }

    /// Block until work exists. Returns false when the gate is shut down.
    pub fn wait_for_work_items(&self) -> bool {
        let mut state = self.state.lock();
        while state.remaining <= 0 && !state.shut_down {
            self.work_available.wait(&mut state);
        }
        !state.shut_down
    }

    pub fn on_work_item_completed(&self) {
        let mut state = self.state.lock();
        state.remaining -= 1;
    }

    pub fn all_work_items_completed(&self) -> bool {
        let state = self.state.lock();
        state.remaining <= 0 || state.shut_down
    }
}
