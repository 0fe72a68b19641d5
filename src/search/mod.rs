// src/search/mod.rs
//! Batched parallel MCTS: tree storage, game slots, the worker, and time
//! control.

pub mod arena;
pub mod game;
pub mod node;
pub mod time;
pub mod worker;

pub use arena::{NodeArena, NodeId};
pub use game::{SearchGame, SelfPlayState};
pub use node::{Node, TerminalValue};
pub use time::TimeControl;
pub use worker::{SearchSignals, SearchState, SearchWorker};
