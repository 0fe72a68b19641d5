//! Kestrel - an AlphaZero-style chess engine core.
//!
//! The heart of the crate is a batched parallel Monte Carlo Tree Search:
//! many game slots advance cooperatively on the CPU, park when they need a
//! network evaluation, and resume after one batched prediction. The tree
//! proves forced mates exactly, a fixed-memory set-associative cache
//! short-circuits repeated evaluations, and a UCI controller drives
//! interactive search with proper time control. The chess rules backend and
//! the network evaluator both sit behind traits.

pub mod cache;
pub mod config;
pub mod evaluator;
pub mod game;
pub mod position;
pub mod search;
pub mod storage;
pub mod uci;
