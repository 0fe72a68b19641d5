// src/uci/mod.rs
//! UCI front end. The stdin loop parses commands and flips signals; a
//! dedicated worker thread owns the tree, the prediction cache and the
//! actual search. Protocol errors are never fatal: unknown commands are
//! ignored, bad moves drop the rest of their list with a warning.

use crate::config::Config;
use crate::evaluator::Evaluator;
use crate::game::Mv;
use crate::position::{ChessPosition, Position, STARTING_POSITION};
use crate::search::time::{color_index, TimeControl};
use crate::search::worker::{SearchSignals, SearchWorker};
use crate::cache::PredictionCache;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread::JoinHandle;

pub const ENGINE_NAME: &str = "Kestrel 0.1";
pub const ENGINE_AUTHOR: &str = "the Kestrel authors";

/// Run the UCI loop until `quit`. The evaluator factory runs on the worker
/// thread, where slow backend start-up belongs.
pub fn run<F>(config: Config, evaluator_factory: F) -> anyhow::Result<()>
where
    F: FnOnce() -> Box<dyn Evaluator> + Send + 'static,
{
    let signals = Arc::new(SearchSignals::new());
    let worker = spawn_worker(config, signals.clone(), evaluator_factory);

    let mut handler = UciHandler::new(signals.clone());
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !handler.handle_command(line) {
            break;
        }
    }

    // End of input counts as quit.
    signals.signal_quit();
    let _ = worker.join();
    Ok(())
}

fn spawn_worker<F>(
    config: Config,
    signals: Arc<SearchSignals>,
    evaluator_factory: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Box<dyn Evaluator> + Send + 'static,
{
    std::thread::spawn(move || {
        // Heavy set-up stays off the protocol thread: the process-wide
        // prediction cache and the network backend.
        let cache = Arc::new(PredictionCache::new(config.misc.prediction_cache_size_gb));
        let evaluator = evaluator_factory();
        let mut worker: SearchWorker<ChessPosition> = SearchWorker::new(config, cache);
        worker.search_loop(&signals, evaluator.as_ref());
    })
}

struct UciHandler {
    signals: Arc<SearchSignals>,
    /// Mirror of the GUI's position, used to validate incoming moves before
    /// they reach the worker.
    mirror: ChessPosition,
    position_fen: String,
    position_moves: Vec<Mv>,
}

impl UciHandler {
    fn new(signals: Arc<SearchSignals>) -> Self {
        UciHandler {
            signals,
            mirror: ChessPosition::default(),
            position_fen: STARTING_POSITION.to_string(),
            position_moves: Vec::new(),
        }
    }

    /// Returns false when the loop should exit.
    fn handle_command(&mut self, command: &str) -> bool {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied() {
            Some("uci") => {
                println!("id name {}", ENGINE_NAME);
                println!("id author {}", ENGINE_AUTHOR);
                println!("uciok");
            }
            Some("isready") => {
                self.signals.wait_until_ready();
                println!("readyok");
            }
            Some("ucinewgame") => {
                self.set_position(STARTING_POSITION.to_string(), Vec::new());
            }
            Some("position") => {
                self.handle_position(&parts[1..]);
            }
            Some("go") => {
                self.handle_go(&parts[1..]);
            }
            Some("stop") => {
                self.signals.signal_search_stop();
            }
            Some("debug") => {
                self.signals.signal_debug(parts.get(1) != Some(&"off"));
            }
            Some("quit") => {
                self.signals.signal_quit();
                return false;
            }
            _ => {
                log::debug!("ignoring unknown UCI command: {}", command);
            }
        }
        true
    }

    fn set_position(&mut self, fen: String, moves: Vec<Mv>) {
        self.position_fen = fen;
        self.position_moves = moves;
        self.signals
            .signal_position(self.position_fen.clone(), self.position_moves.clone());
    }

    fn handle_position(&mut self, parts: &[&str]) {
        let mut index = 0;
        let fen = if parts.first() == Some(&"startpos") {
            index = 1;
            STARTING_POSITION.to_string()
        } else if parts.first() == Some(&"fen") {
            index = 1;
            let mut fen_parts = Vec::new();
            while index < parts.len() && parts[index] != "moves" {
                fen_parts.push(parts[index]);
                index += 1;
            }
            fen_parts.join(" ")
        } else {
            log::debug!("malformed position command");
            return;
        };

        if self.mirror.set_from(&fen, &[]).is_err() {
            log::warn!("rejecting position with invalid FEN: {}", fen);
            return;
        }

        let mut moves = Vec::new();
        if parts.get(index) == Some(&"moves") {
            for text in &parts[index + 1..] {
                // Validate against the mirror; a bad move drops the rest.
                match self.mirror.parse_move(text) {
                    Some(mv) => {
                        self.mirror.apply_move(mv);
                        moves.push(mv);
                    }
                    None => {
                        log::warn!("cannot parse move '{}'; dropping remaining moves", text);
                        break;
                    }
                }
            }
        }

        self.set_position(fen, moves);
    }

    fn handle_go(&mut self, parts: &[&str]) {
        let mut time_control = TimeControl::default();

        let mut index = 0;
        while index < parts.len() {
            let argument = |index: usize| -> i64 {
                parts
                    .get(index + 1)
                    .and_then(|text| text.parse().ok())
                    .unwrap_or(0)
            };
            match parts[index] {
                "infinite" => time_control.infinite = true,
                "movetime" => {
                    time_control.move_time_ms = argument(index);
                    index += 1;
                }
                "wtime" => {
                    time_control.time_remaining_ms[color_index(chess::Color::White)] =
                        argument(index);
                    index += 1;
                }
                "btime" => {
                    time_control.time_remaining_ms[color_index(chess::Color::Black)] =
                        argument(index);
                    index += 1;
                }
                "winc" => {
                    time_control.increment_ms[color_index(chess::Color::White)] = argument(index);
                    index += 1;
                }
                "binc" => {
                    time_control.increment_ms[color_index(chess::Color::Black)] = argument(index);
                    index += 1;
                }
                "nodes" => {
                    time_control.node_budget = argument(index);
                    index += 1;
                }
                unknown => {
                    log::debug!("ignoring go parameter: {}", unknown);
                }
            }
            index += 1;
        }

        self.signals.signal_search_go(time_control);
    }
}
