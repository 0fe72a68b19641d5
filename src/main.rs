//! Kestrel entry point: `kestrel uci` (the default) speaks UCI on stdio;
//! `kestrel selfplay` generates training games with the configured worker
//! count.

use anyhow::Context;
use clap::{Parser, Subcommand};
use kestrel::cache::PredictionCache;
use kestrel::config::Config;
use kestrel::evaluator::{Evaluator, UniformEvaluator};
use kestrel::position::ChessPosition;
use kestrel::search::worker::SearchWorker;
use kestrel::storage::{GameStore, InMemoryStore, SharedStore, WorkCoordinator};
use kestrel::uci;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "kestrel", version, about = "AlphaZero-style chess engine")]
struct Cli {
    /// JSON config overrides on top of the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Speak UCI on stdin/stdout (the default).
    Uci,
    /// Generate self-play games.
    Selfplay {
        /// Number of games to play; defaults to the configured count.
        #[arg(long)]
        games: Option<usize>,
        /// Worker threads; defaults to the configured count.
        #[arg(long)]
        workers: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_overrides(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command.unwrap_or(Command::Uci) {
        Command::Uci => uci::run(config, || {
            Box::new(UniformEvaluator::default()) as Box<dyn Evaluator>
        }),
        Command::Selfplay { games, workers } => run_selfplay(config, games, workers),
    }
}

fn run_selfplay(
    config: Config,
    games: Option<usize>,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let num_games = games.unwrap_or(config.training.num_games);
    let num_workers = workers.unwrap_or(config.self_play.num_workers).max(1);

    log::info!(
        "self-play: {} games across {} workers, batch size {}",
        num_games,
        num_workers,
        config.self_play.prediction_batch_size
    );

    let cache = Arc::new(PredictionCache::new(config.misc.prediction_cache_size_gb));
    let evaluator = Arc::new(UniformEvaluator::default());
    let store = Arc::new(Mutex::new(InMemoryStore::new()));
    let coordinator = Arc::new(WorkCoordinator::new());
    coordinator.post_work(num_games as i64);

    let live_workers = Arc::new(AtomicUsize::new(num_workers));
    std::thread::scope(|scope| {
        for worker_index in 0..num_workers {
            let config = config.clone();
            let cache = cache.clone();
            let evaluator = evaluator.clone();
            let coordinator = coordinator.clone();
            let live_workers = live_workers.clone();
            let mut store = SharedStore::new(store.clone());
            scope.spawn(move || {
                let mut worker: SearchWorker<ChessPosition> = SearchWorker::new(config, cache);
                if let Err(error) = worker.play_games(&coordinator, &mut store, evaluator.as_ref())
                {
                    log::error!("worker {} aborted: {}", worker_index, error);
                }
                live_workers.fetch_sub(1, Ordering::SeqCst);
            });
        }

        // Dispense the one quota, then shut the gate so workers drain out.
        // Also stop waiting if every worker has already died on an error.
        while !coordinator.all_work_items_completed()
            && live_workers.load(Ordering::SeqCst) > 0
        {
            std::thread::sleep(Duration::from_millis(50));
        }
        coordinator.shut_down();
    });

    let store = store.lock();
    let played = store.games_stored();
    let average_ply = if played > 0 {
        store.games().iter().map(|game| game.moves.len()).sum::<usize>() as f32 / played as f32
    } else {
        0.0
    };

    // Hand the move lists to the storage sink and report the run.
    let mut text = String::new();
    for game in store.games() {
        let moves: Vec<String> = game.moves.iter().map(|mv| mv.to_string()).collect();
        text.push_str(&format!("{} {}\n", game.result, moves.join(" ")));
    }
    evaluator.save_file("selfplay/games.txt", text.as_bytes())?;
    evaluator.log_scalars(
        0,
        &["selfplay/games", "selfplay/average_ply"],
        &[played as f32, average_ply],
    )?;

    log::info!("self-play finished: {} games, average ply {:.1}", played, average_ply);
    Ok(())
}
