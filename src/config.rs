// src/config.rs
//! Engine configuration: training, self-play and miscellaneous knobs, with
//! defaults plus optional JSON overrides.

use serde::Deserialize;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub steps: usize,
    pub pgn_interval: usize,
    pub validation_interval: usize,
    pub checkpoint_interval: usize,
    pub strength_test_interval: usize,
    pub num_games: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            batch_size: 512,
            steps: 100_000,
            pgn_interval: 100,
            validation_interval: 2_000,
            checkpoint_interval: 1_000,
            strength_test_interval: 10_000,
            num_games: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct SelfPlayConfig {
    pub num_workers: usize,
    /// Game slots per worker; also the network batch size.
    pub prediction_batch_size: usize,
    /// Plies over which self-play samples moves by visit count instead of
    /// taking the best child.
    pub num_sampling_moves: i32,
    /// Games reaching this many plies are adjudicated drawn.
    pub max_moves: i32,
    pub num_simulations: i32,
    pub root_dirichlet_alpha: f32,
    pub root_exploration_fraction: f32,
    pub exploration_rate_base: f32,
    pub exploration_rate_init: f32,
}

impl Default for SelfPlayConfig {
    fn default() -> Self {
        SelfPlayConfig {
            num_workers: 4,
            prediction_batch_size: 64,
            num_sampling_moves: 30,
            max_moves: 512,
            num_simulations: 800,
            root_dirichlet_alpha: 0.3,
            root_exploration_fraction: 0.25,
            exploration_rate_base: 19_652.0,
            exploration_rate_init: 1.25,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct MiscConfig {
    pub prediction_cache_size_gb: usize,
    /// Self-play only probes the cache up to this game ply; search always
    /// probes.
    pub prediction_cache_max_ply: i32,
    pub time_control_safety_buffer_ms: i64,
    pub time_control_fraction_of_remaining: i64,
    pub search_mcts_parallelism: usize,
}

impl Default for MiscConfig {
    fn default() -> Self {
        MiscConfig {
            prediction_cache_size_gb: 1,
            prediction_cache_max_ply: 30,
            time_control_safety_buffer_ms: 100,
            time_control_fraction_of_remaining: 20,
            search_mcts_parallelism: 8,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct Config {
    pub training: TrainingConfig,
    pub self_play: SelfPlayConfig,
    pub misc: MiscConfig,
}

impl Config {
    /// Load a JSON overrides file on top of the defaults. Unknown keys are
    /// rejected so typos do not silently fall back.
    pub fn load_overrides(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }
}
