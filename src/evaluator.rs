// src/evaluator.rs
//! The network seam. The search core batches positions and hands them to an
//! [`Evaluator`]; it never sees tensors or a runtime.

use crate::game::{InputPlanes, OutputPlanes};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("prediction backend failed: {0}")]
    Backend(String),
    #[error("sink I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Batch predictor plus the storage/telemetry sinks that ride along with it.
///
/// `predict_batch` values are tanh-scaled in (-1, 1), from the perspective of
/// the side to move in each image; the search core maps them onto [0, 1].
pub trait Evaluator: Send + Sync {
    fn predict_batch(
        &self,
        batch_size: usize,
        images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [OutputPlanes],
    ) -> Result<(), EvalError>;

    fn save_file(&self, relative_path: &str, bytes: &[u8]) -> Result<(), EvalError>;

    fn log_scalars(&self, step: i64, names: &[&str], values: &[f32]) -> Result<(), EvalError>;
}

/// Uniform fallback backend: zero logits (a flat policy after softmax) and a
/// neutral value. Used by tests and when no trained network is wired up.
pub struct UniformEvaluator {
    base_dir: PathBuf,
}

impl UniformEvaluator {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        UniformEvaluator {
            base_dir: base_dir.into(),
        }
    }
}

impl Default for UniformEvaluator {
    fn default() -> Self {
        UniformEvaluator::new(".")
    }
}

impl Evaluator for UniformEvaluator {
    fn predict_batch(
        &self,
        batch_size: usize,
        _images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [OutputPlanes],
    ) -> Result<(), EvalError> {
        for value in values.iter_mut().take(batch_size) {
            *value = 0.0;
        }
        for policy in policies.iter_mut().take(batch_size) {
            for plane in policy.iter_mut() {
                plane.fill(0.0);
            }
        }
        Ok(())
    }

    fn save_file(&self, relative_path: &str, bytes: &[u8]) -> Result<(), EvalError> {
        let path = self.base_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn log_scalars(&self, step: i64, names: &[&str], values: &[f32]) -> Result<(), EvalError> {
        for (name, value) in names.iter().zip(values) {
            log::info!("scalar step={} {}={}", step, name, value);
        }
        Ok(())
    }
}

/// Fixed-value backend for deterministic tests: every position gets the same
/// tanh value and zero logits.
pub struct ConstantEvaluator {
    pub tanh_value: f32,
}

impl Evaluator for ConstantEvaluator {
    fn predict_batch(
        &self,
        batch_size: usize,
        _images: &[InputPlanes],
        values: &mut [f32],
        policies: &mut [OutputPlanes],
    ) -> Result<(), EvalError> {
        for value in values.iter_mut().take(batch_size) {
            *value = self.tanh_value;
        }
        for policy in policies.iter_mut().take(batch_size) {
            for plane in policy.iter_mut() {
                plane.fill(0.0);
            }
        }
        Ok(())
    }

    fn save_file(&self, _relative_path: &str, _bytes: &[u8]) -> Result<(), EvalError> {
        Ok(())
    }

    fn log_scalars(&self, _step: i64, _names: &[&str], _values: &[f32]) -> Result<(), EvalError> {
        Ok(())
    }
}
