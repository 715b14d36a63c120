//! Window-flattening linear regressor trained with per-sample SGD on MSE.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fs_helpers::write_atomic;
use crate::plugin::{InputShape, Model, PipelineError};

/// One training sample: a window of feature rows and its target.
pub type Sample = (Vec<Vec<f64>>, f64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    pub input_shape: InputShape,
    weights: Vec<f64>,
    bias: f64,
}

impl LinearRegressor {
    /// Zero-initialised model for windows of `shape`.
    pub fn new(shape: InputShape) -> Self {
        Self {
            input_shape: shape,
            weights: vec![0.0; shape.sequence_length * shape.n_features],
            bias: 0.0,
        }
    }

    fn check_window(&self, window: &[Vec<f64>]) -> Result<(), PipelineError> {
        let shape = self.input_shape;
        if window.len() != shape.sequence_length
            || window.iter().any(|row| row.len() != shape.n_features)
        {
            return Err(PipelineError::Execution(format!(
                "window must be {}x{}, got {} rows",
                shape.sequence_length,
                shape.n_features,
                window.len()
            )));
        }
        Ok(())
    }

    fn forward(&self, window: &[Vec<f64>]) -> f64 {
        window
            .iter()
            .flatten()
            .zip(&self.weights)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.bias
    }

    /// One pass of SGD over `samples`. Returns the mean squared error after the pass.
    pub fn fit_epoch(&mut self, samples: &[Sample], learning_rate: f64) -> Result<f64, PipelineError> {
        for (window, target) in samples {
            self.check_window(window)?;
            let err = self.forward(window) - target;
            for (w, x) in self.weights.iter_mut().zip(window.iter().flatten()) {
                *w -= learning_rate * err * x;
            }
            self.bias -= learning_rate * err;
        }
        let loss = self.mse(samples)?;
        if !loss.is_finite() {
            return Err(PipelineError::Execution(
                "training diverged, lower the learning rate".into(),
            ));
        }
        Ok(loss)
    }

    pub fn mse(&self, samples: &[Sample]) -> Result<f64, PipelineError> {
        if samples.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for (window, target) in samples {
            self.check_window(window)?;
            total += (self.forward(window) - target).powi(2);
        }
        Ok(total / samples.len() as f64)
    }

    /// Load weights saved by `Model::save`, rejecting a shape mismatch.
    pub fn load(path: &Path, expected: &InputShape) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path)
            .map_err(|e| PipelineError::Artifact(format!("read {}: {e}", path.display())))?;
        let model: Self = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::Artifact(format!("decode {}: {e}", path.display())))?;
        if model.input_shape != *expected
            || model.weights.len() != expected.sequence_length * expected.n_features
        {
            return Err(PipelineError::Artifact(format!(
                "stored model shape {:?} does not match expected {:?}",
                model.input_shape, expected
            )));
        }
        Ok(model)
    }
}

impl Model for LinearRegressor {
    fn predict(&self, window: &[Vec<f64>]) -> Result<f64, PipelineError> {
        self.check_window(window)?;
        Ok(self.forward(window))
    }

    fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::Artifact(format!("encode model: {e}")))?;
        write_atomic(path, &bytes)
            .map_err(|e| PipelineError::Artifact(format!("write {}: {e}", path.display())))
    }
}
