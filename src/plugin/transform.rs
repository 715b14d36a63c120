//! Inference-time-stateless transforms shared by training and prediction.

use serde::{Deserialize, Serialize};

use super::PipelineError;

/// Per-column min-max scaling into `[0, 1]`.
///
/// Constant columns scale to 0 and invert back to their constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl MinMaxScaler {
    /// Fit on rows of equal width.
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self, PipelineError> {
        let width = rows
            .first()
            .map(Vec::len)
            .ok_or_else(|| PipelineError::Execution("cannot fit scaler on empty data".into()))?;
        let mut min = vec![f64::INFINITY; width];
        let mut max = vec![f64::NEG_INFINITY; width];
        for row in rows {
            if row.len() != width {
                return Err(PipelineError::Execution("ragged rows passed to scaler".into()));
            }
            for (i, &v) in row.iter().enumerate() {
                min[i] = min[i].min(v);
                max[i] = max[i].max(v);
            }
        }
        Ok(Self { min, max })
    }

    pub fn width(&self) -> usize {
        self.min.len()
    }

    fn range(&self, col: usize) -> f64 {
        self.max[col] - self.min[col]
    }

    pub fn transform_value(&self, col: usize, v: f64) -> f64 {
        let range = self.range(col);
        if range == 0.0 {
            0.0
        } else {
            (v - self.min[col]) / range
        }
    }

    pub fn inverse_value(&self, col: usize, v: f64) -> f64 {
        v * self.range(col) + self.min[col]
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, &v)| self.transform_value(i, v))
            .collect()
    }

    pub fn inverse_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, &v)| self.inverse_value(i, v))
            .collect()
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|r| self.transform_row(r)).collect()
    }
}
