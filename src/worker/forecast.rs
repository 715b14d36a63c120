//! Multi-step forecasting by feeding each prediction back as input.
//!
//! Windows here are in original units. Each step normalizes the window,
//! runs the model, denormalizes the output, then rolls the window forward
//! by one row whose target is the prediction and whose other features carry
//! over from the last observed row.

use crate::plugin::{MinMaxScaler, Model, PipelineError};

/// One step: returns the predicted target and the window for the next step.
pub fn forecast_step(
    model: &dyn Model,
    scaler: &MinMaxScaler,
    target: usize,
    window: &[Vec<f64>],
) -> Result<(f64, Vec<Vec<f64>>), PipelineError> {
    let last = window
        .last()
        .ok_or_else(|| PipelineError::Execution("forecast window is empty".into()))?;
    if target >= last.len() || last.len() != scaler.width() {
        return Err(PipelineError::Execution(format!(
            "window rows have {} features, scaler expects {}",
            last.len(),
            scaler.width()
        )));
    }

    let scaled = scaler.transform(window);
    let predicted = scaler.inverse_value(target, model.predict(&scaled)?);
    if !predicted.is_finite() {
        return Err(PipelineError::Execution("model produced a non-finite value".into()));
    }

    let mut next_row = last.clone();
    next_row[target] = predicted;
    let mut next = window[1..].to_vec();
    next.push(next_row);
    Ok((predicted, next))
}

/// Forecast exactly `horizon` points starting from `seed`.
pub fn forecast(
    model: &dyn Model,
    scaler: &MinMaxScaler,
    target: usize,
    seed: &[Vec<f64>],
    horizon: usize,
) -> Result<Vec<f64>, PipelineError> {
    let mut window = seed.to_vec();
    let mut series = Vec::with_capacity(horizon);
    for _ in 0..horizon {
        let (value, next) = forecast_step(model, scaler, target, &window)?;
        series.push(value);
        window = next;
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// Predicts the last scaled target plus a constant.
    struct Drift(f64);

    impl Model for Drift {
        fn predict(&self, window: &[Vec<f64>]) -> Result<f64, PipelineError> {
            Ok(window.last().unwrap()[0] + self.0)
        }

        fn save(&self, _path: &Path) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn scaler() -> MinMaxScaler {
        // Close in [0, 100], Volume in [0, 10].
        MinMaxScaler::fit(&[vec![0.0, 0.0], vec![100.0, 10.0]]).unwrap()
    }

    #[test]
    fn step_denormalizes_and_rolls_window() {
        let window = vec![vec![10.0, 1.0], vec![20.0, 2.0]];
        let (value, next) = forecast_step(&Drift(0.1), &scaler(), 0, &window).unwrap();
        assert!((value - 30.0).abs() < 1e-9);
        assert_eq!(next.len(), 2);
        assert_eq!(next[0], vec![20.0, 2.0]);
        assert!((next[1][0] - 30.0).abs() < 1e-9);
        assert_eq!(next[1][1], 2.0);
    }

    #[test]
    fn forecast_has_exactly_horizon_points() {
        let seed = vec![vec![10.0, 1.0], vec![20.0, 2.0]];
        let series = forecast(&Drift(0.1), &scaler(), 0, &seed, 5).unwrap();
        assert_eq!(series.len(), 5);
        for (i, v) in series.iter().enumerate() {
            assert!((v - (30.0 + 10.0 * i as f64)).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_horizon_is_empty() {
        let seed = vec![vec![10.0, 1.0]];
        assert!(forecast(&Drift(0.0), &scaler(), 0, &seed, 0).unwrap().is_empty());
    }

    #[test]
    fn empty_or_mismatched_window_rejected() {
        assert!(forecast_step(&Drift(0.0), &scaler(), 0, &[]).is_err());
        assert!(forecast_step(&Drift(0.0), &scaler(), 0, &[vec![1.0]]).is_err());
    }
}
