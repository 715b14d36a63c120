//! Prediction from a trained experiment.
//!
//! The pipeline is rebuilt from the experiment's stored configuration, its
//! history re-acquired through the data cache, and the scaler refit on that
//! history before the saved model is loaded and rolled forward.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::forecast::forecast;
use crate::context::WorkerContext;
use crate::error::JobError;
use crate::models::ExperimentStatus;
use crate::plugin::{call_plugin, InputShape, MinMaxScaler, TimeSeriesSpec};

pub const DEFAULT_HORIZON: usize = 1;
pub const MAX_HORIZON: usize = 365;
/// Trailing observations returned as `actual_history`.
const HISTORY_POINTS: usize = 60;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PredictionRequest {
    pub experiment_id: String,
    /// Caller-supplied seed rows, keyed by feature column.
    #[serde(default)]
    pub request_rows: Option<Vec<Map<String, Value>>>,
    #[serde(default)]
    pub horizon: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// First forecast point.
    pub prediction: f64,
    pub experiment_id: String,
    pub target_column: String,
    pub actual_history: Vec<HistoryPoint>,
    pub forecasted_series: Vec<f64>,
    /// Rows the forecast was seeded from, in original units.
    pub seed_window: Vec<Vec<f64>>,
}

pub fn predict_from_model(
    ctx: &WorkerContext,
    request: &PredictionRequest,
) -> Result<PredictionResponse, JobError> {
    let span = tracing::info_span!("prediction", experiment_id = %request.experiment_id);
    let _guard = span.enter();

    let horizon = request.horizon.unwrap_or(DEFAULT_HORIZON);
    if horizon == 0 || horizon > MAX_HORIZON {
        return Err(JobError::Config(format!(
            "horizon must be between 1 and {MAX_HORIZON}, got {horizon}"
        )));
    }

    let experiment = ctx
        .store
        .get(&request.experiment_id)?
        .ok_or_else(|| JobError::ExperimentNotFound(request.experiment_id.clone()))?;
    if experiment.status != ExperimentStatus::Success {
        return Err(JobError::ExperimentNotReady {
            id: experiment.id,
            status: experiment.status.to_string(),
        });
    }
    let model_path = experiment
        .model_path
        .as_deref()
        .map(Path::new)
        .filter(|p| p.is_file())
        .ok_or_else(|| {
            JobError::Artifact(format!("no model artifact for experiment {}", experiment.id))
        })?;

    let entry = ctx.registry.resolve(&experiment.pipeline_name)?;
    let pipeline = entry.build(&experiment.config)?;
    let spec = call_plugin("inspect pipeline", || Ok(pipeline.time_series()))?.ok_or_else(|| {
        JobError::PredictionUnsupported(format!(
            "pipeline '{}' is not time-indexed",
            experiment.pipeline_name
        ))
    })?;

    let history = ctx
        .cache
        .get_or_fetch(pipeline.as_ref(), &experiment.pipeline_name, &experiment.config)?;
    let rows = history.select(&spec.feature_columns)?;
    let scaler = MinMaxScaler::fit(&rows)?;

    let shape = experiment
        .results
        .as_ref()
        .and_then(InputShape::from_results)
        .ok_or_else(|| JobError::Artifact("results carry no input_shape".into()))?;
    if shape.n_features != spec.feature_columns.len() {
        return Err(JobError::Artifact(format!(
            "model expects {} features, pipeline declares {}",
            shape.n_features,
            spec.feature_columns.len()
        )));
    }
    let model = call_plugin("load model", || pipeline.load_model(&shape, model_path))?;

    let seed = match &request.request_rows {
        Some(supplied) if !supplied.is_empty() => rows_from_request(supplied, &spec)?,
        _ => rows.clone(),
    };
    if seed.len() < shape.sequence_length {
        return Err(JobError::Config(format!(
            "need at least {} seed rows, have {}",
            shape.sequence_length,
            seed.len()
        )));
    }
    let seed_window = seed[seed.len() - shape.sequence_length..].to_vec();

    let target = spec
        .feature_columns
        .iter()
        .position(|c| *c == spec.target_column)
        .ok_or_else(|| JobError::Config("target column is not a feature column".into()))?;
    let series = call_plugin("forecast", || {
        forecast(model.as_ref(), &scaler, target, &seed_window, horizon)
    })?;
    tracing::info!(horizon, pipeline = %experiment.pipeline_name, "Forecast produced");

    let start = history.len().saturating_sub(HISTORY_POINTS);
    let actual_history = history.index[start..]
        .iter()
        .zip(&rows[start..])
        .map(|(date, row)| HistoryPoint {
            date: date.clone(),
            value: row[target],
        })
        .collect();

    Ok(PredictionResponse {
        prediction: series.first().copied().unwrap_or_default(),
        experiment_id: experiment.id,
        target_column: spec.target_column,
        actual_history,
        forecasted_series: series,
        seed_window,
    })
}

/// Project caller rows onto the model's feature columns.
fn rows_from_request(
    supplied: &[Map<String, Value>],
    spec: &TimeSeriesSpec,
) -> Result<Vec<Vec<f64>>, JobError> {
    supplied
        .iter()
        .enumerate()
        .map(|(i, row)| {
            spec.feature_columns
                .iter()
                .map(|column| {
                    row.get(column).and_then(Value::as_f64).ok_or_else(|| {
                        JobError::Config(format!("request row {i} lacks numeric '{column}'"))
                    })
                })
                .collect::<Result<Vec<f64>, JobError>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::builtin_context;
    use crate::error::ErrorKind;
    use crate::models::Experiment;
    use crate::worker::orchestrator::start_training_pipeline;
    use chrono::Utc;
    use serde_json::json;

    fn train_stocks(ctx: &WorkerContext, job: &str) -> String {
        start_training_pipeline(
            ctx,
            job,
            json!({
                "pipeline_name": "stocks",
                "ticker": "ACME",
                "points": 100,
                "training_params": {"epochs": 5},
            }),
        )
        .unwrap()
        .experiment_id
    }

    fn request(id: &str, horizon: Option<usize>) -> PredictionRequest {
        PredictionRequest {
            experiment_id: id.to_string(),
            request_rows: None,
            horizon,
        }
    }

    #[test]
    fn scenario_d_forecasts_requested_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let id = train_stocks(&ctx, "job-d1");

        let response = predict_from_model(&ctx, &request(&id, Some(5))).unwrap();
        assert_eq!(response.forecasted_series.len(), 5);
        assert_eq!(response.seed_window.len(), 10);
        assert_eq!(response.prediction, response.forecasted_series[0]);
        assert_eq!(response.target_column, "Close");
        assert_eq!(response.experiment_id, id);
        assert_eq!(response.actual_history.len(), HISTORY_POINTS);
        assert_eq!(
            response.seed_window.last().unwrap()[0],
            response.actual_history.last().unwrap().value
        );
    }

    #[test]
    fn reloaded_model_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let id = train_stocks(&ctx, "job-d2");

        let a = predict_from_model(&ctx, &request(&id, Some(3))).unwrap();
        let b = predict_from_model(&ctx, &request(&id, Some(3))).unwrap();
        assert_eq!(a.forecasted_series, b.forecasted_series);
    }

    #[test]
    fn default_horizon_is_one() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let id = train_stocks(&ctx, "job-d3");
        let response = predict_from_model(&ctx, &request(&id, None)).unwrap();
        assert_eq!(response.forecasted_series.len(), 1);
    }

    #[test]
    fn horizon_bounds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        for horizon in [0, MAX_HORIZON + 1] {
            let err = predict_from_model(&ctx, &request("any", Some(horizon))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConfigError);
        }
    }

    #[test]
    fn caller_rows_seed_the_forecast() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let id = train_stocks(&ctx, "job-d4");

        let rows: Vec<Map<String, Value>> = (0..12)
            .map(|i| {
                let mut row = Map::new();
                row.insert("Close".into(), json!(50.0 + i as f64));
                row
            })
            .collect();
        let req = PredictionRequest {
            experiment_id: id,
            request_rows: Some(rows),
            horizon: Some(2),
        };
        let response = predict_from_model(&ctx, &req).unwrap();
        let seeded: Vec<f64> = response.seed_window.iter().map(|r| r[0]).collect();
        assert_eq!(seeded, (2..12).map(|i| 50.0 + i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn malformed_caller_rows_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let id = train_stocks(&ctx, "job-d5");

        let mut row = Map::new();
        row.insert("Open".into(), json!(1.0));
        let req = PredictionRequest {
            experiment_id: id,
            request_rows: Some(vec![row]),
            horizon: Some(1),
        };
        assert_eq!(predict_from_model(&ctx, &req).unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn started_experiment_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let exp = Experiment::started("stocks_x", "job", "stocks", json!({}), Utc::now());
        ctx.store.create(&exp).unwrap();

        let err = predict_from_model(&ctx, &request("stocks_x", Some(5))).unwrap_err();
        assert!(matches!(err, JobError::ExperimentNotReady { .. }));
    }

    #[test]
    fn unknown_experiment_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let err = predict_from_model(&ctx, &request("nope", None)).unwrap_err();
        assert!(matches!(err, JobError::ExperimentNotFound(_)));
    }

    #[test]
    fn non_time_indexed_pipeline_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let id = start_training_pipeline(&ctx, "job-demo", json!({"pipeline_name": "demo", "epochs": 1}))
            .unwrap()
            .experiment_id;
        let err = predict_from_model(&ctx, &request(&id, Some(2))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PredictionUnsupported);
    }

    #[test]
    fn missing_artifact_is_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let id = train_stocks(&ctx, "job-d6");
        let exp = ctx.store.get(&id).unwrap().unwrap();
        std::fs::remove_file(exp.model_path.unwrap()).unwrap();

        let err = predict_from_model(&ctx, &request(&id, Some(1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactError);
    }
}
