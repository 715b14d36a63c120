//! Pipeline plugin interface.
//!
//! A plugin is a named factory that turns a resolved job configuration into a
//! `Pipeline`. Pipelines own their training math; the worker only drives
//! them through this interface:
//!
//! ```text
//! factory(config) → [set_data(cached)] → run(progress) → Model::save
//!                                        load_model(shape, path) → Model::predict
//! ```
//!
//! Every call into plugin code goes through `call_plugin`, which turns a
//! panic into `JobError::Panic` so one faulty plugin cannot take the worker
//! process down.

pub mod builtin;
pub mod registry;
pub mod transform;

pub use registry::*;
pub use transform::MinMaxScaler;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{panic_message, JobError};
use crate::progress::ProgressObserver;

/// File name of the serialized model inside an experiment's artifact directory.
pub const MODEL_FILE_NAME: &str = "model.json";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    DataFetch(String),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Artifact(String),

    #[error("{0}")]
    Unsupported(String),
}

// ═══════════════════════════════════════════════════════════
// Dataset
// ═══════════════════════════════════════════════════════════

/// Tabular numeric dataset: one label per row plus named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub index: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Dataset {
    /// Build a dataset, checking that every row matches the column count.
    pub fn new(
        index: Vec<String>,
        columns: Vec<String>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, PipelineError> {
        if index.len() != rows.len() {
            return Err(PipelineError::DataFetch(format!(
                "index has {} labels for {} rows",
                index.len(),
                rows.len()
            )));
        }
        if let Some(pos) = rows.iter().position(|r| r.len() != columns.len()) {
            return Err(PipelineError::DataFetch(format!(
                "row {pos} has {} values, expected {}",
                rows[pos].len(),
                columns.len()
            )));
        }
        Ok(Self { index, columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[idx]).collect())
    }

    /// Project rows onto `columns`, in that order.
    pub fn select(&self, columns: &[String]) -> Result<Vec<Vec<f64>>, PipelineError> {
        let indices = columns
            .iter()
            .map(|c| {
                self.column_index(c)
                    .ok_or_else(|| PipelineError::Config(format!("unknown column '{c}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i]).collect())
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════
// Capability interface
// ═══════════════════════════════════════════════════════════

/// Declares a pipeline as sequential/time-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesSpec {
    /// Column being forecast.
    pub target_column: String,
    /// Model input columns, in model order. Must include the target.
    pub feature_columns: Vec<String>,
}

/// Shape of one model input window, recorded in results as `input_shape`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub sequence_length: usize,
    pub n_features: usize,
}

impl InputShape {
    /// Read the shape a training run stored under `results.input_shape`.
    pub fn from_results(results: &Value) -> Option<Self> {
        serde_json::from_value(results.get("input_shape")?.clone()).ok()
    }
}

/// A trained model.
pub trait Model: Send {
    /// Predict the next (normalized) target value from a window of
    /// normalized feature rows.
    fn predict(&self, window: &[Vec<f64>]) -> Result<f64, PipelineError>;

    fn save(&self, path: &Path) -> Result<(), PipelineError>;
}

/// What a successful run hands back to the worker.
pub struct RunOutput {
    pub results: Value,
    pub model: Option<Box<dyn Model>>,
}

/// A configured training/prediction procedure.
pub trait Pipeline: Send {
    /// `Some` for sequential/time-indexed pipelines.
    fn time_series(&self) -> Option<TimeSeriesSpec> {
        None
    }

    /// Config keys that determine what `fetch_data` returns.
    fn caching_keys(&self) -> &[&'static str] {
        &[]
    }

    /// Acquire the input dataset from its source.
    fn fetch_data(&self) -> Result<Dataset, PipelineError> {
        Err(PipelineError::Unsupported(
            "pipeline does not expose data acquisition".into(),
        ))
    }

    /// Inject a dataset acquired on the pipeline's behalf.
    fn set_data(&mut self, _data: Dataset) {}

    fn run(&mut self, progress: &dyn ProgressObserver) -> Result<RunOutput, PipelineError>;

    /// Rebuild a model of `shape` and load persisted weights from `path`.
    fn load_model(
        &self,
        _shape: &InputShape,
        _path: &Path,
    ) -> Result<Box<dyn Model>, PipelineError> {
        Err(PipelineError::Unsupported(
            "pipeline cannot reload trained models".into(),
        ))
    }
}

/// Builds a pipeline from a fully resolved configuration.
pub type PipelineFactory = fn(&Value) -> Result<Box<dyn Pipeline>, PipelineError>;

/// Zero-argument default-config provider.
pub type ConfigProvider = fn() -> Value;

/// Run plugin code, mapping both its errors and its panics into `JobError`.
pub fn call_plugin<T>(
    what: &str,
    f: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<T, JobError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(JobError::from),
        Err(payload) => Err(JobError::Panic(format!(
            "{what}: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// Read a numeric config value at a JSON pointer, falling back to `default`.
pub fn config_f64(config: &Value, pointers: &[&str], default: f64) -> Result<f64, PipelineError> {
    for pointer in pointers {
        if let Some(v) = config.pointer(pointer) {
            return v
                .as_f64()
                .ok_or_else(|| PipelineError::Config(format!("{pointer} must be a number")));
        }
    }
    Ok(default)
}

/// Read a non-negative integer config value at the first present JSON pointer.
pub fn config_usize(
    config: &Value,
    pointers: &[&str],
    default: usize,
) -> Result<usize, PipelineError> {
    for pointer in pointers {
        if let Some(v) = config.pointer(pointer) {
            return v
                .as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| PipelineError::Config(format!("{pointer} must be a non-negative integer")));
        }
    }
    Ok(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn traits_are_object_safe() {
        fn _assert_pipeline(_: &dyn Pipeline) {}
        fn _assert_model(_: &dyn Model) {}
    }

    #[test]
    fn dataset_rejects_ragged_rows() {
        let err = Dataset::new(
            vec!["a".into(), "b".into()],
            vec!["x".into(), "y".into()],
            vec![vec![1.0, 2.0], vec![3.0]],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DataFetch(_)));
    }

    #[test]
    fn dataset_select_orders_columns() {
        let ds = Dataset::new(
            vec!["d1".into()],
            vec!["Open".into(), "Close".into()],
            vec![vec![1.0, 2.0]],
        )
        .unwrap();
        let rows = ds.select(&["Close".into(), "Open".into()]).unwrap();
        assert_eq!(rows, vec![vec![2.0, 1.0]]);
        assert!(ds.select(&["Volume".into()]).is_err());
        assert_eq!(ds.column("Close"), Some(vec![2.0]));
    }

    #[test]
    fn input_shape_read_from_results() {
        let results = json!({"input_shape": {"sequence_length": 10, "n_features": 1}});
        assert_eq!(
            InputShape::from_results(&results),
            Some(InputShape { sequence_length: 10, n_features: 1 })
        );
        assert_eq!(InputShape::from_results(&json!({})), None);
    }

    #[test]
    fn call_plugin_converts_panics() {
        let result: Result<(), JobError> = call_plugin("run", || panic!("index out of range"));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PipelineExecutionError);
        assert!(err.to_string().contains("run: index out of range"));
    }

    #[test]
    fn call_plugin_maps_errors() {
        let result: Result<(), JobError> =
            call_plugin("fetch", || Err(PipelineError::DataFetch("timeout".into())));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::DataFetchError);
    }

    #[test]
    fn config_lookup_prefers_first_pointer() {
        let config = json!({"epochs": 3, "training_params": {"epochs": 7}});
        assert_eq!(config_usize(&config, &["/training_params/epochs", "/epochs"], 10).unwrap(), 7);
        assert_eq!(config_usize(&json!({}), &["/epochs"], 10).unwrap(), 10);
        assert!(config_usize(&json!({"epochs": "many"}), &["/epochs"], 10).is_err());
        assert_eq!(config_f64(&json!({"lr": 0.5}), &["/lr"], 0.1).unwrap(), 0.5);
    }
}
