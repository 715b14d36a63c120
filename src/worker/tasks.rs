//! Task envelopes and dispatch.
//!
//! Producers push `{"id": .., "task": .., "args": ..}` onto the queue. The
//! envelope id doubles as the job id. Every well-formed envelope yields one
//! `TaskResult`; malformed ones cannot be answered and are dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::orchestrator::start_training_pipeline;
use super::prediction::{predict_from_model, PredictionRequest};
use crate::context::WorkerContext;
use crate::error::{ErrorRecord, JobError};

pub const TRAIN_TASK: &str = "start_training_pipeline";
pub const PREDICT_TASK: &str = "predict_from_model_task";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl TaskResult {
    fn from_outcome(task_id: &str, outcome: Result<Value, JobError>) -> Self {
        match outcome {
            Ok(result) => Self {
                task_id: task_id.to_string(),
                status: TaskStatus::Success,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                task_id: task_id.to_string(),
                status: TaskStatus::Failure,
                result: None,
                error: Some(ErrorRecord::from(&e)),
            },
        }
    }
}

/// Training args are the job config, optionally wrapped as `{"config": {...}}` or `[{...}]`.
fn training_config(args: &Value) -> Value {
    match args {
        Value::Object(map) if map.len() == 1 && map.get("config").is_some_and(Value::is_object) => {
            map["config"].clone()
        }
        Value::Array(items) if items.len() == 1 => items[0].clone(),
        other => other.clone(),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, JobError> {
    serde_json::to_value(value).map_err(|e| JobError::Execution(format!("encode result: {e}")))
}

/// Run the task an envelope names.
pub fn dispatch(ctx: &WorkerContext, envelope: &TaskEnvelope) -> Result<Value, JobError> {
    match envelope.task.as_str() {
        TRAIN_TASK => {
            let outcome = start_training_pipeline(ctx, &envelope.id, training_config(&envelope.args))?;
            to_value(&outcome)
        }
        PREDICT_TASK => {
            let request: PredictionRequest = serde_json::from_value(envelope.args.clone())
                .map_err(|e| JobError::Config(format!("prediction arguments: {e}")))?;
            to_value(&predict_from_model(ctx, &request)?)
        }
        other => Err(JobError::Config(format!("unknown task '{other}'"))),
    }
}

/// Parse and run one raw envelope. `None` when the envelope is unreadable.
pub fn handle_envelope(ctx: &WorkerContext, raw: &str) -> Option<TaskResult> {
    let envelope: TaskEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed task envelope");
            return None;
        }
    };
    tracing::info!(task_id = %envelope.id, task = %envelope.task, "Task received");
    let outcome = dispatch(ctx, &envelope);
    if let Err(e) = &outcome {
        tracing::warn!(task_id = %envelope.id, kind = %e.kind(), error = %e, "Task failed");
    }
    Some(TaskResult::from_outcome(&envelope.id, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::builtin_context;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn training_task_returns_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let raw = json!({
            "id": "task-1",
            "task": TRAIN_TASK,
            "args": {"pipeline_name": "demo", "epochs": 1},
        })
        .to_string();

        let result = handle_envelope(&ctx, &raw).unwrap();
        assert_eq!(result.status, TaskStatus::Success);
        let body = result.result.unwrap();
        assert_eq!(body["status"], "SUCCESS");
        assert!(body["experiment_id"].as_str().unwrap().starts_with("demo_"));
        assert!(body["model_path"].is_string());
    }

    #[test]
    fn wrapped_training_args_accepted() {
        let inner = json!({"pipeline_name": "demo"});
        assert_eq!(training_config(&json!({"config": inner.clone()})), inner);
        assert_eq!(training_config(&json!([inner.clone()])), inner);
        assert_eq!(training_config(&inner), inner);
    }

    #[test]
    fn failed_task_carries_error_record() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let raw = json!({"id": "task-2", "task": TRAIN_TASK, "args": {"pipeline_name": "missing"}})
            .to_string();

        let result = handle_envelope(&ctx, &raw).unwrap();
        assert_eq!(result.status, TaskStatus::Failure);
        assert_eq!(result.error.unwrap().kind, ErrorKind::PluginNotFound);
        assert!(result.result.is_none());
    }

    #[test]
    fn prediction_task_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let train = json!({
            "id": "task-3",
            "task": TRAIN_TASK,
            "args": {"pipeline_name": "stocks", "points": 60, "epochs": 2},
        });
        let trained = handle_envelope(&ctx, &train.to_string()).unwrap().result.unwrap();

        let predict = json!({
            "id": "task-4",
            "task": PREDICT_TASK,
            "args": {"experiment_id": trained["experiment_id"], "horizon": 4},
        });
        let result = handle_envelope(&ctx, &predict.to_string()).unwrap();
        assert_eq!(result.status, TaskStatus::Success);
        let body = result.result.unwrap();
        assert_eq!(body["forecasted_series"].as_array().unwrap().len(), 4);
        assert_eq!(body["target_column"], "Close");
    }

    #[test]
    fn unknown_task_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        let raw = json!({"id": "task-5", "task": "reticulate_splines"}).to_string();
        let result = handle_envelope(&ctx, &raw).unwrap();
        assert_eq!(result.error.unwrap().kind, ErrorKind::ConfigError);
    }

    #[test]
    fn malformed_envelope_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = builtin_context(dir.path());
        assert!(handle_envelope(&ctx, "not json").is_none());
        assert!(handle_envelope(&ctx, r#"{"task": "x"}"#).is_none());
    }

    #[test]
    fn result_serialization_omits_absent_fields() {
        let ok = TaskResult::from_outcome("t", Ok(json!({"a": 1})));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"status\":\"SUCCESS\""));
        assert!(!text.contains("error"));
    }
}
