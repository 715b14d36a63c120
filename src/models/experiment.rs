use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::enums::ExperimentStatus;
use crate::error::ErrorRecord;

/// Number of job-id characters folded into an experiment id.
const JOB_ID_PREFIX_LEN: usize = 8;

/// Durable record of one job's execution and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub job_id: String,
    pub batch_id: Option<String>,
    pub batch_name: Option<String>,
    pub pipeline_name: String,
    pub status: ExperimentStatus,
    /// Fully resolved configuration, including system-injected fields.
    pub config: Value,
    pub results: Option<Value>,
    pub error: Option<ErrorRecord>,
    pub model_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Experiment {
    /// A fresh STARTED record. Batch fields are read from the resolved config.
    pub fn started(
        id: &str,
        job_id: &str,
        pipeline_name: &str,
        config: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        let batch_id = config
            .get("batch_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let batch_name = config
            .get("batch_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id: id.to_string(),
            job_id: job_id.to_string(),
            batch_id,
            batch_name,
            pipeline_name: pipeline_name.to_string(),
            status: ExperimentStatus::Started,
            config,
            results: None,
            error: None,
            model_path: None,
            created_at,
            completed_at: None,
            failed_at: None,
        }
    }
}

/// The only two updates an experiment ever receives.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalUpdate {
    Success {
        results: Value,
        model_path: Option<String>,
    },
    Failure {
        error: ErrorRecord,
    },
}

impl TerminalUpdate {
    pub fn status(&self) -> ExperimentStatus {
        match self {
            Self::Success { .. } => ExperimentStatus::Success,
            Self::Failure { .. } => ExperimentStatus::Failure,
        }
    }
}

/// Derive an experiment id: `<pipeline>_<YYYYmmdd_HHMMSS>_<job-id prefix>`.
pub fn experiment_id(pipeline_name: &str, job_id: &str, at: DateTime<Utc>) -> String {
    let prefix: String = job_id.chars().take(JOB_ID_PREFIX_LEN).collect();
    format!("{pipeline_name}_{}_{prefix}", at.format("%Y%m%d_%H%M%S"))
}
