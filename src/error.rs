//! Job error taxonomy.
//!
//! Every failure a job can hit is a `JobError`. `JobError::kind()` maps each
//! variant onto the persisted `ErrorKind`, so the value written into an
//! experiment's `error` column never depends on matching error strings.

use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerError;
use crate::db::DatabaseError;
use crate::plugin::PipelineError;

// ═══════════════════════════════════════════════════════════
// ErrorKind
// ═══════════════════════════════════════════════════════════

/// Persisted failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Missing or invalid pipeline name or required field.
    ConfigError,
    /// Pipeline absent from the registry even after rediscovery.
    PluginNotFound,
    /// Source or cache I/O failure.
    DataFetchError,
    /// Uncaught fault inside plugin code.
    PipelineExecutionError,
    /// Model save/load failure.
    ArtifactError,
    /// Capability not implemented for this pipeline kind.
    PredictionUnsupported,
    /// Database or broker unreachable.
    StoreUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "CONFIG_ERROR",
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
            Self::DataFetchError => "DATA_FETCH_ERROR",
            Self::PipelineExecutionError => "PIPELINE_EXECUTION_ERROR",
            Self::ArtifactError => "ARTIFACT_ERROR",
            Self::PredictionUnsupported => "PREDICTION_UNSUPPORTED",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// JobError
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job configuration: {0}")]
    Config(String),

    #[error("Pipeline '{0}' is not registered")]
    PluginNotFound(String),

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Experiment {id} is {status}, predictions need a successful run")]
    ExperimentNotReady { id: String, status: String },

    #[error("Data fetch failed: {0}")]
    DataFetch(String),

    #[error("Pipeline execution failed: {0}")]
    Execution(String),

    #[error("Pipeline panicked: {0}")]
    Panic(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Prediction not supported: {0}")]
    PredictionUnsupported(String),

    #[error("Experiment store unavailable: {0}")]
    Store(#[from] DatabaseError),

    #[error("Broker unavailable: {0}")]
    Broker(#[from] BrokerError),
}

impl JobError {
    /// Taxonomy bucket persisted with a FAILURE record.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::ExperimentNotFound(_) | Self::ExperimentNotReady { .. } => {
                ErrorKind::ConfigError
            }
            Self::PluginNotFound(_) => ErrorKind::PluginNotFound,
            Self::DataFetch(_) => ErrorKind::DataFetchError,
            Self::Execution(_) | Self::Panic(_) => ErrorKind::PipelineExecutionError,
            Self::Artifact(_) => ErrorKind::ArtifactError,
            Self::PredictionUnsupported(_) => ErrorKind::PredictionUnsupported,
            Self::Store(_) | Self::Broker(_) => ErrorKind::StoreUnavailable,
        }
    }
}

impl From<PipelineError> for JobError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Config(msg) => Self::Config(msg),
            PipelineError::DataFetch(msg) => Self::DataFetch(msg),
            PipelineError::Execution(msg) => Self::Execution(msg),
            PipelineError::Artifact(msg) => Self::Artifact(msg),
            PipelineError::Unsupported(msg) => Self::PredictionUnsupported(msg),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// ErrorRecord: persisted `error` document
// ═══════════════════════════════════════════════════════════

/// Error document stored on a FAILURE experiment and returned with failed tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            trace: message.clone(),
            message,
        }
    }
}

impl From<&JobError> for ErrorRecord {
    fn from(err: &JobError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            trace: render_chain(err),
        }
    }
}

/// Render an error and its sources, one per line, outermost first.
pub fn render_chain(err: &dyn StdError) -> String {
    let mut lines = vec![format!("{err}")];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    lines.join("\n")
}

/// Extract a readable message from a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
