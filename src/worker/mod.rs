//! Job execution: training orchestration, prediction, and queue consumption.

pub mod forecast;
pub mod orchestrator;
pub mod prediction;
pub mod runner;
pub mod tasks;

pub use orchestrator::{start_training_pipeline, TrainingOutcome};
pub use prediction::{predict_from_model, PredictionRequest, PredictionResponse};
pub use tasks::{TaskEnvelope, TaskResult, TaskStatus};
