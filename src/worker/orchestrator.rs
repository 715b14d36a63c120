//! Training job orchestration.
//!
//! ```text
//! CREATED ──prepare──▶ RESOLVING ──▶ RUNNING ──┬──▶ PERSISTING_SUCCESS ──▶ DONE
//!    │                                          └──▶ PERSISTING_FAILURE ──▶ DONE
//!    └── failure before the record exists: orphaned, logged, propagated
//! ```
//!
//! Once the STARTED record exists, every outcome ends in exactly one terminal
//! update and the error (if any) is returned to the caller unchanged, so the
//! queue's view of the task and the experiment record always agree.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::context::WorkerContext;
use crate::error::{ErrorRecord, JobError};
use crate::models::{experiment_id, Experiment, ExperimentStatus, TerminalUpdate};
use crate::plugin::{call_plugin, MODEL_FILE_NAME};
use crate::progress::ProgressChannel;

/// Queue-visible result of a training job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingOutcome {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    pub model_path: Option<String>,
}

/// Accepted job with its record persisted.
struct PreparedJob {
    experiment_id: String,
    pipeline_name: String,
    experiment_dir: PathBuf,
    config: Value,
}

struct Completed {
    results: Value,
    model_path: Option<String>,
}

/// Run one training job end to end.
pub fn start_training_pipeline(
    ctx: &WorkerContext,
    job_id: &str,
    config: Value,
) -> Result<TrainingOutcome, JobError> {
    let span = tracing::info_span!("training_job", job_id = %job_id);
    let _guard = span.enter();
    tracing::info!(state = "CREATED", "Training job accepted");

    let job = match prepare(ctx, job_id, config, Utc::now()) {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(
                orphaned = true,
                kind = %e.kind(),
                error = %e,
                "Training job failed before an experiment record existed"
            );
            return Err(e);
        }
    };

    match execute(ctx, job_id, &job) {
        Ok(done) => persist_success(ctx, &job, done),
        Err(e) => {
            persist_failure(ctx, &job.experiment_id, &e);
            Err(e)
        }
    }
}

/// Derive the id, merge system fields into the config, persist STARTED.
fn prepare(
    ctx: &WorkerContext,
    job_id: &str,
    config: Value,
    started_at: DateTime<Utc>,
) -> Result<PreparedJob, JobError> {
    let Value::Object(mut fields) = config else {
        return Err(JobError::Config("job configuration must be a JSON object".into()));
    };
    let pipeline_name = fields
        .get("pipeline_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| JobError::Config("pipeline_name is required".into()))?;

    let experiment_id = experiment_id(&pipeline_name, job_id, started_at);
    let experiment_dir = ctx.config.reports_dir.join(&experiment_id);

    fields.insert("job_id".into(), Value::from(job_id));
    fields.insert("experiment_id".into(), Value::from(experiment_id.as_str()));
    fields.insert(
        "experiment_dir".into(),
        Value::from(experiment_dir.to_string_lossy().as_ref()),
    );
    fields.insert(
        "start_time".into(),
        Value::from(started_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    let config = Value::Object(fields);

    let record = Experiment::started(&experiment_id, job_id, &pipeline_name, config.clone(), started_at);
    ctx.store.create(&record)?;
    tracing::info!(
        experiment_id = %experiment_id,
        pipeline = %pipeline_name,
        status = %ExperimentStatus::Started,
        "Experiment record created"
    );

    Ok(PreparedJob {
        experiment_id,
        pipeline_name,
        experiment_dir,
        config,
    })
}

fn execute(ctx: &WorkerContext, job_id: &str, job: &PreparedJob) -> Result<Completed, JobError> {
    tracing::info!(state = "RESOLVING", pipeline = %job.pipeline_name, "Resolving pipeline");
    let entry = ctx.registry.resolve(&job.pipeline_name)?;
    let mut pipeline = entry.build(&job.config)?;

    let time_series = call_plugin("inspect pipeline", || Ok(pipeline.time_series()))?;
    if time_series.is_some() {
        let data = ctx
            .cache
            .get_or_fetch(pipeline.as_ref(), &job.pipeline_name, &job.config)?;
        tracing::debug!(rows = data.len(), "Dataset injected from cache");
        call_plugin("set data", || {
            pipeline.set_data(data);
            Ok(())
        })?;
    }

    tracing::info!(state = "RUNNING", experiment_id = %job.experiment_id, "Running pipeline");
    let progress = ProgressChannel::new(job_id, ctx.broker.clone());
    let output = call_plugin("run pipeline", || pipeline.run(&progress))?;

    let model_path = match output.model {
        Some(model) => {
            let path = save_model_path(&job.experiment_dir)?;
            call_plugin("save model", || model.save(&path))?;
            tracing::info!(path = %path.display(), "Model artifact saved");
            Some(path.to_string_lossy().into_owned())
        }
        None => None,
    };

    Ok(Completed {
        results: output.results,
        model_path,
    })
}

fn save_model_path(experiment_dir: &Path) -> Result<PathBuf, JobError> {
    std::fs::create_dir_all(experiment_dir).map_err(|e| {
        JobError::Artifact(format!("create {}: {e}", experiment_dir.display()))
    })?;
    Ok(experiment_dir.join(MODEL_FILE_NAME))
}

fn persist_success(
    ctx: &WorkerContext,
    job: &PreparedJob,
    done: Completed,
) -> Result<TrainingOutcome, JobError> {
    tracing::info!(state = "PERSISTING_SUCCESS", experiment_id = %job.experiment_id);
    let update = TerminalUpdate::Success {
        results: done.results,
        model_path: done.model_path.clone(),
    };
    if let Err(e) = ctx.store.update(&job.experiment_id, &update) {
        let err = JobError::from(e);
        tracing::error!(experiment_id = %job.experiment_id, error = %err, "Could not persist SUCCESS");
        persist_failure(ctx, &job.experiment_id, &err);
        return Err(err);
    }
    tracing::info!(state = "DONE", experiment_id = %job.experiment_id, status = %ExperimentStatus::Success);
    Ok(TrainingOutcome {
        experiment_id: job.experiment_id.clone(),
        status: ExperimentStatus::Success,
        model_path: done.model_path,
    })
}

/// Record FAILURE. A store error here is logged; the job's own error wins.
fn persist_failure(ctx: &WorkerContext, experiment_id: &str, err: &JobError) {
    tracing::info!(state = "PERSISTING_FAILURE", experiment_id, kind = %err.kind(), error = %err);
    let update = TerminalUpdate::Failure {
        error: ErrorRecord::from(err),
    };
    match ctx.store.update(experiment_id, &update) {
        Ok(_) => {
            tracing::info!(state = "DONE", experiment_id, status = %ExperimentStatus::Failure);
        }
        Err(e) => {
            tracing::error!(experiment_id, error = %e, "Could not persist FAILURE");
        }
    }
}
