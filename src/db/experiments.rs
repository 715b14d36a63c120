//! Experiment store: durable lifecycle records.
//!
//! The pool is built on first use and kept for the life of the process.
//! `update` only ever moves a STARTED row to SUCCESS or FAILURE; anything
//! else is logged and ignored so failure handling never fails in turn.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::pool::{ConnectionPool, DEFAULT_MAX_IDLE};
use super::sqlite::{redact_url, sqlite_path_from_url};
use super::DatabaseError;
use crate::error::ErrorRecord;
use crate::models::{Experiment, ExperimentStatus, TerminalUpdate};

const SELECT_COLUMNS: &str = "id, job_id, batch_id, batch_name, pipeline_name, status, config,
     results, error, model_path, created_at, completed_at, failed_at";

/// What a terminal `update` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// No row with that id.
    Missing,
    /// The row had already left STARTED; the transition was refused.
    AlreadyTerminal(ExperimentStatus),
}

pub struct ExperimentStore {
    url: String,
    pool: Mutex<Option<Arc<ConnectionPool>>>,
}

impl ExperimentStore {
    /// Create a store for the given database URL. Nothing is opened yet.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: Mutex::new(None),
        }
    }

    /// The process-wide pool, built on first call.
    pub fn pool(&self) -> Result<Arc<ConnectionPool>, DatabaseError> {
        let mut slot = self.pool.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let path = sqlite_path_from_url(&self.url)?;
        tracing::info!(url = %redact_url(&self.url), "Initializing experiment store pool");
        let pool = Arc::new(ConnectionPool::open(&path, DEFAULT_MAX_IDLE)?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Insert a STARTED record carrying the fully resolved configuration.
    pub fn create(&self, experiment: &Experiment) -> Result<(), DatabaseError> {
        let pool = self.pool()?;
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO experiments
             (id, job_id, batch_id, batch_name, pipeline_name, status, config, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                experiment.id,
                experiment.job_id,
                experiment.batch_id,
                experiment.batch_name,
                experiment.pipeline_name,
                ExperimentStatus::Started.as_str(),
                to_json(&experiment.config, "config")?,
                format_ts(experiment.created_at),
            ],
        )?;
        tracing::debug!(experiment_id = %experiment.id, "Experiment record created");
        Ok(())
    }

    /// Apply one of the two terminal transitions.
    pub fn update(&self, id: &str, update: &TerminalUpdate) -> Result<UpdateOutcome, DatabaseError> {
        let pool = self.pool()?;
        let conn = pool.get()?;
        let now = format_ts(Utc::now());

        let changed = match update {
            TerminalUpdate::Success { results, model_path } => conn.execute(
                "UPDATE experiments
                 SET status = 'SUCCESS', results = ?1, model_path = ?2, completed_at = ?3
                 WHERE id = ?4 AND status = 'STARTED'",
                params![to_json(results, "results")?, model_path, now, id],
            )?,
            TerminalUpdate::Failure { error } => conn.execute(
                "UPDATE experiments
                 SET status = 'FAILURE', error = ?1, failed_at = ?2
                 WHERE id = ?3 AND status = 'STARTED'",
                params![to_json(error, "error")?, now, id],
            )?,
        };

        if changed == 1 {
            tracing::debug!(experiment_id = id, status = %update.status(), "Experiment finalized");
            return Ok(UpdateOutcome::Applied);
        }

        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM experiments WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                tracing::error!(
                    experiment_id = id,
                    status = %update.status(),
                    "Terminal update for missing experiment ignored"
                );
                Ok(UpdateOutcome::Missing)
            }
            Some(status) => {
                let status = ExperimentStatus::from_str(&status)?;
                tracing::error!(
                    experiment_id = id,
                    current = %status,
                    requested = %update.status(),
                    "Refusing to re-finalize experiment"
                );
                Ok(UpdateOutcome::AlreadyTerminal(status))
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Experiment>, DatabaseError> {
        let pool = self.pool()?;
        let conn = pool.get()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM experiments WHERE id = ?1"),
                params![id],
                ExperimentRow::from_row,
            )
            .optional()?;
        raw.map(experiment_from_row).transpose()
    }

    /// All experiments of a batch, oldest first.
    pub fn list_by_batch(&self, batch_id: &str) -> Result<Vec<Experiment>, DatabaseError> {
        let pool = self.pool()?;
        let conn = pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM experiments
             WHERE batch_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![batch_id], ExperimentRow::from_row)?;

        let mut experiments = Vec::new();
        for row in rows {
            experiments.push(experiment_from_row(row?)?);
        }
        Ok(experiments)
    }
}

// ═══════════════════════════════════════════
// Internal row mapping
// ═══════════════════════════════════════════

struct ExperimentRow {
    id: String,
    job_id: String,
    batch_id: Option<String>,
    batch_name: Option<String>,
    pipeline_name: String,
    status: String,
    config: String,
    results: Option<String>,
    error: Option<String>,
    model_path: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    failed_at: Option<String>,
}

impl ExperimentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            batch_id: row.get(2)?,
            batch_name: row.get(3)?,
            pipeline_name: row.get(4)?,
            status: row.get(5)?,
            config: row.get(6)?,
            results: row.get(7)?,
            error: row.get(8)?,
            model_path: row.get(9)?,
            created_at: row.get(10)?,
            completed_at: row.get(11)?,
            failed_at: row.get(12)?,
        })
    }
}

fn experiment_from_row(row: ExperimentRow) -> Result<Experiment, DatabaseError> {
    let config: Value = from_json(&row.config, "config")?;
    let results: Option<Value> = row
        .results
        .as_deref()
        .map(|s| from_json(s, "results"))
        .transpose()?;
    let error: Option<ErrorRecord> = row
        .error
        .as_deref()
        .map(|s| from_json(s, "error"))
        .transpose()?;

    Ok(Experiment {
        id: row.id,
        job_id: row.job_id,
        batch_id: row.batch_id,
        batch_name: row.batch_name,
        pipeline_name: row.pipeline_name,
        status: ExperimentStatus::from_str(&row.status)?,
        config,
        results,
        error,
        model_path: row.model_path,
        created_at: parse_ts(&row.created_at, "created_at")?,
        completed_at: row
            .completed_at
            .as_deref()
            .map(|s| parse_ts(s, "completed_at"))
            .transpose()?,
        failed_at: row
            .failed_at
            .as_deref()
            .map(|s| parse_ts(s, "failed_at"))
            .transpose()?,
    })
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str, column: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DatabaseError::CorruptColumn {
            column: column.to_string(),
            reason: e.to_string(),
        })
}

fn to_json<T: serde::Serialize>(value: &T, column: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::CorruptColumn {
        column: column.to_string(),
        reason: e.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, column: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::CorruptColumn {
        column: column.to_string(),
        reason: e.to_string(),
    })
}
