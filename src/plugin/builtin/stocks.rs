//! `stocks`: time-indexed price forecaster.
//!
//! Data comes from a deterministic synthetic random walk seeded by the ticker,
//! or from an HTTP CSV endpoint (`Date,Open,High,Low,Close,Volume`). Features
//! are min-max scaled, cut into sliding windows of `sequence_length` rows, and
//! a linear model learns the next scaled target value. The last 20% of windows
//! is held out and reported with every epoch.

use std::path::Path;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::linear::{LinearRegressor, Sample};
use crate::plugin::{
    config_f64, config_usize, Dataset, InputShape, MinMaxScaler, Model, Pipeline, PipelineError,
    RunOutput, TimeSeriesSpec,
};
use crate::progress::{ProgressEvent, ProgressObserver, ValidationSamples};

pub const NAME: &str = "stocks";

pub const SYNTHETIC_SOURCE: &str = "synthetic";

const DEFAULT_EPOCHS: usize = 10;
const DEFAULT_SEQUENCE_LENGTH: usize = 10;
const DEFAULT_POINTS: usize = 250;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Most validation points attached to a single progress event.
const MAX_VALIDATION_SAMPLES: usize = 50;

const COLUMNS: [&str; 5] = ["Open", "High", "Low", "Close", "Volume"];

pub fn default_config() -> Value {
    json!({
        "ticker": "ACME",
        "data_source": SYNTHETIC_SOURCE,
        "points": DEFAULT_POINTS,
        "sequence_length": DEFAULT_SEQUENCE_LENGTH,
        "target_column": "Close",
        "feature_columns": ["Close"],
        "training_params": {
            "epochs": DEFAULT_EPOCHS,
            "learning_rate": 0.05,
        },
    })
}

pub fn factory(config: &Value) -> Result<Box<dyn Pipeline>, PipelineError> {
    Ok(Box::new(StocksPipeline::from_config(config)?))
}

#[derive(Debug)]
struct StocksPipeline {
    ticker: String,
    data_source: String,
    points: usize,
    sequence_length: usize,
    epochs: usize,
    learning_rate: f64,
    target_column: String,
    feature_columns: Vec<String>,
    data: Option<Dataset>,
}

fn config_str(config: &Value, key: &str, default: &str) -> Result<String, PipelineError> {
    match config.get(key) {
        None => Ok(default.to_string()),
        Some(v) => v
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Config(format!("{key} must be a string"))),
    }
}

impl StocksPipeline {
    fn from_config(config: &Value) -> Result<Self, PipelineError> {
        let ticker = config_str(config, "ticker", "ACME")?;
        let data_source = config_str(config, "data_source", SYNTHETIC_SOURCE)?;
        let target_column = config_str(config, "target_column", "Close")?;
        let feature_columns = match config.get("feature_columns") {
            None => vec![target_column.clone()],
            Some(v) => serde_json::from_value::<Vec<String>>(v.clone())
                .map_err(|e| PipelineError::Config(format!("feature_columns: {e}")))?,
        };
        if !feature_columns.contains(&target_column) {
            return Err(PipelineError::Config(format!(
                "feature_columns must include target column '{target_column}'"
            )));
        }
        if ticker.trim().is_empty() {
            return Err(PipelineError::Config("ticker must not be empty".into()));
        }

        let sequence_length = config_usize(config, &["/sequence_length"], DEFAULT_SEQUENCE_LENGTH)?;
        if sequence_length == 0 {
            return Err(PipelineError::Config("sequence_length must be positive".into()));
        }
        let learning_rate = config_f64(
            config,
            &["/training_params/learning_rate", "/learning_rate"],
            0.05,
        )?;
        if learning_rate <= 0.0 {
            return Err(PipelineError::Config("learning_rate must be positive".into()));
        }

        Ok(Self {
            ticker,
            data_source,
            points: config_usize(config, &["/points"], DEFAULT_POINTS)?,
            sequence_length,
            epochs: config_usize(config, &["/training_params/epochs", "/epochs"], DEFAULT_EPOCHS)?,
            learning_rate,
            target_column,
            feature_columns,
            data: None,
        })
    }

    fn input_shape(&self) -> InputShape {
        InputShape {
            sequence_length: self.sequence_length,
            n_features: self.feature_columns.len(),
        }
    }

    fn target_index(&self) -> usize {
        self.feature_columns
            .iter()
            .position(|c| *c == self.target_column)
            .unwrap_or(0)
    }

    /// Sliding windows over scaled rows, each paired with the next scaled target.
    fn windows(&self, scaled: &[Vec<f64>]) -> Vec<Sample> {
        let target = self.target_index();
        scaled
            .windows(self.sequence_length + 1)
            .map(|w| {
                let (input, next) = w.split_at(self.sequence_length);
                (input.to_vec(), next[0][target])
            })
            .collect()
    }
}

impl Pipeline for StocksPipeline {
    fn time_series(&self) -> Option<TimeSeriesSpec> {
        Some(TimeSeriesSpec {
            target_column: self.target_column.clone(),
            feature_columns: self.feature_columns.clone(),
        })
    }

    fn caching_keys(&self) -> &[&'static str] {
        &["ticker", "data_source", "points"]
    }

    fn fetch_data(&self) -> Result<Dataset, PipelineError> {
        if self.data_source == SYNTHETIC_SOURCE {
            synthetic_series(&self.ticker, self.points)
        } else {
            let url = self.data_source.replace("{ticker}", &self.ticker);
            fetch_csv(&url)
        }
    }

    fn set_data(&mut self, data: Dataset) {
        self.data = Some(data);
    }

    fn run(&mut self, progress: &dyn ProgressObserver) -> Result<RunOutput, PipelineError> {
        let data = match self.data.take() {
            Some(d) => d,
            None => self.fetch_data()?,
        };
        let rows = data.select(&self.feature_columns)?;
        if rows.len() < self.sequence_length + 2 {
            return Err(PipelineError::Execution(format!(
                "{} rows are not enough for sequence_length {}",
                rows.len(),
                self.sequence_length
            )));
        }

        let scaler = MinMaxScaler::fit(&rows)?;
        let samples = self.windows(&scaler.transform(&rows));
        let split = (samples.len() * 4 / 5).clamp(1, samples.len() - 1);
        let (train, validation) = samples.split_at(split);

        let target = self.target_index();
        let mut model = LinearRegressor::new(self.input_shape());
        let mut loss = model.mse(train)?;
        for epoch in 1..=self.epochs {
            loss = model.fit_epoch(train, self.learning_rate)?;

            let shown = &validation[validation.len().saturating_sub(MAX_VALIDATION_SAMPLES)..];
            let mut y_true = Vec::with_capacity(shown.len());
            let mut y_pred = Vec::with_capacity(shown.len());
            for (window, actual) in shown {
                y_true.push(scaler.inverse_value(target, *actual));
                y_pred.push(scaler.inverse_value(target, model.predict(window)?));
            }
            progress.on_epoch_end(&ProgressEvent {
                epoch: epoch as u32,
                loss,
                validation_samples: Some(ValidationSamples { y_true, y_pred }),
            });
        }
        let val_loss = model.mse(validation)?;

        Ok(RunOutput {
            results: json!({
                "input_shape": self.input_shape(),
                "target_column": self.target_column,
                "feature_columns": self.feature_columns,
                "final_loss": loss,
                "val_loss": val_loss,
                "train_windows": train.len(),
                "validation_windows": validation.len(),
                "rows": rows.len(),
            }),
            model: Some(Box::new(model)),
        })
    }

    fn load_model(&self, shape: &InputShape, path: &Path) -> Result<Box<dyn Model>, PipelineError> {
        Ok(Box::new(LinearRegressor::load(path, shape)?))
    }
}

// ═══════════════════════════════════════════════════════════
// Data sources
// ═══════════════════════════════════════════════════════════

fn ticker_seed(ticker: &str) -> u64 {
    let digest = Sha256::digest(ticker.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Daily OHLCV random walk, identical for identical `(ticker, points)`.
pub fn synthetic_series(ticker: &str, points: usize) -> Result<Dataset, PipelineError> {
    let start = NaiveDate::from_ymd_opt(2020, 1, 1)
        .ok_or_else(|| PipelineError::DataFetch("invalid start date".into()))?;
    let mut rng = StdRng::seed_from_u64(ticker_seed(ticker));
    let mut close: f64 = rng.gen_range(20.0..200.0);

    let mut index = Vec::with_capacity(points);
    let mut rows = Vec::with_capacity(points);
    for day in 0..points {
        let open = close;
        close = (open * (1.0 + rng.gen_range(-0.02..0.021))).max(1.0);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
        let volume = rng.gen_range(100_000.0..1_000_000.0_f64).round();
        index.push((start + ChronoDuration::days(day as i64)).to_string());
        rows.push(vec![open, high, low, close, volume]);
    }

    Dataset::new(index, COLUMNS.iter().map(|c| c.to_string()).collect(), rows)
}

fn fetch_csv(url: &str) -> Result<Dataset, PipelineError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| PipelineError::DataFetch(format!("HTTP client: {e}")))?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| PipelineError::DataFetch(format!("GET {url}: {e}")))?;
    parse_csv(&body)
}

/// Parse a price CSV whose first column is the date label.
pub fn parse_csv(body: &str) -> Result<Dataset, PipelineError> {
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| PipelineError::DataFetch("empty CSV response".into()))?;
    let columns: Vec<String> = header
        .split(',')
        .skip(1)
        .map(|c| c.trim().to_string())
        .collect();

    let mut index = Vec::new();
    let mut rows = Vec::new();
    for (n, line) in lines.enumerate() {
        let mut fields = line.split(',');
        let label = fields.next().unwrap_or_default().trim().to_string();
        let row = fields
            .map(|f| f.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::DataFetch(format!("CSV line {}: {e}", n + 2)))?;
        index.push(label);
        rows.push(row);
    }
    Dataset::new(index, columns, rows)
}
