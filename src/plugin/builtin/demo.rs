//! `demo`: tabular linear regression on deterministic synthetic data.
//!
//! Fits `y = 3x + 2` plus seeded noise. Not time-indexed, so it never goes
//! through the data cache and cannot serve forecasts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use super::linear::{LinearRegressor, Sample};
use crate::plugin::{config_f64, config_usize, InputShape, Pipeline, PipelineError, RunOutput};
use crate::progress::{ProgressEvent, ProgressObserver};

pub const NAME: &str = "demo";

const DEFAULT_EPOCHS: usize = 10;

pub fn default_config() -> Value {
    json!({
        "epochs": DEFAULT_EPOCHS,
        "learning_rate": 0.1,
        "samples": 64,
        "seed": 7,
    })
}

pub fn factory(config: &Value) -> Result<Box<dyn Pipeline>, PipelineError> {
    Ok(Box::new(DemoPipeline::from_config(config)?))
}

#[derive(Debug)]
struct DemoPipeline {
    epochs: usize,
    learning_rate: f64,
    samples: usize,
    seed: u64,
}

impl DemoPipeline {
    fn from_config(config: &Value) -> Result<Self, PipelineError> {
        let epochs = config_usize(config, &["/training_params/epochs", "/epochs"], DEFAULT_EPOCHS)?;
        let learning_rate = config_f64(
            config,
            &["/training_params/learning_rate", "/learning_rate"],
            0.1,
        )?;
        let samples = config_usize(config, &["/samples"], 64)?;
        let seed = config_usize(config, &["/seed"], 7)? as u64;
        if samples == 0 {
            return Err(PipelineError::Config("samples must be positive".into()));
        }
        if learning_rate <= 0.0 {
            return Err(PipelineError::Config("learning_rate must be positive".into()));
        }
        Ok(Self {
            epochs,
            learning_rate,
            samples,
            seed,
        })
    }

    fn synthetic_samples(&self) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.samples)
            .map(|_| {
                let x: f64 = rng.gen_range(0.0..1.0);
                let noise: f64 = rng.gen_range(-0.05..0.05);
                (vec![vec![x]], 3.0 * x + 2.0 + noise)
            })
            .collect()
    }
}

impl Pipeline for DemoPipeline {
    fn run(&mut self, progress: &dyn ProgressObserver) -> Result<RunOutput, PipelineError> {
        let samples = self.synthetic_samples();
        let mut model = LinearRegressor::new(InputShape {
            sequence_length: 1,
            n_features: 1,
        });

        let mut loss = model.mse(&samples)?;
        for epoch in 1..=self.epochs {
            loss = model.fit_epoch(&samples, self.learning_rate)?;
            progress.on_epoch_end(&ProgressEvent::new(epoch as u32, loss));
        }

        Ok(RunOutput {
            results: json!({
                "final_loss": loss,
                "epochs": self.epochs,
                "samples": self.samples,
            }),
            model: Some(Box::new(model)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressObserver for Recorder {
        fn on_epoch_end(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn emits_one_event_per_epoch() {
        let mut pipeline = factory(&json!({"epochs": 3})).unwrap();
        let recorder = Recorder::default();
        let output = pipeline.run(&recorder).unwrap();

        let epochs: Vec<u32> = recorder.0.lock().unwrap().iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3]);
        assert!(output.model.is_some());
        assert_eq!(output.results["epochs"], 3);
    }

    #[test]
    fn epochs_read_from_training_params() {
        let pipeline = DemoPipeline::from_config(&json!({"epochs": 2, "training_params": {"epochs": 5}})).unwrap();
        assert_eq!(pipeline.epochs, 5);
    }

    #[test]
    fn loss_decreases() {
        let mut pipeline = factory(&json!({"epochs": 40})).unwrap();
        let recorder = Recorder::default();
        pipeline.run(&recorder).unwrap();
        let events = recorder.0.lock().unwrap();
        assert!(events.last().unwrap().loss < events.first().unwrap().loss);
    }

    #[test]
    fn is_not_time_indexed() {
        let pipeline = factory(&default_config()).unwrap();
        assert!(pipeline.time_series().is_none());
    }

    #[test]
    fn rejects_bad_config() {
        assert!(factory(&json!({"samples": 0})).is_err());
        assert!(factory(&json!({"learning_rate": -1.0})).is_err());
        assert!(factory(&json!({"epochs": "three"})).is_err());
    }
}
