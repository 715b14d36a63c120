//! Live training progress.
//!
//! Pipelines report each finished epoch to a `ProgressObserver`. The worker
//! hands them a `ProgressChannel`, which publishes the event on
//! `task-progress:<job_id>`. Delivery is best-effort: a failed publish is
//! logged and dropped, never raised into the training loop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::Broker;

/// Held-out targets and predictions a pipeline may attach to an epoch report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSamples {
    pub y_true: Vec<f64>,
    pub y_pred: Vec<f64>,
}

/// Message body published after each epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub epoch: u32,
    pub loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_samples: Option<ValidationSamples>,
}

impl ProgressEvent {
    pub fn new(epoch: u32, loss: f64) -> Self {
        Self {
            epoch,
            loss,
            validation_samples: None,
        }
    }
}

/// Receives progress from pipeline code. Implementations must not fail the caller.
pub trait ProgressObserver: Send + Sync {
    fn on_epoch_end(&self, event: &ProgressEvent);
}

/// Observer that discards everything.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_epoch_end(&self, _event: &ProgressEvent) {}
}

/// Pub/sub channel name for a job.
pub fn progress_channel_name(job_id: &str) -> String {
    format!("task-progress:{job_id}")
}

/// Per-job publisher of progress events.
pub struct ProgressChannel {
    job_id: String,
    channel: String,
    broker: Arc<dyn Broker>,
}

impl ProgressChannel {
    pub fn new(job_id: &str, broker: Arc<dyn Broker>) -> Self {
        Self {
            job_id: job_id.to_string(),
            channel: progress_channel_name(job_id),
            broker,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Serialize and publish one event. Errors are logged, never returned.
    pub fn publish(&self, event: &ProgressEvent) {
        let message = match serde_json::to_string(event) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Progress event not serializable");
                return;
            }
        };
        if let Err(e) = self.broker.publish(&self.channel, &message) {
            tracing::warn!(
                job_id = %self.job_id,
                epoch = event.epoch,
                error = %e,
                "Progress publish failed, continuing"
            );
        }
    }
}

impl ProgressObserver for ProgressChannel {
    fn on_epoch_end(&self, event: &ProgressEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[test]
    fn publishes_on_job_namespaced_channel() {
        let broker = Arc::new(MemoryBroker::new());
        let channel = ProgressChannel::new("job-42", broker.clone());
        channel.on_epoch_end(&ProgressEvent::new(1, 0.5));

        let messages = broker.messages_on("task-progress:job-42");
        assert_eq!(messages.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(body["epoch"], 1);
        assert_eq!(body["loss"], 0.5);
        assert!(body.get("validation_samples").is_none());
    }

    #[test]
    fn validation_samples_included_when_present() {
        let broker = Arc::new(MemoryBroker::new());
        let channel = ProgressChannel::new("j", broker.clone());
        let event = ProgressEvent {
            epoch: 2,
            loss: 0.1,
            validation_samples: Some(ValidationSamples {
                y_true: vec![1.0, 2.0],
                y_pred: vec![1.1, 1.9],
            }),
        };
        channel.publish(&event);

        let body: ProgressEvent =
            serde_json::from_str(&broker.messages_on("task-progress:j")[0]).unwrap();
        assert_eq!(body, event);
    }

    #[test]
    fn broker_failure_is_swallowed() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_publish_failure(true);
        let channel = ProgressChannel::new("j", broker.clone());
        // Must not panic or propagate.
        channel.on_epoch_end(&ProgressEvent::new(1, 1.0));
        assert!(broker.published().is_empty());
    }

    #[test]
    fn unreachable_redis_does_not_abort_training() {
        let broker = Arc::new(crate::broker::RedisBroker::new("redis://127.0.0.1:1/0").unwrap());
        let channel = ProgressChannel::new("j", broker);
        for epoch in 1..=3 {
            channel.on_epoch_end(&ProgressEvent::new(epoch, 0.1));
        }
        assert_eq!(channel.job_id(), "j");
    }
}
