//! Worker slot loop.
//!
//! A slot pops one envelope at a time and runs it to completion on the
//! calling thread. The shutdown flag is checked between tasks only; a running
//! job is never interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::tasks::handle_envelope;
use crate::broker::TaskQueue;
use crate::context::WorkerContext;

/// Blocking pop timeout; bounds how long shutdown waits on an idle slot.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

/// Sleep for `total`, waking early once `shutdown` is set.
fn pause(total: Duration, shutdown: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let step = left.min(SHUTDOWN_CHECK);
        std::thread::sleep(step);
        left -= step;
    }
}

/// Consume tasks until `shutdown` is set. Returns the number of tasks handled.
pub fn run_slot(
    slot: usize,
    ctx: &WorkerContext,
    queue: &dyn TaskQueue,
    shutdown: &AtomicBool,
) -> usize {
    let span = tracing::info_span!("worker_slot", slot);
    let _guard = span.enter();
    tracing::info!("Worker slot started");

    let mut handled = 0;
    let mut backoff = Duration::from_millis(500);
    while !shutdown.load(Ordering::SeqCst) {
        let raw = match queue.next_task(POLL_TIMEOUT) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "Queue unavailable");
                pause(backoff, shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = Duration::from_millis(500);

        let Some(result) = handle_envelope(ctx, &raw) else {
            continue;
        };
        handled += 1;
        match serde_json::to_string(&result) {
            Ok(payload) => {
                if let Err(e) = queue.report_result(&result.task_id, &payload) {
                    tracing::error!(task_id = %result.task_id, error = %e, "Could not report task result");
                }
            }
            Err(e) => {
                tracing::error!(task_id = %result.task_id, error = %e, "Task result not serializable");
            }
        }
    }

    tracing::info!(handled, "Worker slot stopped");
    handled
}
