pub mod broker;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod fs_helpers;
pub mod models;
pub mod plugin;
pub mod progress;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use broker::{BrokerError, RedisTaskQueue};
use config::{ConfigError, WorkerConfig};
use db::DatabaseError;
use context::WorkerContext;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker setup failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Experiment store unavailable: {0}")]
    Store(#[from] DatabaseError),

    #[error("Worker thread failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}

/// Load config, discover plugins, and serve the queue until Ctrl-C.
pub async fn run() -> Result<(), StartupError> {
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        version = config::APP_VERSION,
        queue = %config.queue,
        device = ?config.device,
        slots = config.concurrency,
        database = %db::redact_url(&config.database_url),
        "{} starting",
        config::APP_NAME
    );

    let ctx = Arc::new(WorkerContext::from_config(config)?);
    let checking = Arc::clone(&ctx);
    tokio::task::spawn_blocking(move || checking.check_store()).await??;

    let discovering = Arc::clone(&ctx);
    tokio::task::spawn_blocking(move || {
        discovering.registry.discover();
    })
    .await?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut slots = Vec::with_capacity(ctx.config.concurrency);
    for slot in 0..ctx.config.concurrency {
        let queue = RedisTaskQueue::new(
            &ctx.config.redis_url,
            &ctx.config.queue,
            ctx.config.task_result_ttl_secs,
        )?;
        let ctx = Arc::clone(&ctx);
        let shutdown = Arc::clone(&shutdown);
        slots.push(tokio::task::spawn_blocking(move || {
            worker::runner::run_slot(slot, &ctx, &queue, &shutdown)
        }));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown requested, finishing running jobs"),
        Err(e) => tracing::error!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
    }
    shutdown.store(true, Ordering::SeqCst);

    let mut handled = 0;
    for slot in slots {
        handled += slot.await?;
    }
    tracing::info!(handled, stats = ?ctx.cache.stats(), "Worker stopped");
    Ok(())
}
