//! Process-scoped worker state.
//!
//! Built once at startup and shared by every worker slot. The store pool,
//! plugin catalog and data cache live here for the whole process; no job
//! creates or resets its own.

use std::sync::Arc;

use crate::broker::{Broker, BrokerError, RedisBroker};
use crate::cache::DataCache;
use crate::config::WorkerConfig;
use crate::db::{redact_url, DatabaseError, ExperimentStore};
use crate::plugin::{builtin, PluginRegistry, PluginSource};

pub struct WorkerContext {
    pub config: WorkerConfig,
    pub registry: PluginRegistry,
    pub cache: DataCache,
    pub store: ExperimentStore,
    pub broker: Arc<dyn Broker>,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn PluginSource>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            registry: PluginRegistry::new(source, Some(Arc::clone(&broker))),
            cache: DataCache::new(config.cache.clone()),
            store: ExperimentStore::new(config.database_url.clone()),
            broker,
            config,
        }
    }

    /// Production wiring: Redis broker and the compiled-in plugins.
    pub fn from_config(config: WorkerConfig) -> Result<Self, BrokerError> {
        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(&config.redis_url)?);
        Ok(Self::new(config, Arc::new(builtin::source()), broker))
    }

    /// Open the store pool now so an unusable database stops startup
    /// instead of failing every job.
    pub fn check_store(&self) -> Result<(), DatabaseError> {
        self.store.pool().map(drop).map_err(|e| {
            tracing::error!(
                database = %redact_url(&self.config.database_url),
                error = %e,
                "Experiment store unavailable"
            );
            e
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::plugin::StaticPluginSource;

    /// Context rooted in `dir`, backed by an in-memory broker.
    pub fn context_with(
        dir: &std::path::Path,
        source: StaticPluginSource,
    ) -> (WorkerContext, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let ctx = WorkerContext::new(
            WorkerConfig::rooted_at(dir),
            Arc::new(source),
            broker.clone(),
        );
        (ctx, broker)
    }

    /// Same, with the compiled-in plugins already discovered.
    pub fn builtin_context(dir: &std::path::Path) -> (WorkerContext, Arc<MemoryBroker>) {
        let (ctx, broker) = context_with(dir, builtin::source());
        ctx.registry.discover();
        (ctx, broker)
    }
}
