//! Plugin registry: discovery, resolution and catalog publication.
//!
//! Discovery reads two tables from a `PluginSource`: pipeline factories and
//! optional default-config providers keyed by the same names. Each pipeline
//! may ship a form schema in its unit; a missing or broken schema costs a
//! warning, not the plugin. The finished catalog replaces the previous one in
//! a single pointer swap and is mirrored to the broker's catalog hash.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::{json, Value};

use super::{call_plugin, ConfigProvider, Pipeline, PipelineError, PipelineFactory};
use crate::broker::Broker;
use crate::error::JobError;

/// Broker hash mirroring the catalog, one field per pipeline.
pub const CATALOG_KEY: &str = "pipeline_catalog";

// ═══════════════════════════════════════════════════════════
// Source tables
// ═══════════════════════════════════════════════════════════

/// One pipeline implementation, as registered by its installable unit.
#[derive(Clone)]
pub struct PipelineEntry {
    pub name: String,
    /// The unit (package) that ships this pipeline and its resources.
    pub unit: String,
    pub factory: PipelineFactory,
}

#[derive(Clone)]
pub struct ConfigProviderEntry {
    pub name: String,
    pub provider: ConfigProvider,
}

/// Where plugins are discovered from.
pub trait PluginSource: Send + Sync {
    fn pipelines(&self) -> Vec<PipelineEntry>;

    fn config_providers(&self) -> Vec<ConfigProviderEntry>;

    /// The unit's form schema, `None` when it ships none.
    fn form_schema(&self, unit: &str) -> Result<Option<Value>, PipelineError>;
}

/// Plugin tables held in memory: the compiled-in plugins, or any table a test builds.
#[derive(Clone, Default)]
pub struct StaticPluginSource {
    pipelines: Vec<PipelineEntry>,
    providers: Vec<ConfigProviderEntry>,
    schemas: HashMap<String, String>,
}

impl StaticPluginSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipeline(mut self, name: &str, unit: &str, factory: PipelineFactory) -> Self {
        self.pipelines.push(PipelineEntry {
            name: name.to_string(),
            unit: unit.to_string(),
            factory,
        });
        self
    }

    pub fn with_config_provider(mut self, name: &str, provider: ConfigProvider) -> Self {
        self.providers.push(ConfigProviderEntry {
            name: name.to_string(),
            provider,
        });
        self
    }

    /// Attach a raw JSON form schema to a unit.
    pub fn with_form_schema(mut self, unit: &str, raw: &str) -> Self {
        self.schemas.insert(unit.to_string(), raw.to_string());
        self
    }
}

impl PluginSource for StaticPluginSource {
    fn pipelines(&self) -> Vec<PipelineEntry> {
        self.pipelines.clone()
    }

    fn config_providers(&self) -> Vec<ConfigProviderEntry> {
        self.providers.clone()
    }

    fn form_schema(&self, unit: &str) -> Result<Option<Value>, PipelineError> {
        self.schemas
            .get(unit)
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| PipelineError::Config(format!("form schema of '{unit}': {e}")))
            })
            .transpose()
    }
}

// ═══════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════

/// Read-only catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDescriptor {
    pub name: String,
    pub default_config: Value,
    pub ui_schema: Value,
}

#[derive(Clone)]
pub struct RegisteredPipeline {
    pub descriptor: PipelineDescriptor,
    factory: PipelineFactory,
}

impl RegisteredPipeline {
    /// Instantiate the pipeline for one job.
    pub fn build(&self, config: &Value) -> Result<Box<dyn Pipeline>, JobError> {
        let factory = self.factory;
        call_plugin("construct pipeline", || factory(config))
    }
}

/// Immutable snapshot of all discovered pipelines.
#[derive(Default)]
pub struct Catalog {
    entries: BTreeMap<String, RegisteredPipeline>,
}

impl Catalog {
    pub fn get(&self, name: &str) -> Option<&RegisteredPipeline> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PipelineDescriptor> {
        self.entries.values().map(|e| &e.descriptor)
    }
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

pub struct PluginRegistry {
    source: Arc<dyn PluginSource>,
    catalog: RwLock<Arc<Catalog>>,
    broker: Option<Arc<dyn Broker>>,
    /// Serializes discovery runs; readers never wait on it.
    discovering: Mutex<()>,
}

impl PluginRegistry {
    /// An empty registry. Call `discover` to populate it.
    pub fn new(source: Arc<dyn PluginSource>, broker: Option<Arc<dyn Broker>>) -> Self {
        Self {
            source,
            catalog: RwLock::new(Arc::new(Catalog::default())),
            broker,
            discovering: Mutex::new(()),
        }
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<Catalog> {
        match self.catalog.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Scan the source, build a new catalog, swap it in and mirror it.
    pub fn discover(&self) -> Arc<Catalog> {
        let _running = self.discovering.lock().unwrap_or_else(|p| p.into_inner());
        let _span = tracing::info_span!("plugin_discovery").entered();

        let catalog = Arc::new(self.build_catalog());
        if catalog.is_empty() {
            tracing::warn!("No pipeline plugins discovered; jobs will fail with PLUGIN_NOT_FOUND");
        } else {
            tracing::info!(count = catalog.len(), pipelines = ?catalog.names(), "Pipeline plugins discovered");
        }

        match self.catalog.write() {
            Ok(mut guard) => *guard = Arc::clone(&catalog),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&catalog),
        }

        self.publish(&catalog);
        catalog
    }

    /// Look a pipeline up, rediscovering once on a miss.
    pub fn resolve(&self, name: &str) -> Result<RegisteredPipeline, JobError> {
        if let Some(entry) = self.catalog().get(name) {
            return Ok(entry.clone());
        }
        tracing::info!(pipeline = name, "Pipeline not in catalog, rediscovering");
        self.discover()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::PluginNotFound(name.to_string()))
    }

    fn build_catalog(&self) -> Catalog {
        let mut providers: HashMap<String, ConfigProvider> = HashMap::new();
        for entry in self.source.config_providers() {
            providers.insert(entry.name, entry.provider);
        }

        let mut entries = BTreeMap::new();
        for entry in self.source.pipelines() {
            let default_config = match providers.get(&entry.name) {
                Some(&provider) => match call_plugin("default config", || Ok(provider())) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(pipeline = %entry.name, error = %e, "Default config provider failed, using empty config");
                        json!({})
                    }
                },
                None => json!({}),
            };

            let source = Arc::clone(&self.source);
            let unit = entry.unit.clone();
            let ui_schema = match call_plugin("form schema", move || source.form_schema(&unit)) {
                Ok(Some(schema)) => schema,
                Ok(None) => {
                    tracing::warn!(pipeline = %entry.name, unit = %entry.unit, "No form schema shipped, using empty schema");
                    json!({})
                }
                Err(e) => {
                    tracing::warn!(pipeline = %entry.name, unit = %entry.unit, error = %e, "Form schema unreadable, using empty schema");
                    json!({})
                }
            };

            if entries.contains_key(&entry.name) {
                tracing::warn!(pipeline = %entry.name, unit = %entry.unit, "Duplicate pipeline name, later registration wins");
            }
            entries.insert(
                entry.name.clone(),
                RegisteredPipeline {
                    descriptor: PipelineDescriptor {
                        name: entry.name,
                        default_config,
                        ui_schema,
                    },
                    factory: entry.factory,
                },
            );
        }

        Catalog { entries }
    }

    fn publish(&self, catalog: &Catalog) {
        let Some(broker) = &self.broker else {
            return;
        };
        let fields: Vec<(String, String)> = catalog
            .descriptors()
            .map(|d| {
                let value = json!({
                    "id": d.name,
                    "default_config": d.default_config,
                    "form_schema": d.ui_schema,
                });
                (d.name.clone(), value.to_string())
            })
            .collect();
        if let Err(e) = broker.replace_hash(CATALOG_KEY, &fields) {
            tracing::warn!(error = %e, "Catalog publication failed; local registry still updated");
        }
    }
}
