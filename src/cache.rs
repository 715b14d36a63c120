//! Shared data cache.
//!
//! Datasets are keyed by a fingerprint of the pipeline name and only the
//! config fields the pipeline declares as caching-relevant. Lookup order:
//!
//! 1. in-process memo (moka, LRU, bounded); a hit still has to be younger
//!    than `max_age` measured from its original `fetched_at`
//! 2. durable tier: `<dir>/<pipeline>/<fingerprint>.json`, valid while younger than `max_age`
//! 3. cold fetch through the pipeline's own `fetch_data`
//!
//! There is no cross-process lock. Two workers missing on the same
//! fingerprint both fetch and both write; each write is an atomic rename, so
//! readers only ever see a complete entry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::JobError;
use crate::fs_helpers::write_atomic;
use crate::plugin::{call_plugin, Dataset, Pipeline};

/// moka refuses lifetimes past 1000 years; freshness is checked per hit anyway.
const MEMO_TTL_CAP: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    /// Durable tier on/off. The memo tier is always active.
    pub enabled: bool,
    pub max_age: Duration,
    pub memo_capacity: u64,
}

/// On-disk record of one cached dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: Dataset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memo_hits: u64,
    pub disk_hits: u64,
    pub cold_fetches: u64,
}

/// Hash of the pipeline name plus the selected config fields.
///
/// Absent keys hash as `null`, so adding an unrelated field never changes
/// the fingerprint.
pub fn fingerprint(pipeline_name: &str, keys: &[&str], config: &Value) -> String {
    let params: BTreeMap<&str, &Value> = keys
        .iter()
        .map(|k| (*k, config.get(*k).unwrap_or(&Value::Null)))
        .collect();
    let canonical = serde_json::json!({
        "pipeline": pipeline_name,
        "params": params,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn path_segment(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub struct DataCache {
    settings: CacheSettings,
    memo: Cache<String, Arc<CacheEntry>>,
    memo_hits: AtomicU64,
    disk_hits: AtomicU64,
    cold_fetches: AtomicU64,
}

impl DataCache {
    pub fn new(settings: CacheSettings) -> Self {
        let memo = Cache::builder()
            .max_capacity(settings.memo_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .time_to_live(settings.max_age.min(MEMO_TTL_CAP))
            .build();
        Self {
            settings,
            memo,
            memo_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            cold_fetches: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>) -> bool {
        Utc::now()
            .signed_duration_since(fetched_at)
            .to_std()
            .map(|age| age < self.settings.max_age)
            // Negative age means a future timestamp; trust it.
            .unwrap_or(true)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memo_hits: self.memo_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            cold_fetches: self.cold_fetches.load(Ordering::Relaxed),
        }
    }

    fn entry_path(&self, pipeline_name: &str, fingerprint: &str) -> PathBuf {
        self.settings
            .dir
            .join(path_segment(pipeline_name))
            .join(format!("{fingerprint}.json"))
    }

    /// Return the pipeline's dataset, fetching it only when no fresh copy exists.
    pub fn get_or_fetch(
        &self,
        pipeline: &dyn Pipeline,
        pipeline_name: &str,
        config: &Value,
    ) -> Result<Dataset, JobError> {
        let fp = fingerprint(pipeline_name, pipeline.caching_keys(), config);

        if let Some(hit) = self.memo.get(&fp) {
            if self.is_fresh(hit.fetched_at) {
                self.memo_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pipeline = pipeline_name, fingerprint = %fp, "Data cache memo hit");
                return Ok(hit.payload.clone());
            }
            tracing::debug!(pipeline = pipeline_name, fingerprint = %fp, "Data cache memo entry stale");
            self.memo.invalidate(&fp);
        }

        if self.settings.enabled {
            if let Some(entry) = self.read_disk(pipeline_name, &fp) {
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pipeline = pipeline_name, fingerprint = %fp, "Data cache disk hit");
                let data = entry.payload.clone();
                self.memo.insert(fp, Arc::new(entry));
                return Ok(data);
            }
        }

        self.cold_fetches.fetch_add(1, Ordering::Relaxed);
        tracing::info!(pipeline = pipeline_name, fingerprint = %fp, "Data cache miss, fetching from source");
        let data = call_plugin("fetch data", || pipeline.fetch_data())?;

        if !data.is_empty() {
            let entry = CacheEntry {
                fingerprint: fp.clone(),
                fetched_at: Utc::now(),
                payload: data.clone(),
            };
            if self.settings.enabled {
                self.write_disk(pipeline_name, &entry);
            }
            self.memo.insert(fp, Arc::new(entry));
        }
        Ok(data)
    }

    fn read_disk(&self, pipeline_name: &str, fp: &str) -> Option<CacheEntry> {
        let path = self.entry_path(pipeline_name, fp);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Data cache read failed, treating as miss");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Data cache entry corrupt, treating as miss");
                return None;
            }
        };
        if entry.fingerprint != fp {
            tracing::warn!(path = %path.display(), "Data cache entry fingerprint mismatch");
            return None;
        }
        if !self.is_fresh(entry.fetched_at) {
            let age = Utc::now().signed_duration_since(entry.fetched_at);
            tracing::debug!(path = %path.display(), age_secs = age.num_seconds(), "Data cache entry stale");
            return None;
        }
        Some(entry)
    }

    fn write_disk(&self, pipeline_name: &str, entry: &CacheEntry) {
        let path = self.entry_path(pipeline_name, &entry.fingerprint);
        let result = serde_json::to_vec(entry)
            .map_err(std::io::Error::other)
            .and_then(|bytes| write_atomic(&path, &bytes));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Data cache write failed");
        }
    }
}
