//! Message broker access: pub/sub, the shared catalog hash, and the task queue.
//!
//! `RedisBroker` and `RedisTaskQueue` connect lazily on first command and
//! drop the connection after any error, so the next call reconnects. A failed
//! connect makes calls fail fast for a few seconds before trying again.
//! `MemoryBroker` implements both traits in-process for tests and dry runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::{Client, Connection};
use thiserror::Error;

use crate::db::redact_url;

/// Upper bound for establishing a broker connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a failed connect suppresses further attempts.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker unreachable at {0}")]
    Unreachable(String),

    #[error("Internal lock error")]
    LockPoisoned,
}

// ═══════════════════════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════════════════════

/// Fire-and-forget publication and the externally visible catalog.
pub trait Broker: Send + Sync {
    /// Publish one message on a pub/sub channel. No acknowledgement.
    fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError>;

    /// Replace the whole hash at `key` with `entries` in one transaction.
    fn replace_hash(&self, key: &str, entries: &[(String, String)]) -> Result<(), BrokerError>;
}

/// The distributed queue this worker consumes. One instance per worker slot.
pub trait TaskQueue: Send {
    /// Wait up to `timeout` for the next raw task envelope.
    fn next_task(&self, timeout: Duration) -> Result<Option<String>, BrokerError>;

    /// Record a task's outcome where the submitter can read it.
    fn report_result(&self, task_id: &str, payload: &str) -> Result<(), BrokerError>;
}

/// Key under which a task's outcome is stored.
pub fn result_key(task_id: &str) -> String {
    format!("task-result:{task_id}")
}

// ═══════════════════════════════════════════════════════════
// Redis
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
struct ConnState {
    conn: Option<Connection>,
    /// After a failed connect, calls fail fast until this instant.
    retry_at: Option<Instant>,
}

/// Lazily established connection shared behind a mutex.
///
/// Connecting happens outside the lock, and a failed attempt starts a short
/// cooldown, so callers never queue behind a connect timeout.
struct LazyConnection {
    client: Client,
    url: String,
    state: Mutex<ConnState>,
    connect_attempts: AtomicU64,
}

impl LazyConnection {
    fn new(url: &str) -> Result<Self, BrokerError> {
        // Client::open only parses the URL; no socket is opened here.
        let client = Client::open(url)?;
        Ok(Self {
            client,
            url: redact_url(url),
            state: Mutex::new(ConnState::default()),
            connect_attempts: AtomicU64::new(0),
        })
    }

    fn connect(&self) -> Result<(), BrokerError> {
        {
            let state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
            if state.conn.is_some() {
                return Ok(());
            }
            if state.retry_at.is_some_and(|at| Instant::now() < at) {
                return Err(BrokerError::Unreachable(self.url.clone()));
            }
        }

        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let attempt = self.client.get_connection_with_timeout(CONNECT_TIMEOUT);

        let mut state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        match attempt {
            Ok(conn) => {
                state.retry_at = None;
                // Another caller may have won the race; keep theirs.
                if state.conn.is_none() {
                    state.conn = Some(conn);
                }
                Ok(())
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Broker connect failed");
                state.retry_at = Some(Instant::now() + RECONNECT_COOLDOWN);
                Err(BrokerError::Unreachable(self.url.clone()))
            }
        }
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T, BrokerError> {
        self.connect()?;
        let mut state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        let Some(conn) = state.conn.as_mut() else {
            return Err(BrokerError::Unreachable(self.url.clone()));
        };
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                // Force a reconnect on the next call.
                state.conn = None;
                Err(BrokerError::Redis(e))
            }
        }
    }
}

/// Redis-backed pub/sub and catalog publisher, shared by every job of a process.
pub struct RedisBroker {
    conn: LazyConnection,
}

impl RedisBroker {
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            conn: LazyConnection::new(url)?,
        })
    }
}

impl Broker for RedisBroker {
    fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError> {
        self.conn.with(|c| {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(message)
                .query::<i64>(c)
                .map(|_| ())
        })
    }

    fn replace_hash(&self, key: &str, entries: &[(String, String)]) -> Result<(), BrokerError> {
        self.conn.with(|c| {
            let mut pipe = redis::pipe();
            pipe.atomic().del(key).ignore();
            if !entries.is_empty() {
                pipe.hset_multiple(key, entries).ignore();
            }
            pipe.query::<()>(c)
        })
    }
}

/// Redis list consumer. Envelopes are pushed with `RPUSH <queue>` and popped with `BLPOP`.
pub struct RedisTaskQueue {
    conn: LazyConnection,
    queue: String,
    result_ttl_secs: u64,
}

impl RedisTaskQueue {
    pub fn new(url: &str, queue: &str, result_ttl_secs: u64) -> Result<Self, BrokerError> {
        Ok(Self {
            conn: LazyConnection::new(url)?,
            queue: queue.to_string(),
            result_ttl_secs,
        })
    }
}

impl TaskQueue for RedisTaskQueue {
    fn next_task(&self, timeout: Duration) -> Result<Option<String>, BrokerError> {
        let secs = timeout.as_secs().max(1);
        let popped: Option<(String, String)> = self.conn.with(|c| {
            redis::cmd("BLPOP").arg(&self.queue).arg(secs).query(c)
        })?;
        Ok(popped.map(|(_, envelope)| envelope))
    }

    fn report_result(&self, task_id: &str, payload: &str) -> Result<(), BrokerError> {
        let key = result_key(task_id);
        self.conn.with(|c| {
            redis::cmd("SET")
                .arg(&key)
                .arg(payload)
                .arg("EX")
                .arg(self.result_ttl_secs)
                .query::<()>(c)
        })
    }
}

// ═══════════════════════════════════════════════════════════
// In-memory broker
// ═══════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryState {
    published: Vec<(String, String)>,
    hashes: HashMap<String, HashMap<String, String>>,
    queue: VecDeque<String>,
    results: HashMap<String, String>,
}

/// In-process broker that records everything it is asked to do.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    fail_publish: AtomicBool,
    fail_catalog: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `publish` fail until reset.
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make every `replace_hash` fail until reset.
    pub fn set_catalog_failure(&self, fail: bool) {
        self.fail_catalog.store(fail, Ordering::SeqCst);
    }

    /// All `(channel, message)` pairs published so far.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map(|s| s.published.clone())
            .unwrap_or_default()
    }

    /// Messages published on one channel, in order.
    pub fn messages_on(&self, channel: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        self.state.lock().ok().and_then(|s| s.hashes.get(key).cloned())
    }

    /// Enqueue a raw envelope for `next_task`.
    pub fn push_task(&self, envelope: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.queue.push_back(envelope.to_string());
        }
    }

    pub fn result(&self, task_id: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.results.get(&result_key(task_id)).cloned())
    }
}

impl Broker for MemoryBroker {
    fn publish(&self, channel: &str, message: &str) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("memory://publish".to_string()));
        }
        let mut state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        state
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }

    fn replace_hash(&self, key: &str, entries: &[(String, String)]) -> Result<(), BrokerError> {
        if self.fail_catalog.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("memory://catalog".to_string()));
        }
        let mut state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        let replacement: HashMap<String, String> = entries.iter().cloned().collect();
        state.hashes.insert(key.to_string(), replacement);
        Ok(())
    }
}

impl TaskQueue for MemoryBroker {
    fn next_task(&self, _timeout: Duration) -> Result<Option<String>, BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        Ok(state.queue.pop_front())
    }

    fn report_result(&self, task_id: &str, payload: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().map_err(|_| BrokerError::LockPoisoned)?;
        state.results.insert(result_key(task_id), payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _assert_broker(_: &dyn Broker) {}
        fn _assert_queue(_: &dyn TaskQueue) {}
    }

    #[test]
    fn memory_broker_records_publishes_per_channel() {
        let broker = MemoryBroker::new();
        broker.publish("a", "1").unwrap();
        broker.publish("b", "2").unwrap();
        broker.publish("a", "3").unwrap();
        assert_eq!(broker.messages_on("a"), vec!["1".to_string(), "3".to_string()]);
        assert_eq!(broker.published().len(), 3);
    }

    #[test]
    fn memory_broker_publish_failure_toggle() {
        let broker = MemoryBroker::new();
        broker.set_publish_failure(true);
        assert!(broker.publish("a", "1").is_err());
        broker.set_publish_failure(false);
        assert!(broker.publish("a", "1").is_ok());
    }

    #[test]
    fn replace_hash_is_wholesale() {
        let broker = MemoryBroker::new();
        broker
            .replace_hash("cat", &[("x".into(), "1".into()), ("y".into(), "2".into())])
            .unwrap();
        broker.replace_hash("cat", &[("z".into(), "3".into())]).unwrap();
        let hash = broker.hash("cat").unwrap();
        assert_eq!(hash.len(), 1);
        assert_eq!(hash.get("z").map(String::as_str), Some("3"));
    }

    #[test]
    fn memory_queue_is_fifo_and_results_keyed() {
        let broker = MemoryBroker::new();
        broker.push_task("first");
        broker.push_task("second");
        let timeout = Duration::from_millis(1);
        assert_eq!(broker.next_task(timeout).unwrap().as_deref(), Some("first"));
        assert_eq!(broker.next_task(timeout).unwrap().as_deref(), Some("second"));
        assert!(broker.next_task(timeout).unwrap().is_none());

        broker.report_result("t1", "{}").unwrap();
        assert_eq!(broker.result("t1").as_deref(), Some("{}"));
    }

    #[test]
    fn redis_clients_do_not_connect_on_construction() {
        // Nothing listens on this port; construction must still succeed.
        assert!(RedisBroker::new("redis://127.0.0.1:1/0").is_ok());
        assert!(RedisTaskQueue::new("redis://127.0.0.1:1/0", "q", 60).is_ok());
    }

    #[test]
    fn unreachable_redis_surfaces_as_error() {
        let broker = RedisBroker::new("redis://127.0.0.1:1/0").unwrap();
        assert!(broker.publish("task-progress:x", "{}").is_err());
    }

    #[test]
    fn failed_connect_is_not_retried_during_cooldown() {
        let broker = RedisBroker::new("redis://127.0.0.1:1/0").unwrap();
        for _ in 0..5 {
            assert!(matches!(
                broker.publish("task-progress:x", "{}"),
                Err(BrokerError::Unreachable(_))
            ));
        }
        assert_eq!(broker.conn.connect_attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn result_key_is_namespaced() {
        assert_eq!(result_key("abc"), "task-result:abc");
    }
}
