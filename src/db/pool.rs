//! Per-process SQLite connection pool.
//!
//! Connections are opened on demand and returned to an idle list when the
//! checkout guard drops. Migrations run once, when the pool is built.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

use super::sqlite::open_database;
use super::DatabaseError;

/// Idle connections kept per worker process.
pub const DEFAULT_MAX_IDLE: usize = 4;

pub struct ConnectionPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl ConnectionPool {
    /// Open the first connection (running migrations) and keep it idle.
    pub fn open(path: &Path, max_idle: usize) -> Result<Self, DatabaseError> {
        let first = open_database(path)?;
        tracing::info!(path = %path.display(), "Experiment database pool ready");
        Ok(Self {
            path: path.to_path_buf(),
            idle: Mutex::new(vec![first]),
            max_idle: max_idle.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check out a connection, opening a new one when none is idle.
    pub fn get(&self) -> Result<PooledConnection<'_>, DatabaseError> {
        let reused = self
            .idle
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned)?
            .pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                tracing::debug!(path = %self.path.display(), "Opening additional pooled connection");
                open_database(&self.path)?
            }
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
        })
    }

    /// Number of connections currently idle.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.max_idle {
                idle.push(conn);
            }
        }
    }
}

/// Checked-out connection; returns to the pool on drop.
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_reuses_idle_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("p.db"), 2).unwrap();
        assert_eq!(pool.idle_count(), 1);
        {
            let conn = pool.get().unwrap();
            assert_eq!(pool.idle_count(), 0);
            let one: i64 = conn.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
            assert_eq!(one, 1);
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn concurrent_checkouts_open_extra_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("p.db"), 2).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let c = pool.get().unwrap();
        drop((a, b, c));
        // Only max_idle connections are kept.
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn connections_share_one_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("p.db"), 2).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        a.execute("INSERT INTO schema_version (version, applied_at) VALUES (99, 'x')", [])
            .unwrap();
        let seen: i64 = b
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(seen, 99);
    }
}
