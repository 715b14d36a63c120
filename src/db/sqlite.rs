use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use super::DatabaseError;

/// How long a connection waits on a lock held by another worker process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a SQLite connection to the given path and run migrations
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::MigrationFailed {
                version: 0,
                reason: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
    }
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // journal_mode returns a row, so it cannot go through execute_batch.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        include_str!("../../resources/migrations/001_experiments.sql"),
    )];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

/// Resolve a database URL into the SQLite file it names.
///
/// Accepts `sqlite://relative/path`, `sqlite:///absolute/path` and
/// `sqlite:path`. Any other scheme is rejected: this worker ships only
/// the SQLite backend.
pub fn sqlite_path_from_url(url: &str) -> Result<PathBuf, DatabaseError> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .ok_or_else(|| DatabaseError::UnsupportedUrl(redact_url(url)))?;
    if rest.is_empty() {
        return Err(DatabaseError::UnsupportedUrl(redact_url(url)));
    }
    Ok(PathBuf::from(rest))
}

/// Hide the password component of a URL before it reaches logs or errors.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_version_is_current() {
        let conn = open_memory_database().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn migration_idempotent() {
        let conn = open_memory_database().unwrap();
        // Run migrations again; must not error
        let result = run_migrations(&conn);
        assert!(result.is_ok());
    }

    #[test]
    fn experiments_table_exists() {
        let conn = open_memory_database().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='experiments'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn open_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("experiments.db");
        let _conn = open_database(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn sqlite_urls_resolve_to_paths() {
        assert_eq!(
            sqlite_path_from_url("sqlite:///var/lib/forge/exp.db").unwrap(),
            PathBuf::from("/var/lib/forge/exp.db")
        );
        assert_eq!(
            sqlite_path_from_url("sqlite://data/exp.db").unwrap(),
            PathBuf::from("data/exp.db")
        );
        assert_eq!(
            sqlite_path_from_url("sqlite:exp.db").unwrap(),
            PathBuf::from("exp.db")
        );
    }

    #[test]
    fn non_sqlite_url_rejected_with_redacted_password() {
        let err = sqlite_path_from_url("postgresql://forge:hunter2@db:5432/forge").unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, DatabaseError::UnsupportedUrl(_)));
        assert!(!msg.contains("hunter2"));
        assert!(msg.contains("forge:***@db:5432/forge"));
    }

    #[test]
    fn empty_sqlite_path_rejected() {
        assert!(sqlite_path_from_url("sqlite://").is_err());
    }
}
