pub mod experiments;
pub mod pool;
pub mod sqlite;

pub use experiments::*;
pub use pool::*;
pub use sqlite::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),

    #[error("Corrupt column {column}: {reason}")]
    CorruptColumn { column: String, reason: String },

    #[error("Internal lock error")]
    LockPoisoned,
}
