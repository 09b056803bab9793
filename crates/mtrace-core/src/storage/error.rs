//! Storage errors
//!
//! Failures of the local SQLite store, classified so the engine can tell
//! a transient condition (busy database, full disk) from a broken one.

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors raised by the local store
#[derive(Error, Debug)]
pub enum StorageError {
    /// The data directory could not be created
    #[error("cannot create data directory '{path}': {source}")]
    DataDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("permission denied on '{path}'")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no space left while writing '{path}'")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A stored row no longer decodes
    #[error("corrupt row '{key}' in {table}: {details}")]
    CorruptRecord {
        table: &'static str,
        key: String,
        details: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A previous holder of the connection panicked
    #[error("local store lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Classify an I/O failure on `path`
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            _ if is_out_of_space(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::DataDirectory {
                path,
                source: error,
            },
        }
    }

    /// Whether a later attempt at the same write may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            StorageError::DiskFull { .. } | StorageError::LockPoisoned => true,
            StorageError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::DiskFull
            ),
            _ => false,
        }
    }

    /// What an operator can do about it
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => {
                Some("Free up disk space; pending mutations stay in memory until then.")
            }
            StorageError::PermissionDenied { .. } => {
                Some("Check the permissions of the data directory (MTRACE_DATA_DIR).")
            }
            StorageError::DataDirectory { .. } => {
                Some("Point MTRACE_DATA_DIR at a writable directory.")
            }
            StorageError::CorruptRecord { table: "entities", .. } => {
                Some("Run `mtrace sync --force` to rebuild entity snapshots from the server.")
            }
            StorageError::CorruptRecord { .. } => {
                Some("Inspect the row with `mtrace queue list --json` or `mtrace conflicts list --json`.")
            }
            StorageError::Database(_) if self.is_recoverable() => {
                Some("Another process holds the database; try again shortly.")
            }
            _ => None,
        }
    }
}

fn is_out_of_space(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left") || msg.contains("disk full") || msg.contains("quota exceeded")
}

pub type StorageResult<T> = Result<T, StorageError>;
