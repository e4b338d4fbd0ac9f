//! Error types for blockvault

use crate::crypto::CryptoError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for blockvault operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Crypto error ({context}): {source}")]
    Crypto {
        context: String,
        #[source]
        source: CryptoError,
    },

    #[error("Index error ({context}): {source}")]
    Index {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Corrupt {table} record {id}: {reason}")]
    CorruptRecord {
        table: &'static str,
        id: i64,
        reason: String,
    },

    #[error("Block already indexed: {hash}")]
    DuplicateBlock { hash: String },

    #[error("Referenced {table} row {id} does not exist")]
    MissingReference { table: &'static str, id: i64 },

    #[error("Backup name already exists: {name}")]
    BackupNameExists { name: String },

    #[error("Backup not found: {id}")]
    BackupNotFound { id: i64 },

    #[error("No backups found in the index")]
    NoBackups,

    #[error("Block name {name} is too short to shard")]
    InvalidBlockName { name: String },

    #[error("Block not found: {name} (hash {hash})")]
    BlockNotFound { name: String, hash: String },

    #[error("Integrity verification failed for {entity}: expected {expected}, got {actual}")]
    Integrity {
        entity: String,
        expected: String,
        actual: String,
    },

    #[error("Refusing to restore unsafe path: {}", path.display())]
    UnsafePath { path: PathBuf },

    #[error("Backup selection failed: {reason}")]
    Selection { reason: String },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl Error {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn crypto(context: impl Into<String>, source: CryptoError) -> Self {
        Self::Crypto {
            context: context.into(),
            source,
        }
    }

    pub fn index(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Index {
            context: context.into(),
            source,
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

/// Result type alias for blockvault operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_names_path() {
        let err = Error::io(
            "/data/report.pdf",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/data/report.pdf"));
    }

    #[test]
    fn test_backup_name_exists_message() {
        let err = Error::BackupNameExists {
            name: "nightly".to_string(),
        };
        assert_eq!(err.to_string(), "Backup name already exists: nightly");
    }
}
