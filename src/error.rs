//! Error taxonomy for the storage engine.
//!
//! Storage and integrity failures propagate to the caller. Fetch failures
//! and processor failures are never errors here: they are recorded as data
//! (in the manifest and in derived error lines respectively).

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = VaultError> = std::result::Result<T, E>;

/// Errors surfaced by the vault
#[derive(Debug, Error)]
pub enum VaultError {
    /// Local disk I/O failure (disk full, permission denied, ...)
    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// Index unavailable or corrupt. Callers degrade to a manifest scan.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Processor already registered: {0}")]
    DuplicateProcessor(String),

    #[error("Unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl VaultError {
    /// Wrap an I/O error with the path it occurred on
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Whether durability or integrity guarantees were violated
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Integrity(_))
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

/// Bytes on disk do not match the hash they are stored under
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Blob {expected} failed verification (read bytes hash to {actual})")]
    Mismatch { expected: String, actual: String },

    #[error(
        "Hash collision on {hash}: existing object has {existing_size} bytes, incoming has {incoming_size}"
    )]
    Collision {
        hash: String,
        existing_size: u64,
        incoming_size: u64,
    },

    #[error("Malformed blob hash: {0}")]
    MalformedHash(String),
}

/// Catalog failures
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let storage = VaultError::storage("/tmp/x", std::io::Error::other("disk full"));
        assert!(storage.is_fatal());

        let integrity = VaultError::from(IntegrityError::MalformedHash("zz".to_string()));
        assert!(integrity.is_fatal());

        let catalog = VaultError::from(CatalogError::Unavailable("locked".to_string()));
        assert!(!catalog.is_fatal());
    }

    #[test]
    fn test_storage_error_mentions_path() {
        let err = VaultError::storage(
            "/data/raw/blobs",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/data/raw/blobs"));
    }
}
