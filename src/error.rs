//! Error types for subjob operations.
//!
//! Defines the error taxonomy shared by the pipeline stages:
//! - Storage transfers (object store and shared filesystem)
//! - Collection archive extraction
//! - Docking backend lookup and invocation
//! - Stage worker failures
//!
//! Per-ligand and per-docking failures are not errors in this sense; they are
//! recorded as log entries and routed to the aggregator (see `pipeline::events`).

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while moving data to or from durable storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object store request for {bucket}/{key} failed: {reason}")]
    Request {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Object store returned HTTP {status} for {bucket}/{key}")]
    Status {
        status: u16,
        bucket: String,
        key: String,
    },

    #[error("No object store configured for {bucket}/{key}")]
    NotConfigured { bucket: String, key: String },

    #[error("Shared filesystem transfer {from} -> {to} failed: {source}")]
    SharedFs {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while opening or extracting a collection archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Cannot open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed archive entry in {path}: {reason}")]
    MalformedEntry { path: PathBuf, reason: String },

    #[error("Failed to build archive {path}: {source}")]
    Build {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by docking backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No backend is registered under this name. Always fatal.
    #[error("No start function for backend '{0}'")]
    Unregistered(String),

    #[error("Backend '{backend}' does not support batch execution")]
    BatchUnsupported { backend: String },

    #[error("Backend '{backend}' config {path}: missing key '{key}'")]
    MissingConfigKey {
        backend: String,
        path: PathBuf,
        key: String,
    },

    #[error("Failed to prepare invocation for '{backend}': {reason}")]
    Setup { backend: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while writing report artifacts.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Nothing to export: {0}")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that terminate a stage worker. Any of these is fatal for the subjob.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Report generation failed: {0}")]
    Report(String),

    #[error("Queue '{0}' closed while the stage was still running")]
    QueueClosed(&'static str),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_backend_message() {
        let err = BackendError::Unregistered("autodock_vr".to_string());
        assert!(err.to_string().contains("autodock_vr"));
        assert!(err.to_string().contains("No start function"));
    }

    #[test]
    fn test_stage_error_from_backend() {
        let err: StageError = BackendError::BatchUnsupported {
            backend: "vina".to_string(),
        }
        .into();
        assert!(matches!(err, StageError::Backend(_)));
        assert!(err.to_string().contains("vina"));
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Status {
            status: 404,
            bucket: "screens".to_string(),
            key: "collections/AAAA/1.tar.gz".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("404"));
        assert!(text.contains("screens/collections/AAAA/1.tar.gz"));
    }
}
