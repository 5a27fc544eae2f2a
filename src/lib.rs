//! dockforge: subjob runner for large-scale virtual screening.
//!
//! A subjob downloads ligand collections, validates every ligand, docks it
//! against each configured scenario with an external docking program, and
//! uploads an overview report, per-scenario summaries and output archives.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{ArchiveError, BackendError, ExportError, StageError, StorageError};
