//! Events consumed by the aggregator.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::ExecutionBatch;

/// Why a ligand was not docked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DisallowedElement,
    DuplicateCoordinates,
    TrancheFilter,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::DisallowedElement => "disallowed element",
            SkipReason::DuplicateCoordinates => "duplicate coordinates",
            SkipReason::TrancheFilter => "tranche filter",
        };
        f.write_str(text)
    }
}

/// A per-ligand failure or skip entry in the overview report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureLog {
    pub base_collection_key: String,
    pub collection_key: String,
    pub ligand_key: String,
    pub reason: String,
}

/// A collection that could not be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadFailureLog {
    pub base_collection_key: String,
    pub reason: String,
    /// Dockings lost with the collection.
    pub dockings: u64,
}

/// End-of-collection marker sent by the validator.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMarker {
    pub base_collection_key: String,
    pub expected_completions: u64,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub enum SummaryEvent {
    DownloadFailed(DownloadFailureLog),
    Skip(FailureLog),
    /// All tasks of the collection have been dispatched.
    CollectionDone(CollectionMarker),
    DockingComplete(ExecutionBatch),
}

impl SummaryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SummaryEvent::DownloadFailed(_) => "download_failed",
            SummaryEvent::Skip(_) => "skip",
            SummaryEvent::CollectionDone(_) => "delete",
            SummaryEvent::DockingComplete(_) => "docking_complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_text() {
        assert_eq!(SkipReason::DuplicateCoordinates.to_string(), "duplicate coordinates");
        assert_eq!(SkipReason::DisallowedElement.to_string(), "disallowed element");
    }

    #[test]
    fn test_failure_log_json_shape() {
        let entry = DownloadFailureLog {
            base_collection_key: "AAAA_1".to_string(),
            reason: "HTTP 404".to_string(),
            dockings: 12,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["base_collection_key"], "AAAA_1");
        assert_eq!(json["dockings"], 12);
    }
}
