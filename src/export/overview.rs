//! Subjob overview report, written as gzip JSON.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::pipeline::events::{DownloadFailureLog, FailureLog};
use crate::pipeline::types::DockingTask;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub workunit_id: String,
    pub subjob_id: String,
    pub job_name: String,
    pub ligand_library_format: String,
    pub scenarios: Vec<String>,
    pub vcpus: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockingsStatus {
    pub success: u64,
    pub failed: u64,
}

/// Counters and failure lists for one subjob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewReport {
    pub metadata: RunMetadata,
    pub total_dockings: u64,
    pub dockings_status: DockingsStatus,
    pub skipped_ligands: u64,
    pub skipped_ligand_list: Vec<FailureLog>,
    pub failed_list: Vec<FailureLog>,
    pub failed_downloads: u64,
    pub failed_downloads_log: Vec<DownloadFailureLog>,
    pub failed_downloads_dockings: u64,
    /// Wall-clock seconds of the run.
    pub sec: f64,
}

impl OverviewReport {
    pub fn new(metadata: RunMetadata) -> Self {
        Self {
            metadata,
            total_dockings: 0,
            dockings_status: DockingsStatus::default(),
            skipped_ligands: 0,
            skipped_ligand_list: Vec::new(),
            failed_list: Vec::new(),
            failed_downloads: 0,
            failed_downloads_log: Vec::new(),
            failed_downloads_dockings: 0,
            sec: 0.0,
        }
    }

    pub fn record_task(&mut self, task: &DockingTask) {
        self.total_dockings += 1;
        if task.is_success() {
            self.dockings_status.success += 1;
            return;
        }

        self.dockings_status.failed += 1;
        self.failed_list.push(FailureLog {
            base_collection_key: task.base_collection_key.clone(),
            collection_key: task.collection_key.clone(),
            ligand_key: task.ligand_key.clone(),
            reason: task.reason.clone().unwrap_or_default(),
        });
    }

    pub fn record_skip(&mut self, entry: FailureLog) {
        self.skipped_ligands += 1;
        self.skipped_ligand_list.push(entry);
    }

    pub fn record_download_failure(&mut self, entry: DownloadFailureLog) {
        self.failed_downloads += 1;
        self.failed_downloads_dockings += entry.dockings;
        self.failed_downloads_log.push(entry);
    }

    pub fn write_json_gz(&self, path: &Path) -> Result<(), ExportError> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(GzEncoder::new(file, Compression::default()));
        serde_json::to_writer(&mut out, self)?;
        out.flush()?;
        let encoder = out.into_inner().map_err(|e| e.into_error())?;
        encoder.finish()?;
        Ok(())
    }
}
