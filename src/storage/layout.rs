//! Destination layout for report artifacts.

use std::path::PathBuf;

use super::StorageLocator;
use crate::config::{JobConfig, StorageMode};

/// Kind of artifact being shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Overview report, `json.gz`.
    Summary,
    /// Scenario summary table, `csv.gz`.
    Csv,
    /// Scenario summary table, `parquet`.
    Parquet,
    /// Scenario output archive, `tar.gz`.
    Logs,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Summary => "summary",
            ContentType::Csv => "csv",
            ContentType::Parquet => "parquet",
            ContentType::Logs => "logs",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContentType::Summary => "json.gz",
            ContentType::Csv => "csv.gz",
            ContentType::Parquet => "parquet",
            ContentType::Logs => "tar.gz",
        }
    }
}

/// Computes where a subjob's artifacts are stored.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    mode: StorageMode,
    bucket: String,
    prefix: String,
    job_name: String,
    sharedfs_root: PathBuf,
    workunit_id: String,
    subjob_id: String,
}

impl OutputLayout {
    pub fn new(config: &JobConfig, workunit_id: &str, subjob_id: &str) -> Self {
        Self {
            mode: config.job_storage_mode,
            bucket: config.object_store_job_bucket.clone(),
            prefix: config.object_store_job_prefix.trim_matches('/').to_string(),
            job_name: config.job_name.clone(),
            sharedfs_root: config.sharedfs_output_files_path.clone().unwrap_or_default(),
            workunit_id: workunit_id.to_string(),
            subjob_id: subjob_id.to_string(),
        }
    }

    /// Destination of an artifact, optionally scoped to a scenario.
    pub fn locator(&self, scenario: Option<&str>, content_type: ContentType) -> StorageLocator {
        let file_name = format!("{}.{}", self.subjob_id, content_type.extension());

        let mut tail: Vec<&str> = Vec::with_capacity(4);
        if let Some(scenario) = scenario {
            tail.push(scenario);
        }
        tail.push(content_type.as_str());
        tail.push(&self.workunit_id);
        tail.push(&file_name);

        match self.mode {
            StorageMode::S3 => {
                let mut parts: Vec<&str> = Vec::with_capacity(6);
                if !self.prefix.is_empty() {
                    parts.push(&self.prefix);
                }
                parts.push(&self.job_name);
                parts.extend(tail);
                StorageLocator::Object {
                    bucket: self.bucket.clone(),
                    key: parts.join("/"),
                }
            }
            StorageMode::SharedFs => {
                let mut path = self.sharedfs_root.clone();
                path.extend(tail);
                StorageLocator::SharedFs(path)
            }
        }
    }
}
