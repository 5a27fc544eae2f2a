//! Configuration for a subjob run.
//!
//! Two layers feed a run:
//!
//! - [`RuntimeSettings`]: process-level settings taken from CLI flags or
//!   `VFVS_*` environment variables (which workunit, where scratch lives,
//!   how many vCPUs to use)
//! - [`JobConfig`]/[`SubjobConfig`]: the job input shipped in the job
//!   tarball (`vf_input/config.json`)

pub mod de;
pub mod job;
pub mod subjob;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::DEFAULT_POLL_INTERVAL;

pub use job::{backend_for_method, JobConfig, ScenarioConfig, SummaryFormat};
pub use subjob::{CollectionEntry, JobInput, SubjobConfig};

/// Default location of the docking program binaries.
pub const DEFAULT_TOOLS_PATH: &str = "/opt/vf/tools/bin";

/// Free space the scratch filesystem needs before a run starts.
pub const DEFAULT_MIN_FREE_SPACE: u64 = 1024 * 1024 * 1024;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting was not provided by flag or environment.
    #[error("Missing setting: {0}")]
    MissingSetting(String),

    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A scenario names a backend that is not registered.
    #[error("Scenario '{scenario}': no start function for backend '{backend}'")]
    UnregisteredBackend { scenario: String, backend: String },

    #[error("Invalid regular expression in {key}: {source}")]
    InvalidRegex {
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid job config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where job inputs and outputs live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    #[default]
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "sharedfs")]
    SharedFs,
}

impl FromStr for StorageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "object" => Ok(StorageMode::S3),
            "sharedfs" => Ok(StorageMode::SharedFs),
            other => Err(ConfigError::InvalidValue {
                key: "job_storage_mode".to_string(),
                message: format!("expected 's3' or 'sharedfs', got '{}'", other),
            }),
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageMode::S3 => write!(f, "s3"),
            StorageMode::SharedFs => write!(f, "sharedfs"),
        }
    }
}

/// Process-level settings for one subjob run.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub workunit_id: String,
    pub subjob_id: String,
    pub storage_mode: StorageMode,
    /// Bucket holding the job tarball (object store mode).
    pub job_bucket: Option<String>,
    /// Object key of the job tarball (object store mode).
    pub job_object: Option<String>,
    /// Path of the job tarball (shared filesystem mode).
    pub job_tarball: Option<PathBuf>,
    pub vcpus: usize,
    /// Parent directory for the run's scratch space.
    pub tmp_path: PathBuf,
    pub tools_path: PathBuf,
    pub object_store_endpoint: Option<String>,
    pub object_store_token: Option<String>,
    /// How long an idle executor waits before flushing partial batches.
    pub poll_interval: Duration,
    /// Bytes that must be free under `tmp_path` for the run to start.
    pub min_free_space: u64,
}

impl RuntimeSettings {
    pub fn new(workunit_id: impl Into<String>, subjob_id: impl Into<String>) -> Self {
        Self {
            workunit_id: workunit_id.into(),
            subjob_id: subjob_id.into(),
            storage_mode: StorageMode::SharedFs,
            job_bucket: None,
            job_object: None,
            job_tarball: None,
            vcpus: 1,
            tmp_path: std::env::temp_dir(),
            tools_path: PathBuf::from(DEFAULT_TOOLS_PATH),
            object_store_endpoint: None,
            object_store_token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_free_space: DEFAULT_MIN_FREE_SPACE,
        }
    }

    /// Validates the settings for the selected storage mode.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingSetting` when a value required by the
    /// storage mode is absent, `ConfigError::ValidationFailed` otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workunit_id.trim().is_empty() {
            return Err(ConfigError::MissingSetting("VFVS_WORKUNIT".to_string()));
        }

        if self.subjob_id.trim().is_empty() {
            return Err(ConfigError::MissingSetting("VFVS_WORKUNIT_SUBJOB".to_string()));
        }

        if self.vcpus == 0 {
            return Err(ConfigError::ValidationFailed(
                "vcpus must be greater than 0".to_string(),
            ));
        }

        match self.storage_mode {
            StorageMode::S3 => {
                if self.job_bucket.is_none() {
                    return Err(ConfigError::MissingSetting(
                        "VFVS_CONFIG_JOB_BUCKET".to_string(),
                    ));
                }
                if self.job_object.is_none() {
                    return Err(ConfigError::MissingSetting(
                        "VFVS_CONFIG_JOB_OBJECT".to_string(),
                    ));
                }
                if self.object_store_endpoint.is_none() {
                    return Err(ConfigError::MissingSetting(
                        "VFVS_OBJECT_STORE_ENDPOINT".to_string(),
                    ));
                }
            }
            StorageMode::SharedFs => {
                if self.job_tarball.is_none() {
                    return Err(ConfigError::MissingSetting("VFVS_CONFIG_JOB_TGZ".to_string()));
                }
            }
        }

        Ok(())
    }

    /// Workers per stage for the configured vCPU budget.
    pub fn worker_counts(&self) -> WorkerCounts {
        WorkerCounts::for_vcpus(self.vcpus)
    }
}

/// Number of workers in each stage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    pub downloaders: usize,
    pub unpackers: usize,
    pub validators: usize,
    pub executors: usize,
    pub aggregators: usize,
    pub uploaders: usize,
}

impl WorkerCounts {
    pub fn for_vcpus(vcpus: usize) -> Self {
        let vcpus = vcpus.max(1);
        let light = vcpus.div_ceil(8);
        Self {
            downloaders: light,
            unpackers: light,
            validators: light,
            executors: vcpus,
            aggregators: 1,
            uploaders: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_share_scheduler_poll_interval() {
        let settings = RuntimeSettings::new("wu", "0");
        assert_eq!(settings.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.min_free_space, DEFAULT_MIN_FREE_SPACE);
    }

    #[test]
    fn test_worker_counts() {
        let counts = WorkerCounts::for_vcpus(16);
        assert_eq!(counts.downloaders, 2);
        assert_eq!(counts.unpackers, 2);
        assert_eq!(counts.validators, 2);
        assert_eq!(counts.executors, 16);
        assert_eq!(counts.aggregators, 1);
        assert_eq!(counts.uploaders, 2);

        let counts = WorkerCounts::for_vcpus(9);
        assert_eq!(counts.downloaders, 2);

        let counts = WorkerCounts::for_vcpus(0);
        assert_eq!(counts.downloaders, 1);
        assert_eq!(counts.executors, 1);
    }

    #[test]
    fn test_storage_mode_parse() {
        assert_eq!("s3".parse::<StorageMode>().unwrap(), StorageMode::S3);
        assert_eq!("SharedFS".parse::<StorageMode>().unwrap(), StorageMode::SharedFs);
        assert!("ftp".parse::<StorageMode>().is_err());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = RuntimeSettings::new("wu-7", "3");
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("VFVS_CONFIG_JOB_TGZ"));

        settings.job_tarball = Some(PathBuf::from("/shared/job.tar.gz"));
        settings.validate().unwrap();

        settings.storage_mode = StorageMode::S3;
        settings.job_bucket = Some("screens".to_string());
        settings.job_object = Some("jobs/job.tar.gz".to_string());
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("VFVS_OBJECT_STORE_ENDPOINT"));
    }
}
