//! Workunit bootstrap: fetch the job input, select the subjob, run it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::context::JobContext;
use super::orchestrator::{RunnerError, SubjobReport, SubjobRunner};
use crate::backend::BackendRegistry;
use crate::config::{ConfigError, JobInput, RuntimeSettings, StorageMode, SubjobConfig};
use crate::error::{ArchiveError, StorageError};
use crate::storage::{HttpObjectStore, Storage, StorageLocator};

/// Local name of the fetched job tarball.
pub const JOB_TARBALL: &str = "vfvs_input.tar.gz";

/// Location of the job config inside the extracted tarball.
pub const JOB_CONFIG_PATH: &str = "vf_input/config.json";

/// Subjob id that may be absent without failing; array jobs need at least
/// two elements even when only one is used.
pub const PLACEHOLDER_SUBJOB: &str = "1";

/// Errors that can occur before the pipeline starts, or abort it.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot fetch job input: {0}")]
    Storage(#[from] StorageError),

    #[error("Cannot extract job input: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Job input has no {0}")]
    MissingJobConfig(PathBuf),

    #[error("Only {available} bytes free in {path}, need {required}")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("Subjob {subjob} not found in workunit {workunit}")]
    SubjobNotFound { workunit: String, subjob: String },

    #[error("Pipeline aborted: {0}")]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of selecting the subjob in the job input.
#[derive(Debug)]
pub enum SubjobSelection {
    Run(SubjobConfig),
    /// The placeholder subjob is absent; nothing to do.
    NothingToDo,
}

/// Builds the storage facade for the configured settings.
pub fn storage_for(settings: &RuntimeSettings) -> Result<Storage, StorageError> {
    match &settings.object_store_endpoint {
        Some(endpoint) => {
            let client = HttpObjectStore::new(endpoint.clone(), settings.object_store_token.clone())?;
            Ok(Storage::with_object_store(Arc::new(client)))
        }
        None => Ok(Storage::shared_fs_only()),
    }
}

/// Where the job tarball lives for the configured storage mode.
pub fn job_locator(settings: &RuntimeSettings) -> Result<StorageLocator, ConfigError> {
    match settings.storage_mode {
        StorageMode::S3 => Ok(StorageLocator::Object {
            bucket: settings
                .job_bucket
                .clone()
                .ok_or_else(|| ConfigError::MissingSetting("VFVS_CONFIG_JOB_BUCKET".to_string()))?,
            key: settings
                .job_object
                .clone()
                .ok_or_else(|| ConfigError::MissingSetting("VFVS_CONFIG_JOB_OBJECT".to_string()))?,
        }),
        StorageMode::SharedFs => settings
            .job_tarball
            .clone()
            .map(StorageLocator::SharedFs)
            .ok_or_else(|| ConfigError::MissingSetting("VFVS_CONFIG_JOB_TGZ".to_string())),
    }
}

/// Fetches and extracts the job tarball into `scratch_root`, then parses
/// the job config.
pub async fn fetch_job_input(
    storage: &Storage,
    locator: &StorageLocator,
    scratch_root: &Path,
) -> Result<JobInput, BootstrapError> {
    let tarball = scratch_root.join(JOB_TARBALL);
    let bytes = storage.fetch(locator, &tarball).await?;
    info!(source = %locator, bytes, "Job input downloaded");

    let dest = scratch_root.to_path_buf();
    let archive = tarball.clone();
    tokio::task::spawn_blocking(move || extract_job_tarball(&archive, &dest))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;

    let config_path = scratch_root.join(JOB_CONFIG_PATH);
    if !config_path.is_file() {
        return Err(BootstrapError::MissingJobConfig(PathBuf::from(JOB_CONFIG_PATH)));
    }
    let raw = tokio::fs::read_to_string(&config_path).await?;
    Ok(JobInput::from_json(&raw)?)
}

fn extract_job_tarball(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive).map_err(|source| ArchiveError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .map_err(|e| ArchiveError::MalformedEntry {
            path: archive.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Fails unless at least `required` bytes are available under `path`.
pub fn check_free_space(path: &Path, required: u64) -> Result<u64, BootstrapError> {
    let available = fs4::available_space(path)?;
    if available < required {
        return Err(BootstrapError::InsufficientSpace {
            path: path.to_path_buf(),
            available,
            required,
        });
    }
    Ok(available)
}

/// Picks the subjob to run out of the job input.
pub fn select_subjob(
    input: &JobInput,
    workunit_id: &str,
    subjob_id: &str,
) -> Result<SubjobSelection, BootstrapError> {
    match input.subjobs.get(subjob_id) {
        Some(subjob) => Ok(SubjobSelection::Run(subjob.clone())),
        None if subjob_id == PLACEHOLDER_SUBJOB => Ok(SubjobSelection::NothingToDo),
        None => Err(BootstrapError::SubjobNotFound {
            workunit: workunit_id.to_string(),
            subjob: subjob_id.to_string(),
        }),
    }
}

/// Runs one subjob end to end.
///
/// Returns `None` when the placeholder subjob has nothing to do.
///
/// # Errors
///
/// Fails on invalid settings or job config, when the job input cannot be
/// fetched, and on any fatal pipeline failure.
pub async fn run_workunit(
    settings: &RuntimeSettings,
    registry: Arc<BackendRegistry>,
) -> Result<Option<SubjobReport>, BootstrapError> {
    settings.validate()?;

    tokio::fs::create_dir_all(&settings.tmp_path).await?;
    let available = check_free_space(&settings.tmp_path, settings.min_free_space)?;
    debug!(path = %settings.tmp_path.display(), available, "Scratch space checked");
    let scratch = tempfile::Builder::new()
        .prefix("vfvs-")
        .tempdir_in(&settings.tmp_path)?;
    info!(
        workunit = %settings.workunit_id,
        subjob = %settings.subjob_id,
        scratch = %scratch.path().display(),
        "Starting subjob"
    );

    let storage = storage_for(settings)?;
    let locator = job_locator(settings)?;
    let input = fetch_job_input(&storage, &locator, scratch.path()).await?;

    let subjob = match select_subjob(&input, &settings.workunit_id, &settings.subjob_id)? {
        SubjobSelection::Run(subjob) => subjob,
        SubjobSelection::NothingToDo => {
            warn!(subjob = PLACEHOLDER_SUBJOB, "Placeholder subjob not in job input; nothing to do");
            return Ok(None);
        }
    };

    let ctx = JobContext::new(
        settings,
        input.config,
        scratch.path().to_path_buf(),
        registry,
        storage,
    )?;
    let tasks = subjob.tasks(&ctx.config.object_store_job_bucket)?;
    info!(collections = tasks.len(), "Subjob loaded");

    let runner = SubjobRunner::new(Arc::new(ctx), settings.worker_counts());
    let report = runner.run(tasks).await?;
    Ok(Some(report))
}
