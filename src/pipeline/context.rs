//! Read-only job state shared by every stage worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::backend::BackendRegistry;
use crate::config::{ConfigError, JobConfig, RuntimeSettings, ScenarioConfig, SummaryFormat};
use crate::storage::{OutputLayout, Storage};

/// Everything a worker needs to know about the running subjob.
#[derive(Debug)]
pub struct JobContext {
    pub workunit_id: String,
    pub subjob_id: String,
    /// Scratch root of this run; collections get subdirectories here.
    pub scratch_root: PathBuf,
    pub tools_path: PathBuf,
    /// `<scratch>/vf_input/input-files`, copied into every run directory.
    pub input_files_dir: PathBuf,
    pub vcpus: usize,
    pub poll_interval: Duration,
    pub started_at: DateTime<Utc>,

    pub config: JobConfig,
    pub scenarios: Vec<ScenarioConfig>,
    pub summary_formats: Vec<SummaryFormat>,
    pub tranche_filter: Option<Regex>,
    pub banned_elements: Option<Regex>,

    pub registry: Arc<BackendRegistry>,
    pub storage: Storage,
    pub layout: OutputLayout,
}

impl JobContext {
    /// Validates the job config and resolves its scenarios against `registry`.
    ///
    /// # Errors
    ///
    /// Fails on invalid config values or when a scenario names a backend
    /// that is not registered.
    pub fn new(
        settings: &RuntimeSettings,
        config: JobConfig,
        scratch_root: PathBuf,
        registry: Arc<BackendRegistry>,
        storage: Storage,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let input_files_dir = scratch_root.join("vf_input").join("input-files");
        let scenarios = config.resolve_scenarios(&input_files_dir, &registry)?;
        let summary_formats = config.summary_formats()?;
        let tranche_filter = config.tranche_filter()?;
        let banned_elements = config.banned_element_pattern()?;
        let layout = OutputLayout::new(&config, &settings.workunit_id, &settings.subjob_id);

        Ok(Self {
            workunit_id: settings.workunit_id.clone(),
            subjob_id: settings.subjob_id.clone(),
            scratch_root,
            tools_path: settings.tools_path.clone(),
            input_files_dir,
            vcpus: settings.vcpus,
            poll_interval: settings.poll_interval,
            started_at: Utc::now(),
            config,
            scenarios,
            summary_formats,
            tranche_filter,
            banned_elements,
            registry,
            storage,
            layout,
        })
    }

    pub fn scenario(&self, key: &str) -> Option<&ScenarioConfig> {
        self.scenarios.iter().find(|s| s.key == key)
    }

    /// Dockings dispatched for each ligand that passes validation.
    pub fn completions_per_ligand(&self) -> u64 {
        self.scenarios.iter().map(|s| u64::from(s.replicas)).sum()
    }

    /// Directory where a scenario's finished outputs are collected.
    pub fn scenario_output_dir(&self, scenario_key: &str) -> PathBuf {
        self.scratch_root
            .join("output")
            .join(scenario_key)
            .join(&self.subjob_id)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::path::Path;

    /// A shared-fs job with one `qvina02` scenario.
    pub fn job_config(replicas: u32, batch_size: usize, output_root: &Path) -> JobConfig {
        serde_json::from_value(serde_json::json!({
            "job_name": "screen-01",
            "job_storage_mode": "sharedfs",
            "sharedfs_output_files_path": output_root,
            "ligand_library_format": "pdbqt",
            "docking_scenario_names": ["qvina_rigid"],
            "docking_scenario_methods": ["qvina02"],
            "docking_scenario_replicas": [replicas.to_string()],
            "docking_scenario_batchsizes": [batch_size.to_string()],
            "program_timeout": "30",
            "print_attrs_in_summary": ["smi", "heavy_atom_count"],
        }))
        .unwrap()
    }

    pub fn context(config: JobConfig, scratch_root: &Path, tools_path: &Path) -> JobContext {
        let mut settings = RuntimeSettings::new("wu-1", "7");
        settings.tools_path = tools_path.to_path_buf();
        settings.poll_interval = Duration::from_millis(50);
        JobContext::new(
            &settings,
            config,
            scratch_root.to_path_buf(),
            Arc::new(BackendRegistry::with_defaults()),
            Storage::shared_fs_only(),
        )
        .unwrap()
    }
}
