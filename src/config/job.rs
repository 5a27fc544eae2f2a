//! Job-level configuration (`vf_input/config.json`, `config` section).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{de, ConfigError, StorageMode};
use crate::backend::BackendRegistry;

/// Backend names selected by method prefix rather than exact name.
const PREFIX_BACKENDS: &[&str] = &["smina", "gwovina"];

fn default_threads() -> u32 {
    1
}

fn default_attrs() -> Vec<String> {
    vec!["smi".to_string()]
}

fn default_summary_formats() -> Vec<String> {
    vec!["csv.gz".to_string()]
}

fn default_banned_elements() -> Vec<String> {
    vec!["B".to_string(), "Si".to_string(), "Sn".to_string()]
}

/// Output format for per-scenario summary tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryFormat {
    /// Gzip-compressed comma-delimited text.
    #[serde(rename = "csv.gz")]
    CsvGz,
    /// Columnar Parquet.
    #[serde(rename = "parquet")]
    Parquet,
}

impl FromStr for SummaryFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "csv.gz" | "csv" => Ok(SummaryFormat::CsvGz),
            "parquet" => Ok(SummaryFormat::Parquet),
            other => Err(ConfigError::InvalidValue {
                key: "summary_formats".to_string(),
                message: format!("unknown summary format '{}'", other),
            }),
        }
    }
}

/// The `config` section of the job input.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    #[serde(default)]
    pub job_storage_mode: StorageMode,
    #[serde(default)]
    pub object_store_job_prefix: String,
    #[serde(default)]
    pub object_store_job_bucket: String,
    #[serde(default)]
    pub sharedfs_output_files_path: Option<PathBuf>,

    /// File extension of ligands in the library (`pdbqt`, `mol2`, ...).
    pub ligand_library_format: String,

    #[serde(deserialize_with = "de::string_list")]
    pub docking_scenario_names: Vec<String>,
    #[serde(deserialize_with = "de::string_list")]
    pub docking_scenario_methods: Vec<String>,
    #[serde(deserialize_with = "de::number_list")]
    pub docking_scenario_replicas: Vec<u32>,
    #[serde(deserialize_with = "de::number_list")]
    pub docking_scenario_batchsizes: Vec<usize>,

    /// Per-invocation wall-clock limit in seconds.
    #[serde(deserialize_with = "de::number")]
    pub program_timeout: u64,
    #[serde(default = "default_threads", deserialize_with = "de::number")]
    pub threads_per_docking: u32,

    #[serde(default, deserialize_with = "de::flag")]
    pub run_atom_check: bool,
    #[serde(default = "default_banned_elements", deserialize_with = "de::string_list")]
    pub banned_elements: Vec<String>,

    #[serde(default, deserialize_with = "de::flag")]
    pub dynamic_tranche_filtering: bool,
    #[serde(default)]
    pub dynamic_tranche_filtering_regex: Option<String>,

    #[serde(default, deserialize_with = "de::flag")]
    pub prescreen_mode: bool,

    #[serde(default = "default_attrs", deserialize_with = "de::string_list")]
    pub print_attrs_in_summary: Vec<String>,
    #[serde(default = "default_summary_formats", deserialize_with = "de::key_set")]
    pub summary_formats: Vec<String>,
}

/// A resolved docking scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    pub key: String,
    /// Registered backend name.
    pub backend: String,
    /// Method name as written in the job config.
    pub program_long: String,
    pub config_path: PathBuf,
    pub replicas: u32,
    pub batch_size: usize,
}

impl JobConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "job_name must not be empty".to_string(),
            ));
        }

        let scenarios = self.docking_scenario_names.len();
        if scenarios == 0 {
            return Err(ConfigError::ValidationFailed(
                "at least one docking scenario is required".to_string(),
            ));
        }

        for (key, len) in [
            ("docking_scenario_methods", self.docking_scenario_methods.len()),
            ("docking_scenario_replicas", self.docking_scenario_replicas.len()),
            ("docking_scenario_batchsizes", self.docking_scenario_batchsizes.len()),
        ] {
            if len != scenarios {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} has {} entries, expected {}",
                    key, len, scenarios
                )));
            }
        }

        if self.docking_scenario_replicas.contains(&0) {
            return Err(ConfigError::ValidationFailed(
                "docking_scenario_replicas must be greater than 0".to_string(),
            ));
        }

        if self.docking_scenario_batchsizes.contains(&0) {
            return Err(ConfigError::ValidationFailed(
                "docking_scenario_batchsizes must be greater than 0".to_string(),
            ));
        }

        if self.program_timeout == 0 {
            return Err(ConfigError::ValidationFailed(
                "program_timeout must be greater than 0".to_string(),
            ));
        }

        if self.job_storage_mode == StorageMode::SharedFs
            && self.sharedfs_output_files_path.is_none()
        {
            return Err(ConfigError::ValidationFailed(
                "sharedfs_output_files_path is required for sharedfs storage".to_string(),
            ));
        }

        self.summary_formats()?;
        self.tranche_filter()?;
        self.banned_element_pattern()?;

        Ok(())
    }

    pub fn program_timeout(&self) -> Duration {
        Duration::from_secs(self.program_timeout)
    }

    pub fn summary_formats(&self) -> Result<Vec<SummaryFormat>, ConfigError> {
        self.summary_formats
            .iter()
            .map(|s| s.parse::<SummaryFormat>())
            .collect()
    }

    /// Compiled dynamic tranche filter, if enabled.
    pub fn tranche_filter(&self) -> Result<Option<Regex>, ConfigError> {
        if !self.dynamic_tranche_filtering {
            return Ok(None);
        }

        let pattern = self.dynamic_tranche_filtering_regex.as_deref().ok_or_else(|| {
            ConfigError::ValidationFailed(
                "dynamic_tranche_filtering_regex is required when dynamic_tranche_filtering is on"
                    .to_string(),
            )
        })?;

        Regex::new(pattern)
            .map(Some)
            .map_err(|source| ConfigError::InvalidRegex {
                key: "dynamic_tranche_filtering_regex".to_string(),
                source,
            })
    }

    /// Element-symbol pattern for the banned-element check, if enabled.
    pub fn banned_element_pattern(&self) -> Result<Option<Regex>, ConfigError> {
        if !self.run_atom_check || self.banned_elements.is_empty() {
            return Ok(None);
        }

        let alternatives: Vec<String> = self
            .banned_elements
            .iter()
            .map(|e| regex::escape(e.trim()))
            .collect();
        let pattern = format!(r"\s+({})\s+", alternatives.join("|"));

        Regex::new(&pattern)
            .map(Some)
            .map_err(|source| ConfigError::InvalidRegex {
                key: "banned_elements".to_string(),
                source,
            })
    }

    /// Zips the scenario lists into resolved scenarios.
    ///
    /// Every scenario's backend must be present in `registry`; this is the
    /// point where an unregistered backend is reported.
    pub fn resolve_scenarios(
        &self,
        input_files_dir: &Path,
        registry: &BackendRegistry,
    ) -> Result<Vec<ScenarioConfig>, ConfigError> {
        let mut scenarios = Vec::with_capacity(self.docking_scenario_names.len());

        for (index, key) in self.docking_scenario_names.iter().enumerate() {
            let program_long = self.docking_scenario_methods[index].clone();
            let backend = backend_for_method(&program_long);

            if !registry.contains(&backend) {
                return Err(ConfigError::UnregisteredBackend {
                    scenario: key.clone(),
                    backend,
                });
            }

            scenarios.push(ScenarioConfig {
                key: key.clone(),
                backend,
                program_long,
                config_path: input_files_dir.join(key).join("config.txt"),
                replicas: self.docking_scenario_replicas[index],
                batch_size: self.docking_scenario_batchsizes[index],
            });
        }

        Ok(scenarios)
    }
}

/// Maps a scenario method to the backend that runs it.
pub fn backend_for_method(method: &str) -> String {
    PREFIX_BACKENDS
        .iter()
        .find(|prefix| method.starts_with(*prefix))
        .map(|prefix| prefix.to_string())
        .unwrap_or_else(|| method.to_string())
}
