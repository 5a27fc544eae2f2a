//! Docking backends.
//!
//! A backend turns a docking task into a program invocation and turns the
//! captured output back into a score. Backends are looked up by name in a
//! [`BackendRegistry`]; every scenario's backend is checked against the
//! registry when the job config is loaded.
//!
//! # Execution models
//!
//! - **Single**: one invocation per task
//! - **Batch**: one invocation for a whole [`ExecutionBatch`]

pub mod batch;
pub mod smina;
pub mod vina;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::BackendError;
use crate::pipeline::types::{DockingTask, ExecutionBatch};

pub use batch::BatchScriptBackend;
pub use smina::{GninaBackend, SminaBackend};
pub use vina::{PsoVinaBackend, VinaBackend, VINA_FAMILY};

/// How a backend consumes tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionModel {
    Single,
    Batch,
}

impl fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionModel::Single => write!(f, "single"),
            ExecutionModel::Batch => write!(f, "batch"),
        }
    }
}

/// A program to run, with its wall-clock limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Files written (path, content) before the program starts.
    pub inputs: Vec<(PathBuf, String)>,
}

/// Where an invocation runs.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub tools_path: &'a Path,
    /// Private run directory; the working directory is `<run_dir>/input-files`.
    pub run_dir: &'a Path,
}

/// Captured result of a finished invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Command construction and output parsing for one docking program.
///
/// Methods run on the executor's async worker. They may read the scenario
/// config and small result files; anything they need written goes into
/// [`Invocation::inputs`], which the executor writes before spawning.
pub trait DockingBackend: Send + Sync {
    fn name(&self) -> &str;

    fn execution_model(&self) -> ExecutionModel {
        ExecutionModel::Single
    }

    /// Builds the invocation for a single task.
    fn build_invocation(
        &self,
        task: &DockingTask,
        ctx: &InvocationContext<'_>,
    ) -> Result<Invocation, BackendError>;

    /// Scores a task from its output, or marks it failed with a reason.
    ///
    /// Only called for invocations that exited successfully.
    fn parse_result(&self, task: &mut DockingTask, output: &ProcessOutput);

    fn build_batch_invocation(
        &self,
        _batch: &ExecutionBatch,
        _ctx: &InvocationContext<'_>,
    ) -> Result<Invocation, BackendError> {
        Err(BackendError::BatchUnsupported {
            backend: self.name().to_string(),
        })
    }

    fn parse_batch_result(
        &self,
        batch: &mut ExecutionBatch,
        _ctx: &InvocationContext<'_>,
        _output: &ProcessOutput,
    ) {
        batch.fail_all("backend does not support batch execution");
    }
}

/// Name-keyed registry of docking backends.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn DockingBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for program in VINA_FAMILY {
            registry.register(Arc::new(VinaBackend::new(program)));
        }
        registry.register(Arc::new(SminaBackend));
        registry.register(Arc::new(GninaBackend));
        registry.register(Arc::new(PsoVinaBackend));
        registry.register(Arc::new(BatchScriptBackend));
        registry
    }

    /// Registers a backend, replacing any backend with the same name.
    pub fn register(&mut self, backend: Arc<dyn DockingBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DockingBackend>, BackendError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::Unregistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names with their execution models, sorted by name.
    pub fn list(&self) -> Vec<(String, ExecutionModel)> {
        let mut entries: Vec<_> = self
            .backends
            .iter()
            .map(|(name, backend)| (name.clone(), backend.execution_model()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();
        f.debug_struct("BackendRegistry").field("backends", &names).finish()
    }
}

/// Parses a scenario config file of `key = value` lines.
///
/// Text after `#` is a comment. Lines without `=` are ignored.
pub fn read_config_file(path: &Path) -> Result<HashMap<String, String>, BackendError> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_config(&content))
}

pub fn parse_config(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or_default().trim();
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Looks up `key` in a parsed scenario config.
pub(crate) fn config_value<'a>(
    config: &'a HashMap<String, String>,
    key: &str,
    backend: &str,
    path: &Path,
) -> Result<&'a str, BackendError> {
    config
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| BackendError::MissingConfigKey {
            backend: backend.to_string(),
            path: path.to_path_buf(),
            key: key.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_registered() {
        let registry = BackendRegistry::with_defaults();
        for name in ["vina", "qvina02", "qvina_w", "smina", "gnina", "gwovina", "psovina", "batch_script"] {
            assert!(registry.contains(name), "missing {}", name);
        }
        assert_eq!(
            registry.get("batch_script").unwrap().execution_model(),
            ExecutionModel::Batch
        );
    }

    #[test]
    fn test_unregistered_lookup() {
        let registry = BackendRegistry::new();
        let err = registry.get("qvina02").err().unwrap();
        assert!(matches!(err, BackendError::Unregistered(ref name) if name == "qvina02"));
    }

    #[test]
    fn test_list_sorted() {
        let names: Vec<String> = BackendRegistry::with_defaults()
            .list()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_parse_config_comments() {
        let config = parse_config(
            "receptor = ../receptor/protein.pdbqt # rigid\n\
             # full line comment\n\
             center_x=10.5\n\
             exhaustiveness = 8\n\
             garbage line\n",
        );
        assert_eq!(config["receptor"], "../receptor/protein.pdbqt");
        assert_eq!(config["center_x"], "10.5");
        assert_eq!(config["exhaustiveness"], "8");
        assert_eq!(config.len(), 3);
    }
}
