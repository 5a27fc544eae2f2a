//! Work items that flow between pipeline stages.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ExecutionModel;
use crate::storage::StorageLocator;

/// Which ligands of a collection are docked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    /// Every ligand in the archive.
    Full,
    /// Only the listed ligand keys.
    Named(Vec<String>),
    /// Ligands ranked below `cutoff` in the `.listing` sidecar.
    Prescreen { cutoff: u64 },
}

/// One collection archive to fetch.
#[derive(Debug, Clone)]
pub struct CollectionTask {
    pub collection_key: String,
    pub locator: StorageLocator,
    pub selection: SelectionMode,
    /// Dockings lost if the download fails.
    pub expected_dockings: u64,
}

impl CollectionTask {
    /// Tranche name: the key prefix before the first `_`.
    pub fn tranche(&self) -> &str {
        self.collection_key
            .split_once('_')
            .map(|(tranche, _)| tranche)
            .unwrap_or(&self.collection_key)
    }
}

/// A fetched archive waiting to be unpacked.
#[derive(Debug, Clone)]
pub struct DownloadedCollection {
    pub task: CollectionTask,
    pub scratch_dir: PathBuf,
    pub archive_path: PathBuf,
}

/// One ligand extracted from a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LigandRecord {
    pub ligand_key: String,
    pub path: PathBuf,
    /// Reporting identity; rewritten in prescreen mode.
    pub collection_key: String,
    /// Archive the ligand came from; drives completion accounting.
    pub base_collection_key: String,
}

/// The selected ligands of one collection.
#[derive(Debug, Clone)]
pub struct UnpackedCollection {
    pub base_collection_key: String,
    pub scratch_dir: PathBuf,
    pub ligands: BTreeMap<String, LigandRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockingStatus {
    Success,
    Failed,
}

/// One (ligand, scenario, replica) unit of work and its outcome.
#[derive(Debug, Clone)]
pub struct DockingTask {
    pub scenario_key: String,
    pub backend: String,
    pub program_long: String,
    pub config_path: PathBuf,
    pub replica: u32,

    pub ligand_key: String,
    pub ligand_path: PathBuf,
    pub collection_key: String,
    pub base_collection_key: String,

    /// `<collection scratch>/output/<scenario>/<ligand>/<replica>`.
    pub output_dir: PathBuf,
    pub timeout: Duration,
    pub threads: u32,
    /// Requested attributes in request order.
    pub attrs: Vec<(String, String)>,

    pub status: DockingStatus,
    pub score: Option<f64>,
    pub reason: Option<String>,
    pub seconds: f64,
}

impl DockingTask {
    /// Docked pose output written by the backend.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join("output")
    }

    /// Captured stdout/stderr of a single-model run.
    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join("stdout")
    }

    pub fn mark_success(&mut self, score: f64) {
        self.status = DockingStatus::Success;
        self.score = Some(score);
        self.reason = None;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = DockingStatus::Failed;
        self.score = None;
        self.reason = Some(reason.into());
    }

    /// Resets the outcome before execution.
    pub fn reset_outcome(&mut self) {
        self.status = DockingStatus::Failed;
        self.score = None;
        self.reason = None;
        self.seconds = 0.0;
    }

    pub fn is_success(&self) -> bool {
        self.status == DockingStatus::Success
    }
}

/// Same-scenario tasks executed together.
#[derive(Debug, Clone)]
pub struct ExecutionBatch {
    pub scenario_key: String,
    pub backend: String,
    pub model: ExecutionModel,
    /// Batch identity; set for batch-model runs.
    pub uuid: Option<Uuid>,
    /// `<scratch>/logs/<uuid>`; set for batch-model runs.
    pub log_dir: Option<PathBuf>,
    pub tasks: Vec<DockingTask>,
}

impl ExecutionBatch {
    pub fn new(scenario_key: impl Into<String>, backend: impl Into<String>, model: ExecutionModel) -> Self {
        Self {
            scenario_key: scenario_key.into(),
            backend: backend.into(),
            model,
            uuid: None,
            log_dir: None,
            tasks: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Marks every task failed with the same reason.
    pub fn fail_all(&mut self, reason: &str) {
        for task in &mut self.tasks {
            task.mark_failed(reason);
        }
    }
}

/// A finished artifact to ship.
#[derive(Debug, Clone)]
pub struct ArtifactUploadRequest {
    pub local_path: PathBuf,
    pub destination: StorageLocator,
    /// Removed after a successful transfer.
    pub scratch_dir: PathBuf,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A pending task for `ligand_key` in collection `AAAA_1`.
    pub fn docking_task(scenario: &str, ligand_key: &str, replica: u32) -> DockingTask {
        DockingTask {
            scenario_key: scenario.to_string(),
            backend: "qvina02".to_string(),
            program_long: "qvina02".to_string(),
            config_path: PathBuf::from("/in/qvina/config.txt"),
            replica,
            ligand_key: ligand_key.to_string(),
            ligand_path: PathBuf::from(format!("/tmp/AAAA_1/1/{}.pdbqt", ligand_key)),
            collection_key: "AAAA_1".to_string(),
            base_collection_key: "AAAA_1".to_string(),
            output_dir: PathBuf::from(format!("/tmp/AAAA_1/output/{}/{}/{}", scenario, ligand_key, replica)),
            timeout: Duration::from_secs(30),
            threads: 1,
            attrs: vec![("smi".to_string(), "CCO".to_string())],
            status: DockingStatus::Failed,
            score: None,
            reason: None,
            seconds: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::docking_task;
    use super::*;

    #[test]
    fn test_tranche_from_key() {
        let task = CollectionTask {
            collection_key: "AACDEF_00123".to_string(),
            locator: StorageLocator::SharedFs(PathBuf::from("/lib/x.tar.gz")),
            selection: SelectionMode::Full,
            expected_dockings: 0,
        };
        assert_eq!(task.tranche(), "AACDEF");
    }

    #[test]
    fn test_task_outcome_transitions() {
        let mut task = docking_task("qvina", "Z1", 0);
        task.mark_success(-7.25);
        assert!(task.is_success());
        assert_eq!(task.score, Some(-7.25));

        task.mark_failed("Could not find score");
        assert!(!task.is_success());
        assert_eq!(task.score, None);
        assert_eq!(task.output_path(), PathBuf::from("/tmp/AAAA_1/output/qvina/Z1/0/output"));
    }

    #[test]
    fn test_batch_fail_all() {
        let mut batch = ExecutionBatch::new("qvina", "batch_script", ExecutionModel::Batch);
        batch.tasks.push(docking_task("qvina", "Z1", 0));
        batch.tasks.push(docking_task("qvina", "Z1", 1));
        batch.tasks[0].mark_success(-5.0);
        batch.fail_all("Batched execution timed out");
        assert!(batch.tasks.iter().all(|t| !t.is_success()));
        assert_eq!(batch.len(), 2);
    }
}
