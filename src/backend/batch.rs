//! Batch-model backend driven by a user-supplied script.
//!
//! The scenario config names the script (`script = dock_many.sh`, relative
//! paths resolve against the tools directory). One invocation handles a
//! whole batch:
//!
//! ```text
//! <script> --manifest <run>/manifest.tsv --config <cfg> --scores <run>/scores.tsv --cpu <n>
//! ```
//!
//! `manifest.tsv` has one `index<TAB>ligand_key<TAB>ligand_path<TAB>output_path`
//! row per task; the script writes `index<TAB>score` rows to `scores.tsv`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{
    config_value, read_config_file, DockingBackend, ExecutionModel, Invocation,
    InvocationContext, ProcessOutput,
};
use crate::error::BackendError;
use crate::pipeline::types::{DockingTask, ExecutionBatch};

const MANIFEST_FILE: &str = "manifest.tsv";
const SCORES_FILE: &str = "scores.tsv";

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchScriptBackend;

impl BatchScriptBackend {
    fn script_path(&self, config_path: &Path, tools_path: &Path) -> Result<PathBuf, BackendError> {
        let config = read_config_file(config_path)?;
        let script = PathBuf::from(config_value(&config, "script", self.name(), config_path)?);
        Ok(if script.is_absolute() {
            script
        } else {
            tools_path.join(script)
        })
    }
}

fn parse_scores(content: &str) -> HashMap<usize, f64> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let index = fields.next()?.trim().parse().ok()?;
            let score = fields.next()?.trim().parse().ok()?;
            Some((index, score))
        })
        .collect()
}

impl DockingBackend for BatchScriptBackend {
    fn name(&self) -> &str {
        "batch_script"
    }

    fn execution_model(&self) -> ExecutionModel {
        ExecutionModel::Batch
    }

    fn build_invocation(
        &self,
        _task: &DockingTask,
        _ctx: &InvocationContext<'_>,
    ) -> Result<Invocation, BackendError> {
        Err(BackendError::Setup {
            backend: self.name().to_string(),
            reason: "runs in batch mode only".to_string(),
        })
    }

    fn parse_result(&self, task: &mut DockingTask, _output: &ProcessOutput) {
        task.mark_failed("batch_script runs in batch mode only");
    }

    fn build_batch_invocation(
        &self,
        batch: &ExecutionBatch,
        ctx: &InvocationContext<'_>,
    ) -> Result<Invocation, BackendError> {
        let first = batch.tasks.first().ok_or_else(|| BackendError::Setup {
            backend: self.name().to_string(),
            reason: "empty batch".to_string(),
        })?;
        let script = self.script_path(&first.config_path, ctx.tools_path)?;

        let mut manifest = String::new();
        for (index, task) in batch.tasks.iter().enumerate() {
            let _ = writeln!(
                manifest,
                "{}\t{}\t{}\t{}",
                index,
                task.ligand_key,
                task.ligand_path.display(),
                task.output_path().display()
            );
        }
        let manifest_path = ctx.run_dir.join(MANIFEST_FILE);

        Ok(Invocation {
            program: script,
            args: vec![
                "--manifest".to_string(),
                manifest_path.display().to_string(),
                "--config".to_string(),
                first.config_path.display().to_string(),
                "--scores".to_string(),
                ctx.run_dir.join(SCORES_FILE).display().to_string(),
                "--cpu".to_string(),
                first.threads.to_string(),
            ],
            timeout: first.timeout,
            inputs: vec![(manifest_path, manifest)],
        })
    }

    fn parse_batch_result(
        &self,
        batch: &mut ExecutionBatch,
        ctx: &InvocationContext<'_>,
        _output: &ProcessOutput,
    ) {
        let path = ctx.run_dir.join(SCORES_FILE);
        let scores = match std::fs::read_to_string(&path) {
            Ok(content) => parse_scores(&content),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Batch score table missing");
                batch.fail_all("Could not find score table");
                return;
            }
        };

        for (index, task) in batch.tasks.iter_mut().enumerate() {
            match scores.get(&index) {
                Some(score) => task.mark_success(*score),
                None => task.mark_failed("Could not find score"),
            }
        }
    }
}
