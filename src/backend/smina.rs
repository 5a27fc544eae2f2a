//! smina and gnina.

use std::sync::OnceLock;

use regex::Regex;

use super::{
    config_value, read_config_file, DockingBackend, Invocation, InvocationContext, ProcessOutput,
};
use crate::error::BackendError;
use crate::pipeline::types::DockingTask;

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^1\s{4}\s*(?P<value>[-0-9.]+)\s*").expect("Invalid regex for smina score")
    })
}

/// Score of the top pose, taken from the last result table in the output.
pub fn parse_smina_score(stdout: &str) -> Option<f64> {
    stdout.lines().rev().find_map(|line| {
        score_pattern()
            .captures(line)
            .and_then(|caps| caps.name("value"))
            .and_then(|m| m.as_str().parse().ok())
    })
}

fn apply_smina_score(task: &mut DockingTask, output: &ProcessOutput) {
    match parse_smina_score(&output.stdout) {
        Some(score) => task.mark_success(score),
        None => task.mark_failed("Could not find score"),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SminaBackend;

impl DockingBackend for SminaBackend {
    fn name(&self) -> &str {
        "smina"
    }

    fn build_invocation(
        &self,
        task: &DockingTask,
        ctx: &InvocationContext<'_>,
    ) -> Result<Invocation, BackendError> {
        Ok(Invocation {
            program: ctx.tools_path.join("smina"),
            args: vec![
                "--cpu".to_string(),
                task.threads.to_string(),
                "--config".to_string(),
                task.config_path.display().to_string(),
                "--ligand".to_string(),
                task.ligand_path.display().to_string(),
                "--out".to_string(),
                task.output_path().display().to_string(),
                "--log".to_string(),
                task.output_dir.join("out.flexres.pdb").display().to_string(),
                "--atom_terms".to_string(),
                task.output_dir.join("out.atomterms").display().to_string(),
            ],
            timeout: task.timeout,
            inputs: Vec::new(),
        })
    }

    fn parse_result(&self, task: &mut DockingTask, output: &ProcessOutput) {
        apply_smina_score(task, output);
    }
}

/// gnina takes receptor and search box on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct GninaBackend;

impl DockingBackend for GninaBackend {
    fn name(&self) -> &str {
        "gnina"
    }

    fn build_invocation(
        &self,
        task: &DockingTask,
        ctx: &InvocationContext<'_>,
    ) -> Result<Invocation, BackendError> {
        let config = read_config_file(&task.config_path)?;
        let value = |key: &str| {
            config_value(&config, key, self.name(), &task.config_path).map(str::to_string)
        };

        let mut args = vec![
            "-r".to_string(),
            value("receptor")?,
            "-l".to_string(),
            task.ligand_path.display().to_string(),
            "--exhaustiveness".to_string(),
            value("exhaustiveness")?,
        ];
        for key in ["center_x", "center_y", "center_z", "size_x", "size_y", "size_z"] {
            args.push(format!("--{}", key));
            args.push(value(key)?);
        }
        args.push("--out".to_string());
        args.push(task.output_path().display().to_string());

        Ok(Invocation {
            program: ctx.tools_path.join("gnina"),
            args,
            timeout: task.timeout,
            inputs: Vec::new(),
        })
    }

    fn parse_result(&self, task: &mut DockingTask, output: &ProcessOutput) {
        apply_smina_score(task, output);
    }
}
