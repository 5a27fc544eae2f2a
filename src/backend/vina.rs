//! AutoDock Vina and its derivatives.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{
    config_value, read_config_file, DockingBackend, Invocation, InvocationContext, ProcessOutput,
};
use crate::error::BackendError;
use crate::pipeline::types::DockingTask;

/// Programs that share the Vina command line and result table.
pub const VINA_FAMILY: [&str; 6] = ["vina", "qvina02", "qvina_w", "vina_carb", "vina_xb", "gwovina"];

const SCORE_NOT_FOUND: &str = "Could not find score";

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s+1\s+(?P<value>[-0-9.]+)\s+").expect("Invalid regex for vina score")
    })
}

/// Score of the top-ranked pose in a Vina result table.
pub fn parse_vina_score(stdout: &str) -> Option<f64> {
    score_pattern()
        .captures(stdout)
        .and_then(|caps| caps.name("value"))
        .and_then(|m| m.as_str().parse().ok())
}

fn apply_vina_score(task: &mut DockingTask, output: &ProcessOutput) {
    match parse_vina_score(&output.stdout) {
        Some(score) => task.mark_success(score),
        None => {
            debug!(ligand = %task.ligand_key, scenario = %task.scenario_key, "No score in output");
            task.mark_failed(SCORE_NOT_FOUND);
        }
    }
}

/// A Vina-compatible program driven by the scenario's config file.
#[derive(Debug, Clone)]
pub struct VinaBackend {
    program: String,
}

impl VinaBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl DockingBackend for VinaBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn build_invocation(
        &self,
        task: &DockingTask,
        ctx: &InvocationContext<'_>,
    ) -> Result<Invocation, BackendError> {
        Ok(Invocation {
            program: ctx.tools_path.join(&self.program),
            args: vec![
                "--cpu".to_string(),
                task.threads.to_string(),
                "--config".to_string(),
                task.config_path.display().to_string(),
                "--ligand".to_string(),
                task.ligand_path.display().to_string(),
                "--out".to_string(),
                task.output_path().display().to_string(),
            ],
            timeout: task.timeout,
            inputs: Vec::new(),
        })
    }

    fn parse_result(&self, task: &mut DockingTask, output: &ProcessOutput) {
        apply_vina_score(task, output);
    }
}

/// PSOVina: reads receptor and search box from the scenario config.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsoVinaBackend;

impl DockingBackend for PsoVinaBackend {
    fn name(&self) -> &str {
        "psovina"
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
            "--receptor".to_string(),
            value("receptor")?,
            "--ligand".to_string(),
            task.ligand_path.display().to_string(),
            "--cpu".to_string(),
            task.threads.to_string(),
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
            program: ctx.tools_path.join("PSOVina"),
            args,
            timeout: task.timeout,
            inputs: Vec::new(),
        })
    }

    fn parse_result(&self, task: &mut DockingTask, output: &ProcessOutput) {
        apply_vina_score(task, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::fixtures::docking_task;
    use std::path::Path;

    const VINA_STDOUT: &str = "\
Performing search ... done.
mode |   affinity | dist from best mode
     | (kcal/mol) | rmsd l.b.| rmsd u.b.
-----+------------+----------+----------
   1        -8.4      0.000      0.000
   2        -7.9      1.912      2.480
";

    #[test]
    fn test_parse_top_pose() {
        assert_eq!(parse_vina_score(VINA_STDOUT), Some(-8.4));
        assert_eq!(parse_vina_score("no table here"), None);
    }

    #[test]
    fn test_vina_invocation() {
        let backend = VinaBackend::new("qvina02");
        let task = docking_task("qvina", "Z1", 0);
        let ctx = InvocationContext {
            tools_path: Path::new("/opt/vf/tools/bin"),
            run_dir: Path::new("/scratch/run/x"),
        };
        let invocation = backend.build_invocation(&task, &ctx).unwrap();
        assert_eq!(invocation.program, Path::new("/opt/vf/tools/bin/qvina02"));
        assert_eq!(invocation.args[0..2], ["--cpu".to_string(), "1".to_string()]);
        assert_eq!(invocation.args.last().unwrap(), "/tmp/AAAA_1/output/qvina/Z1/0/output");
        assert_eq!(invocation.timeout, task.timeout);
    }

    #[test]
    fn test_missing_score_marks_failed() {
        let backend = VinaBackend::new("vina");
        let mut task = docking_task("vina", "Z1", 0);
        backend.parse_result(
            &mut task,
            &ProcessOutput {
                exit_code: Some(0),
                stdout: "Refining results ... done.".to_string(),
                stderr: String::new(),
            },
        );
        assert!(!task.is_success());
        assert_eq!(task.reason.as_deref(), Some(SCORE_NOT_FOUND));

        backend.parse_result(
            &mut task,
            &ProcessOutput {
                exit_code: Some(0),
                stdout: VINA_STDOUT.to_string(),
                stderr: String::new(),
            },
        );
        assert_eq!(task.score, Some(-8.4));
    }

    #[test]
    fn test_psovina_requires_box() {
        let temp = tempfile::TempDir::new().unwrap();
        let config_path = temp.path().join("config.txt");
        std::fs::write(&config_path, "receptor = rec.pdbqt\nexhaustiveness = 8\n").unwrap();

        let mut task = docking_task("pso", "Z1", 0);
        task.config_path = config_path;
        let ctx = InvocationContext {
            tools_path: Path::new("/tools"),
            run_dir: temp.path(),
        };
        let err = PsoVinaBackend.build_invocation(&task, &ctx).unwrap_err();
        assert!(matches!(err, BackendError::MissingConfigKey { ref key, .. } if key == "center_x"));
    }
}
