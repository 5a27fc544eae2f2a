//! Execute stage: batches tasks per scenario and runs the backends.
//!
//! Each worker buffers tasks per scenario. A buffer is flushed when it
//! reaches the scenario's batch size, when a receive comes back idle, and
//! when the worker is stopped. Every flushed batch becomes exactly one
//! `docking_complete` event.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::JobContext;
use super::events::SummaryEvent;
use super::scratch::{copy_dir_recursive, remove_dir_logged};
use super::types::{DockingTask, ExecutionBatch};
use crate::backend::{DockingBackend, ExecutionModel, Invocation, InvocationContext, ProcessOutput};
use crate::error::StageError;
use crate::scheduler::{QueueReceiver, QueueSender, Received};

/// Outcome of running one invocation.
#[derive(Debug)]
pub enum RunOutcome {
    Finished(ProcessOutput),
    TimedOut,
    SpawnFailed(String),
}

/// Runs one executor worker until it receives a stop sentinel.
pub async fn run_executor(
    ctx: Arc<JobContext>,
    rx: QueueReceiver<DockingTask>,
    summary: QueueSender<SummaryEvent>,
) -> Result<(), StageError> {
    let mut pending: BTreeMap<String, Vec<DockingTask>> = BTreeMap::new();

    loop {
        match rx.recv().await {
            Received::Item(task) => {
                let batch_size = ctx
                    .scenario(&task.scenario_key)
                    .map(|s| s.batch_size)
                    .unwrap_or(1);
                let scenario_key = task.scenario_key.clone();
                let buffer = pending.entry(scenario_key.clone()).or_default();
                buffer.push(task);

                if buffer.len() >= batch_size {
                    let tasks = std::mem::take(buffer);
                    run_batch(&ctx, &scenario_key, tasks, &summary).await?;
                }
            }
            Received::Idle => flush_all(&ctx, &mut pending, &summary).await?,
            Received::Stop => {
                flush_all(&ctx, &mut pending, &summary).await?;
                return Ok(());
            }
            Received::Closed => return Err(StageError::QueueClosed(rx.name())),
        }
    }
}

async fn flush_all(
    ctx: &JobContext,
    pending: &mut BTreeMap<String, Vec<DockingTask>>,
    summary: &QueueSender<SummaryEvent>,
) -> Result<(), StageError> {
    for (scenario_key, buffer) in pending.iter_mut() {
        if buffer.is_empty() {
            continue;
        }
        let tasks = std::mem::take(buffer);
        run_batch(ctx, scenario_key, tasks, summary).await?;
    }
    Ok(())
}

async fn run_batch(
    ctx: &JobContext,
    scenario_key: &str,
    tasks: Vec<DockingTask>,
    summary: &QueueSender<SummaryEvent>,
) -> Result<(), StageError> {
    let Some(first) = tasks.first() else {
        return Ok(());
    };
    let backend = ctx.registry.get(&first.backend)?;

    let mut batch = ExecutionBatch::new(scenario_key, first.backend.clone(), backend.execution_model());
    batch.tasks = tasks;

    match batch.model {
        ExecutionModel::Single => {
            for task in &mut batch.tasks {
                execute_single(ctx, backend.as_ref(), task).await;
            }
        }
        ExecutionModel::Batch => execute_batch(ctx, backend.as_ref(), &mut batch).await,
    }

    summary.send(SummaryEvent::DockingComplete(batch)).await?;
    Ok(())
}

/// Creates `<scratch>/run/<uuid>` with a copy of the shared input files.
async fn prepare_run_dir(ctx: &JobContext, id: Uuid) -> std::io::Result<PathBuf> {
    let run_dir = ctx.scratch_root.join("run").join(id.to_string());
    let input_dir = run_dir.join("input-files");
    tokio::fs::create_dir_all(&input_dir).await?;

    if ctx.input_files_dir.is_dir() {
        let src = ctx.input_files_dir.clone();
        let dst = input_dir.clone();
        tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &dst))
            .await
            .map_err(std::io::Error::other)??;
    }

    Ok(run_dir)
}

async fn execute_single(ctx: &JobContext, backend: &dyn DockingBackend, task: &mut DockingTask) {
    let start = Instant::now();
    task.reset_outcome();

    let run_dir = match prepare_run_dir(ctx, Uuid::new_v4()).await {
        Ok(dir) => dir,
        Err(e) => {
            error!(ligand = %task.ligand_key, error = %e, "Cannot prepare run directory");
            task.mark_failed(format!("run directory setup failed: {}", e));
            task.seconds = start.elapsed().as_secs_f64();
            return;
        }
    };

    let invocation_ctx = InvocationContext {
        tools_path: &ctx.tools_path,
        run_dir: &run_dir,
    };

    debug!(ligand = %task.ligand_key, scenario = %task.scenario_key, replica = task.replica, "Docking");

    match backend.build_invocation(task, &invocation_ctx) {
        Ok(invocation) => match run_invocation(&invocation, &run_dir.join("input-files")).await {
            RunOutcome::Finished(output) => {
                if output.exit_code == Some(0) {
                    backend.parse_result(task, &output);
                } else {
                    let reason = format!(
                        "Non zero return code for {} {} {}",
                        task.collection_key, task.ligand_key, task.scenario_key
                    );
                    error!(reason = %reason, stdout = %output.stdout, stderr = %output.stderr, "Docking failed");
                    task.mark_failed(reason);
                }
                write_log(&task.log_path(), &output).await;
            }
            RunOutcome::TimedOut => {
                let reason = format!("timeout on {}", task.ligand_key);
                error!(scenario = %task.scenario_key, "{}", reason);
                task.mark_failed(reason);
            }
            RunOutcome::SpawnFailed(e) => {
                error!(program = %invocation.program.display(), error = %e, "Cannot start backend");
                task.mark_failed(format!("failed to start {}: {}", invocation.program.display(), e));
            }
        },
        Err(e) => {
            error!(ligand = %task.ligand_key, backend = %task.backend, error = %e, "Invalid invocation");
            task.mark_failed(e.to_string());
        }
    }

    remove_dir_logged(&run_dir).await;
    task.seconds = start.elapsed().as_secs_f64();

    info!(
        ligand = %task.ligand_key,
        scenario = %task.scenario_key,
        success = task.is_success(),
        seconds = task.seconds,
        "Docking finished"
    );
}

async fn execute_batch(
    ctx: &JobContext,
    backend: &dyn DockingBackend,
    batch: &mut ExecutionBatch,
) {
    let start = Instant::now();
    let id = Uuid::new_v4();
    for task in &mut batch.tasks {
        task.reset_outcome();
    }

    batch.uuid = Some(id);
    let log_dir = ctx.scratch_root.join("logs").join(id.to_string());
    if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
        error!(batch = %id, error = %e, "Cannot create batch log directory");
        batch.fail_all(&format!("batch log directory setup failed: {}", e));
        set_seconds(batch, start);
        return;
    }
    batch.log_dir = Some(log_dir.clone());

    for task in &batch.tasks {
        let marker = task.output_dir.join("dock_uuid");
        if let Err(e) = tokio::fs::write(&marker, format!("{}\n", id)).await {
            error!(batch = %id, ligand = %task.ligand_key, error = %e, "Cannot write batch marker");
            batch.fail_all(&format!("cannot write {}: {}", marker.display(), e));
            set_seconds(batch, start);
            return;
        }
    }

    let run_dir = match prepare_run_dir(ctx, id).await {
        Ok(dir) => dir,
        Err(e) => {
            error!(batch = %id, error = %e, "Cannot prepare run directory");
            batch.fail_all(&format!("run directory setup failed: {}", e));
            set_seconds(batch, start);
            return;
        }
    };

    let invocation_ctx = InvocationContext {
        tools_path: &ctx.tools_path,
        run_dir: &run_dir,
    };

    info!(batch = %id, scenario = %batch.scenario_key, tasks = batch.len(), "Running batch");

    match backend.build_batch_invocation(batch, &invocation_ctx) {
        Ok(invocation) => match run_invocation(&invocation, &run_dir.join("input-files")).await {
            RunOutcome::Finished(output) => {
                if output.exit_code == Some(0) {
                    backend.parse_batch_result(batch, &invocation_ctx, &output);
                } else {
                    error!(batch = %id, stdout = %output.stdout, stderr = %output.stderr, "Batched execution failed");
                    batch.fail_all("Non zero return code for batched execution");
                }
                write_log(&log_dir.join("stdout"), &output).await;
            }
            RunOutcome::TimedOut => {
                error!(batch = %id, "Batched execution timed out");
                batch.fail_all("Batched execution timed out");
            }
            RunOutcome::SpawnFailed(e) => {
                error!(batch = %id, error = %e, "Cannot start batch backend");
                batch.fail_all(&format!("failed to start {}: {}", invocation.program.display(), e));
            }
        },
        Err(e) => {
            error!(batch = %id, error = %e, "Invalid batch invocation");
            batch.fail_all(&e.to_string());
        }
    }

    remove_dir_logged(&run_dir).await;
    set_seconds(batch, start);
}

fn set_seconds(batch: &mut ExecutionBatch, start: Instant) {
    let seconds = start.elapsed().as_secs_f64();
    for task in &mut batch.tasks {
        task.seconds = seconds;
    }
}

/// Writes the invocation's staged inputs, then runs it in `cwd`, killing it
/// when the timeout expires.
pub async fn run_invocation(invocation: &Invocation, cwd: &Path) -> RunOutcome {
    for (path, content) in &invocation.inputs {
        if let Err(e) = tokio::fs::write(path, content).await {
            return RunOutcome::SpawnFailed(format!("cannot write {}: {}", path.display(), e));
        }
    }

    let mut command = tokio::process::Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(invocation.timeout, command.output()).await {
        Ok(Ok(output)) => RunOutcome::Finished(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }),
        Ok(Err(e)) => RunOutcome::SpawnFailed(e.to_string()),
        Err(_) => RunOutcome::TimedOut,
    }
}

async fn write_log(path: &Path, output: &ProcessOutput) {
    let content = format!("STDOUT:\n{}\nSTDERR:\n{}\n", output.stdout, output.stderr);
    if let Err(e) = tokio::fs::write(path, content).await {
        warn!(path = %path.display(), error = %e, "Cannot write docking log");
    }
}

#[cfg(all(test, unix))]
pub(crate) mod fixtures {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Installs an executable shell script at `dir/name`.
    pub fn install_script(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    /// A fake Vina that reports `score` for every ligand.
    pub fn install_fake_vina(dir: &Path, name: &str, score: &str) {
        install_script(
            dir,
            name,
            &format!(
                "echo 'mode |   affinity | dist from best mode'\n\
                 echo '-----+------------+----------+----------'\n\
                 echo '   1       {}      0.000      0.000'",
                score
            ),
        );
    }
}
