//! CLI command definitions for dockforge.
//!
//! `run` executes one workunit subjob; every flag falls back to the
//! `VFVS_*` environment variable the batch scheduler exports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::backend::BackendRegistry;
use crate::config::{RuntimeSettings, StorageMode, DEFAULT_TOOLS_PATH};
use crate::pipeline::run_workunit;

/// Subjob runner for large-scale virtual screening.
#[derive(Parser)]
#[command(name = "dockforge")]
#[command(about = "Fetch ligand collections, dock them, and ship the reports")]
#[command(version)]
#[command(
    long_about = "dockforge runs one subjob of a virtual screening workunit.\n\nCollections are downloaded, unpacked, validated and docked against every configured scenario; summaries and output archives are uploaded at the end.\n\nExample usage:\n  VFVS_WORKUNIT=17 VFVS_WORKUNIT_SUBJOB=3 VFVS_CONFIG_JOB_TGZ=/shared/job.tar.gz dockforge run --vcpus 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true, env = "VFVS_LOGLEVEL")]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one workunit subjob.
    Run(RunArgs),

    /// List the registered docking backends.
    Backends(BackendsArgs),
}

/// Arguments for `dockforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Workunit id.
    #[arg(long, env = "VFVS_WORKUNIT")]
    pub workunit: String,

    /// Subjob id within the workunit.
    #[arg(long, env = "VFVS_WORKUNIT_SUBJOB")]
    pub subjob: String,

    /// Where the job input lives: `s3` or `sharedfs`.
    #[arg(long, env = "VFVS_JOB_STORAGE_MODE", default_value = "sharedfs")]
    pub storage_mode: String,

    /// Bucket of the job tarball (s3 mode).
    #[arg(long, env = "VFVS_CONFIG_JOB_BUCKET")]
    pub job_bucket: Option<String>,

    /// Object key of the job tarball (s3 mode).
    #[arg(long, env = "VFVS_CONFIG_JOB_OBJECT")]
    pub job_object: Option<String>,

    /// Path of the job tarball (sharedfs mode).
    #[arg(long, env = "VFVS_CONFIG_JOB_TGZ")]
    pub job_tarball: Option<PathBuf>,

    /// vCPUs available to this subjob.
    #[arg(long, env = "VFVS_VCPUS", default_value = "1")]
    pub vcpus: usize,

    /// Parent directory for scratch space.
    #[arg(long, env = "VFVS_TMP_PATH")]
    pub tmp_path: Option<PathBuf>,

    /// Directory holding the docking program binaries.
    #[arg(long, env = "VFVS_TOOLS_PATH", default_value = DEFAULT_TOOLS_PATH)]
    pub tools_path: PathBuf,

    /// Object store endpoint (`https://host[:port]`).
    #[arg(long, env = "VFVS_OBJECT_STORE_ENDPOINT")]
    pub object_store_endpoint: Option<String>,

    /// Bearer token for the object store.
    #[arg(long, env = "VFVS_OBJECT_STORE_TOKEN", hide_env_values = true)]
    pub object_store_token: Option<String>,

    /// Seconds an idle executor waits before flushing partial batches.
    #[arg(long, env = "VFVS_POLL_INTERVAL", default_value = "2")]
    pub poll_interval: f64,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dockforge backends`.
#[derive(Parser, Debug)]
pub struct BackendsArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl RunArgs {
    /// Converts the arguments into runtime settings.
    pub fn into_settings(self) -> anyhow::Result<RuntimeSettings> {
        let storage_mode: StorageMode = self
            .storage_mode
            .parse()
            .with_context(|| format!("Invalid storage mode '{}'", self.storage_mode))?;
        if !self.poll_interval.is_finite() || self.poll_interval <= 0.0 {
            anyhow::bail!("Poll interval must be a positive number of seconds");
        }

        let mut settings = RuntimeSettings::new(self.workunit, self.subjob);
        settings.storage_mode = storage_mode;
        settings.job_bucket = self.job_bucket;
        settings.job_object = self.job_object;
        settings.job_tarball = self.job_tarball;
        settings.vcpus = self.vcpus;
        if let Some(tmp_path) = self.tmp_path {
            settings.tmp_path = tmp_path;
        }
        settings.tools_path = self.tools_path;
        settings.object_store_endpoint = self.object_store_endpoint;
        settings.object_store_token = self.object_store_token;
        settings.poll_interval = Duration::from_secs_f64(self.poll_interval);
        Ok(settings)
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Backends(args) => backends_command(args),
    }
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let json = args.json;
    let settings = args.into_settings()?;
    let registry = Arc::new(BackendRegistry::with_defaults());

    let report = run_workunit(&settings, registry).await.with_context(|| {
        format!(
            "Subjob {} of workunit {} failed",
            settings.subjob_id, settings.workunit_id
        )
    })?;

    match report {
        Some(report) if json => {
            let summary = serde_json::json!({
                "workunit": settings.workunit_id,
                "subjob": settings.subjob_id,
                "collections_enqueued": report.collections_enqueued,
                "collections_filtered": report.collections_filtered,
                "elapsed_secs": report.elapsed.as_secs_f64(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Some(report) => {
            info!(
                collections = report.collections_enqueued,
                elapsed_secs = report.elapsed.as_secs_f64(),
                "Done"
            );
        }
        None => info!("Nothing to do"),
    }
    Ok(())
}

fn backends_command(args: BackendsArgs) -> anyhow::Result<()> {
    let registry = BackendRegistry::with_defaults();
    let backends = registry.list();

    if args.json {
        let entries: Vec<serde_json::Value> = backends
            .iter()
            .map(|(name, model)| serde_json::json!({"name": name, "model": model.to_string()}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for (name, model) in backends {
        println!("{:<12} {}", name, model);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_into_settings() {
        let cli = Cli::try_parse_from([
            "dockforge",
            "run",
            "--workunit",
            "17",
            "--subjob",
            "3",
            "--storage-mode",
            "s3",
            "--job-bucket",
            "jobs",
            "--job-object",
            "screen/input.tar.gz",
            "--vcpus",
            "8",
            "--poll-interval",
            "0.5",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let settings = args.into_settings().unwrap();
        assert_eq!(settings.workunit_id, "17");
        assert_eq!(settings.storage_mode, StorageMode::S3);
        assert_eq!(settings.job_bucket.as_deref(), Some("jobs"));
        assert_eq!(settings.vcpus, 8);
        assert_eq!(settings.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_storage_mode() {
        let cli = Cli::try_parse_from([
            "dockforge",
            "run",
            "--workunit",
            "1",
            "--subjob",
            "1",
            "--storage-mode",
            "tape",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.into_settings().is_err());
    }
}
