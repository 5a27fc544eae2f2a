//! Subjob driver: wires the stage queues and pools and runs the shutdown
//! sequence.
//!
//! ```text
//!  feed ─▶ download ─▶ unpack ─▶ validate ─▶ execute ─▶ aggregate ─▶ upload
//!             │                     │           │          ▲
//!             └─────── download_failed, skip, delete, docking_complete
//! ```
//!
//! Stages are drained in pipeline order. The whole run is raced against the
//! failure channel: the first worker error or panic aborts every pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info};

use super::aggregator::run_aggregator;
use super::context::JobContext;
use super::downloader::run_downloader;
use super::events::SummaryEvent;
use super::executor::run_executor;
use super::types::{
    ArtifactUploadRequest, CollectionTask, DockingTask, DownloadedCollection, UnpackedCollection,
};
use super::unpacker::run_unpacker;
use super::uploader::run_uploader;
use super::validator::run_validator;
use crate::config::WorkerCounts;
use crate::scheduler::{failure_channel, PoolError, QueueError, StagePool, StageQueue};

/// High-water marks per queue.
pub const DOWNLOAD_HIGH_WATER: usize = 25;
pub const UNPACK_HIGH_WATER: usize = 35;
pub const VALIDATE_HIGH_WATER: usize = 35;
pub const DOCKING_HIGH_WATER: usize = 100;
pub const SUMMARY_HIGH_WATER: usize = 200;
pub const UPLOAD_HIGH_WATER: usize = 25;

/// Hard channel capacity as a multiple of the high-water mark.
const CAPACITY_FACTOR: usize = 4;

/// Errors that abort a subjob run.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Collection feed failed: {0}")]
    Feed(#[from] QueueError),
}

/// Outcome of a completed subjob run.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjobReport {
    pub collections_enqueued: usize,
    /// Collections dropped by the tranche filter before download.
    pub collections_filtered: usize,
    pub elapsed: Duration,
}

/// Runs one subjob's collections through the pipeline.
pub struct SubjobRunner {
    ctx: Arc<JobContext>,
    counts: WorkerCounts,
}

fn queue<T: Send + 'static>(name: &'static str, high_water: usize) -> StageQueue<T> {
    StageQueue::new(name, high_water * CAPACITY_FACTOR, high_water)
}

impl SubjobRunner {
    pub fn new(ctx: Arc<JobContext>, counts: WorkerCounts) -> Self {
        Self { ctx, counts }
    }

    /// Whether the collection-level tranche filter drops `task`.
    pub fn is_filtered(&self, task: &CollectionTask) -> bool {
        if self.ctx.config.prescreen_mode {
            return false;
        }
        match &self.ctx.tranche_filter {
            Some(filter) => !filter.is_match(task.tranche()),
            None => false,
        }
    }

    /// Feeds `tasks` into the pipeline and drains every stage.
    ///
    /// # Errors
    ///
    /// Returns the first fatal worker failure. All pools are aborted first.
    pub async fn run(&self, tasks: Vec<CollectionTask>) -> Result<SubjobReport, RunnerError> {
        let started = Instant::now();
        let ctx = &self.ctx;
        let counts = self.counts;

        let download_q: StageQueue<CollectionTask> = queue("download", DOWNLOAD_HIGH_WATER);
        let unpack_q: StageQueue<DownloadedCollection> = queue("unpack", UNPACK_HIGH_WATER);
        let validate_q: StageQueue<UnpackedCollection> = queue("validate", VALIDATE_HIGH_WATER);
        let docking_q: StageQueue<DockingTask> =
            queue("docking", DOCKING_HIGH_WATER).with_poll_interval(ctx.poll_interval);
        let summary_q: StageQueue<SummaryEvent> = queue("summary", SUMMARY_HIGH_WATER);
        let upload_q: StageQueue<ArtifactUploadRequest> = queue("upload", UPLOAD_HIGH_WATER);

        let (sink, mut failures) = failure_channel();

        let mut upload_pool = StagePool::spawn(&upload_q, counts.uploaders, &sink, |_, rx| {
            run_uploader(Arc::clone(ctx), rx)
        });
        let mut summary_pool = StagePool::spawn(&summary_q, counts.aggregators, &sink, |_, rx| {
            run_aggregator(Arc::clone(ctx), rx, upload_q.sender())
        });
        let mut docking_pool = StagePool::spawn(&docking_q, counts.executors, &sink, |_, rx| {
            run_executor(Arc::clone(ctx), rx, summary_q.sender())
        });
        let mut validate_pool = StagePool::spawn(&validate_q, counts.validators, &sink, |_, rx| {
            run_validator(Arc::clone(ctx), rx, docking_q.sender(), summary_q.sender())
        });
        let mut unpack_pool = StagePool::spawn(&unpack_q, counts.unpackers, &sink, |_, rx| {
            run_unpacker(rx, validate_q.sender())
        });
        let mut download_pool = StagePool::spawn(&download_q, counts.downloaders, &sink, |_, rx| {
            run_downloader(Arc::clone(ctx), rx, unpack_q.sender(), summary_q.sender())
        });

        let mut enqueued = 0;
        let mut filtered = 0;

        let pipeline = async {
            let feed = download_q.sender();
            for task in tasks {
                if self.is_filtered(&task) {
                    info!(collection = %task.collection_key, "Collection excluded by tranche filter");
                    filtered += 1;
                    continue;
                }
                feed.send(task).await?;
                enqueued += 1;
            }
            info!(collections = enqueued, filtered, "All collections enqueued");

            download_pool.drain().await?;
            unpack_pool.drain().await?;
            validate_pool.drain().await?;
            docking_pool.drain().await?;
            summary_pool.drain().await?;
            upload_pool.drain().await?;
            Ok::<(), RunnerError>(())
        };

        let outcome = tokio::select! {
            result = pipeline => result,
            Some(failure) = failures.recv() => Err(RunnerError::Pool(failure.into())),
        };

        if let Err(e) = outcome {
            error!(error = %e, "Fatal pipeline failure; aborting all stages");
            download_pool.abort();
            unpack_pool.abort();
            validate_pool.abort();
            docking_pool.abort();
            summary_pool.abort();
            upload_pool.abort();
            return Err(e);
        }

        let report = SubjobReport {
            collections_enqueued: enqueued,
            collections_filtered: filtered,
            elapsed: started.elapsed(),
        };
        info!(
            collections = report.collections_enqueued,
            filtered = report.collections_filtered,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "Subjob finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::fixtures::{context, job_config};
    use crate::pipeline::types::SelectionMode;
    use crate::storage::StorageLocator;
    use tempfile::TempDir;

    fn task(key: &str, path: &std::path::Path) -> CollectionTask {
        CollectionTask {
            collection_key: key.to_string(),
            locator: StorageLocator::SharedFs(path.to_path_buf()),
            selection: SelectionMode::Full,
            expected_dockings: 1,
        }
    }

    #[tokio::test]
    async fn test_empty_subjob_writes_overview() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let ctx = Arc::new(context(job_config(1, 1, &out), &temp.path().join("scratch"), temp.path()));

        let runner = SubjobRunner::new(ctx, WorkerCounts::for_vcpus(2));
        let report = runner.run(Vec::new()).await.unwrap();

        assert_eq!(report.collections_enqueued, 0);
        assert!(out.join("summary/wu-1/7.json.gz").exists());
        assert!(!out.join("qvina_rigid").exists());
    }

    #[tokio::test]
    async fn test_missing_collection_is_recorded_not_fatal() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let ctx = Arc::new(context(job_config(1, 1, &out), &temp.path().join("scratch"), temp.path()));

        let runner = SubjobRunner::new(ctx, WorkerCounts::for_vcpus(1));
        let report = runner
            .run(vec![task("AAAA_1", &temp.path().join("absent.tar.gz"))])
            .await
            .unwrap();

        assert_eq!(report.collections_enqueued, 1);
        assert!(out.join("summary/wu-1/7.json.gz").exists());
    }

    #[tokio::test]
    async fn test_upload_failure_aborts_run() {
        let temp = TempDir::new().unwrap();
        // The output root is a file, so every upload fails.
        let out = temp.path().join("out");
        std::fs::write(&out, b"not a directory").unwrap();
        let ctx = Arc::new(context(job_config(1, 1, &out), &temp.path().join("scratch"), temp.path()));

        let runner = SubjobRunner::new(ctx, WorkerCounts::for_vcpus(1));
        let err = runner.run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Pool(_)));
    }

    #[test]
    fn test_tranche_filter_drops_collections() {
        let temp = TempDir::new().unwrap();
        let mut config = job_config(1, 1, temp.path());
        config.dynamic_tranche_filtering = true;
        config.dynamic_tranche_filtering_regex = Some("^AA".to_string());
        let ctx = Arc::new(context(config, temp.path(), temp.path()));
        let runner = SubjobRunner::new(ctx, WorkerCounts::for_vcpus(1));

        assert!(!runner.is_filtered(&task("AACD_1", temp.path())));
        assert!(runner.is_filtered(&task("BBCD_1", temp.path())));
    }

    #[tokio::test]
    async fn test_stage_queue_holds_capacity_factor_items() {
        let q: StageQueue<DockingTask> = queue("docking", 2);
        let tx = q.sender();
        for replica in 0..(2 * CAPACITY_FACTOR) as u32 {
            let task = crate::pipeline::types::fixtures::docking_task("qvina_rigid", "Z1", replica);
            tokio::time::timeout(Duration::from_secs(1), tx.send_now(task))
                .await
                .expect("queue full before its hard capacity")
                .unwrap();
        }
        assert_eq!(q.depth(), 2 * CAPACITY_FACTOR);
    }
}
