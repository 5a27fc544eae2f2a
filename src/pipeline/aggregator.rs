//! Aggregate stage: the single writer of reports and completion state.
//!
//! One worker owns the overview report, the per-scenario summary tables and
//! the completion tracker. When a collection completes, its per-ligand
//! outputs move into the scenario output tree and its scratch directory is
//! deleted. On stop the reports are written into upload directories and
//! handed to the uploaders.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::completion::{CompletedCollection, CompletionTracker};
use super::context::JobContext;
use super::events::SummaryEvent;
use super::scratch::{move_children, remove_dir_logged};
use super::types::{ArtifactUploadRequest, ExecutionBatch};
use crate::backend::ExecutionModel;
use crate::config::SummaryFormat;
use crate::error::StageError;
use crate::export::{create_tar_gz, write_csv_gz, write_parquet, OverviewReport, RunMetadata, SummaryTable};
use crate::scheduler::{QueueReceiver, QueueSender, Received};
use crate::storage::ContentType;

pub struct Aggregator {
    ctx: Arc<JobContext>,
    upload: QueueSender<ArtifactUploadRequest>,
    overview: OverviewReport,
    tables: BTreeMap<String, SummaryTable>,
    tracker: CompletionTracker,
    batches_processed: u64,
    started: Instant,
}

/// Runs the aggregator until it receives a stop sentinel.
pub async fn run_aggregator(
    ctx: Arc<JobContext>,
    rx: QueueReceiver<SummaryEvent>,
    upload: QueueSender<ArtifactUploadRequest>,
) -> Result<(), StageError> {
    let mut aggregator = Aggregator::new(ctx, upload);
    aggregator.prepare_output_dirs().await?;

    loop {
        match rx.recv().await {
            Received::Item(event) => aggregator.handle(event).await?,
            Received::Idle => continue,
            Received::Stop => return aggregator.finish().await,
            Received::Closed => return Err(StageError::QueueClosed(rx.name())),
        }
    }
}

impl Aggregator {
    pub fn new(ctx: Arc<JobContext>, upload: QueueSender<ArtifactUploadRequest>) -> Self {
        let metadata = RunMetadata {
            workunit_id: ctx.workunit_id.clone(),
            subjob_id: ctx.subjob_id.clone(),
            job_name: ctx.config.job_name.clone(),
            ligand_library_format: ctx.config.ligand_library_format.clone(),
            scenarios: ctx.scenarios.iter().map(|s| s.key.clone()).collect(),
            vcpus: ctx.vcpus,
            started_at: ctx.started_at,
        };
        let tables = ctx
            .scenarios
            .iter()
            .map(|s| (s.key.clone(), SummaryTable::new(&s.key)))
            .collect();

        Self {
            ctx,
            upload,
            overview: OverviewReport::new(metadata),
            tables,
            tracker: CompletionTracker::new(),
            batches_processed: 0,
            started: Instant::now(),
        }
    }

    pub fn overview(&self) -> &OverviewReport {
        &self.overview
    }

    pub fn table(&self, scenario_key: &str) -> Option<&SummaryTable> {
        self.tables.get(scenario_key)
    }

    async fn prepare_output_dirs(&self) -> Result<(), StageError> {
        for scenario in &self.ctx.scenarios {
            tokio::fs::create_dir_all(self.ctx.scenario_output_dir(&scenario.key)).await?;
        }
        Ok(())
    }

    pub async fn handle(&mut self, event: SummaryEvent) -> Result<(), StageError> {
        debug!(kind = event.kind(), "Summary event");
        match event {
            SummaryEvent::DownloadFailed(entry) => {
                warn!(
                    collection = %entry.base_collection_key,
                    dockings = entry.dockings,
                    reason = %entry.reason,
                    "Collection download failed"
                );
                self.overview.record_download_failure(entry);
            }
            SummaryEvent::Skip(entry) => {
                debug!(ligand = %entry.ligand_key, reason = %entry.reason, "Ligand skipped");
                self.overview.record_skip(entry);
            }
            SummaryEvent::CollectionDone(marker) => {
                let done = self.tracker.record_marker(
                    &marker.base_collection_key,
                    marker.expected_completions,
                    marker.scratch_dir,
                );
                if let Some(done) = done {
                    self.archive_collection(done).await?;
                }
            }
            SummaryEvent::DockingComplete(batch) => self.record_batch(batch).await?,
        }
        Ok(())
    }

    async fn record_batch(&mut self, batch: ExecutionBatch) -> Result<(), StageError> {
        self.batches_processed += 1;

        for task in &batch.tasks {
            self.overview.record_task(task);
            if let Some(table) = self.tables.get_mut(&task.scenario_key) {
                table.record(task);
            }
            if let Some(done) = self.tracker.record_outcome(&task.base_collection_key) {
                self.archive_collection(done).await?;
            }
        }

        if batch.model == ExecutionModel::Batch {
            self.relocate_batch_logs(&batch).await?;
        }
        Ok(())
    }

    /// Moves a completed collection's outputs into the scenario trees and
    /// deletes its scratch directory.
    async fn archive_collection(&self, done: CompletedCollection) -> Result<(), StageError> {
        let moves: Vec<(PathBuf, PathBuf)> = self
            .ctx
            .scenarios
            .iter()
            .map(|s| {
                (
                    done.scratch_dir.join("output").join(&s.key),
                    self.ctx.scenario_output_dir(&s.key),
                )
            })
            .filter(|(src, _)| src.is_dir())
            .collect();

        tokio::task::spawn_blocking(move || {
            moves
                .iter()
                .try_for_each(|(src, dst)| move_children(src, dst))
        })
        .await
        .map_err(|e| StageError::Panicked(e.to_string()))??;

        remove_dir_logged(&done.scratch_dir).await;
        info!(collection = %done.base_collection_key, "Collection complete");
        Ok(())
    }

    async fn relocate_batch_logs(&self, batch: &ExecutionBatch) -> Result<(), StageError> {
        let (Some(uuid), Some(log_dir)) = (batch.uuid, batch.log_dir.clone()) else {
            return Ok(());
        };
        if !log_dir.is_dir() {
            return Ok(());
        }

        let dest = self
            .ctx
            .scenario_output_dir(&batch.scenario_key)
            .join("batch_exec")
            .join(uuid.to_string());
        let src = log_dir.clone();
        tokio::task::spawn_blocking(move || move_children(&src, &dest))
            .await
            .map_err(|e| StageError::Panicked(e.to_string()))??;
        remove_dir_logged(&log_dir).await;
        Ok(())
    }

    /// Writes every report and enqueues the uploads.
    pub async fn finish(mut self) -> Result<(), StageError> {
        for (key, state) in self.tracker.pending() {
            warn!(collection = key, current = state.current, "Collection incomplete at shutdown");
        }

        self.overview.sec = self.started.elapsed().as_secs_f64();
        info!(
            total = self.overview.total_dockings,
            success = self.overview.dockings_status.success,
            failed = self.overview.dockings_status.failed,
            skipped = self.overview.skipped_ligands,
            failed_downloads = self.overview.failed_downloads,
            "Writing reports"
        );

        let dir = self.upload_dir().await?;
        let path = dir.join("overview.json.gz");
        let overview = self.overview.clone();
        let target = path.clone();
        blocking(move || overview.write_json_gz(&target)).await?;
        self.enqueue(path, None, ContentType::Summary, dir).await?;

        if self.batches_processed == 0 {
            info!("No docking batches processed; skipping summaries and output archives");
            return Ok(());
        }

        for scenario in &self.ctx.scenarios {
            self.write_summaries(&scenario.key).await?;
            self.write_output_archive(&scenario.key).await?;
        }
        Ok(())
    }

    async fn write_summaries(&self, scenario_key: &str) -> Result<(), StageError> {
        let Some(table) = self.tables.get(scenario_key).filter(|t| !t.is_empty()) else {
            info!(scenario = scenario_key, "No successful dockings; no summary");
            return Ok(());
        };
        let reduced = Arc::new(table.reduce());

        for format in &self.ctx.summary_formats {
            let dir = self.upload_dir().await?;
            let table = Arc::clone(&reduced);
            let (path, content_type) = match format {
                SummaryFormat::CsvGz => {
                    let path = dir.join("summary.txt.gz");
                    let target = path.clone();
                    blocking(move || write_csv_gz(&table, &target)).await?;
                    (path, ContentType::Csv)
                }
                SummaryFormat::Parquet => {
                    let path = dir.join("summary.parquet");
                    let target = path.clone();
                    blocking(move || write_parquet(&table, &target)).await?;
                    (path, ContentType::Parquet)
                }
            };
            self.enqueue(path, Some(scenario_key), content_type, dir).await?;
        }
        Ok(())
    }

    async fn write_output_archive(&self, scenario_key: &str) -> Result<(), StageError> {
        let source = self.ctx.scenario_output_dir(scenario_key);
        if !source.is_dir() {
            return Ok(());
        }

        let dir = self.upload_dir().await?;
        let path = dir.join(format!("{}.tar.gz", self.ctx.subjob_id));
        let target = path.clone();
        blocking(move || create_tar_gz(&source, &target)).await?;
        self.enqueue(path, Some(scenario_key), ContentType::Logs, dir).await
    }

    async fn upload_dir(&self) -> Result<PathBuf, StageError> {
        let dir = self.ctx.scratch_root.join("upload").join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn enqueue(
        &self,
        local_path: PathBuf,
        scenario: Option<&str>,
        content_type: ContentType,
        scratch_dir: PathBuf,
    ) -> Result<(), StageError> {
        let destination = self.ctx.layout.locator(scenario, content_type);
        info!(file = %display_name(&local_path), destination = %destination, "Queueing upload");
        self.upload
            .send(ArtifactUploadRequest {
                local_path,
                destination,
                scratch_dir,
            })
            .await?;
        Ok(())
    }
}

async fn blocking<F, E>(f: F) -> Result<(), StageError>
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: Into<StageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StageError::Panicked(e.to_string()))?
        .map_err(Into::into)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::fixtures::{context, job_config};
    use crate::pipeline::events::{CollectionMarker, DownloadFailureLog};
    use crate::pipeline::types::fixtures::docking_task;
    use crate::scheduler::StageQueue;
    use crate::storage::StorageLocator;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        scratch: PathBuf,
        ctx: Arc<JobContext>,
        uploads: StageQueue<ArtifactUploadRequest>,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("scratch");
        let ctx = Arc::new(context(
            job_config(2, 1, &temp.path().join("out")),
            &scratch,
            &temp.path().join("tools"),
        ));
        Harness {
            _temp: temp,
            scratch,
            ctx,
            uploads: StageQueue::new("upload", 64, 64),
        }
    }

    fn successful_batch(ligand: &str, replica: u32, scratch_dir: &Path) -> ExecutionBatch {
        let mut task = docking_task("qvina_rigid", ligand, replica);
        task.collection_key = "AAAA_1".to_string();
        task.base_collection_key = "AAAA_1".to_string();
        task.output_dir = scratch_dir
            .join("output/qvina_rigid")
            .join(ligand)
            .join(replica.to_string());
        task.mark_success(-7.0 - f64::from(replica));

        let mut batch = ExecutionBatch::new("qvina_rigid", "qvina02", ExecutionModel::Single);
        batch.tasks.push(task);
        batch
    }

    #[tokio::test]
    async fn test_completion_moves_outputs_and_removes_scratch() {
        let h = harness();
        let collection_dir = h.scratch.join("collections/AAAA_1-x");
        std::fs::create_dir_all(collection_dir.join("output/qvina_rigid/Z1/0")).unwrap();
        std::fs::create_dir_all(collection_dir.join("output/qvina_rigid/Z1/1")).unwrap();
        std::fs::write(collection_dir.join("output/qvina_rigid/Z1/0/stdout"), "run 0").unwrap();

        let mut aggregator = Aggregator::new(Arc::clone(&h.ctx), h.uploads.sender());
        aggregator.prepare_output_dirs().await.unwrap();

        aggregator
            .handle(SummaryEvent::DockingComplete(successful_batch("Z1", 0, &collection_dir)))
            .await
            .unwrap();
        aggregator
            .handle(SummaryEvent::CollectionDone(CollectionMarker {
                base_collection_key: "AAAA_1".to_string(),
                expected_completions: 2,
                scratch_dir: collection_dir.clone(),
            }))
            .await
            .unwrap();
        assert!(collection_dir.exists());

        aggregator
            .handle(SummaryEvent::DockingComplete(successful_batch("Z1", 1, &collection_dir)))
            .await
            .unwrap();

        assert!(!collection_dir.exists());
        let moved = h.ctx.scenario_output_dir("qvina_rigid").join("Z1/0/stdout");
        assert_eq!(std::fs::read_to_string(moved).unwrap(), "run 0");

        let overview = aggregator.overview();
        assert_eq!(overview.total_dockings, 2);
        assert_eq!(overview.dockings_status.success, 2);
        assert_eq!(aggregator.table("qvina_rigid").unwrap().rows()[0].scores, vec![-7.0, -8.0]);
    }

    #[tokio::test]
    async fn test_finish_without_dockings_uploads_only_overview() {
        let h = harness();
        let mut aggregator = Aggregator::new(Arc::clone(&h.ctx), h.uploads.sender());
        aggregator.prepare_output_dirs().await.unwrap();
        aggregator
            .handle(SummaryEvent::DownloadFailed(DownloadFailureLog {
                base_collection_key: "AAAA_1".to_string(),
                reason: "missing".to_string(),
                dockings: 4,
            }))
            .await
            .unwrap();
        aggregator.finish().await.unwrap();

        assert_eq!(h.uploads.depth(), 1);
        let Received::Item(request) = h.uploads.receiver().recv().await else {
            panic!("expected an upload request");
        };
        assert!(request.local_path.ends_with("overview.json.gz"));
        assert!(request.local_path.exists());
        let StorageLocator::SharedFs(dest) = request.destination else {
            panic!("expected a shared-fs destination");
        };
        assert!(dest.ends_with("summary/wu-1/7.json.gz"));
    }

    #[tokio::test]
    async fn test_finish_writes_summary_and_archive() {
        let h = harness();
        let collection_dir = h.scratch.join("collections/AAAA_1-y");
        std::fs::create_dir_all(collection_dir.join("output/qvina_rigid/Z1/0")).unwrap();

        let mut aggregator = Aggregator::new(Arc::clone(&h.ctx), h.uploads.sender());
        aggregator.prepare_output_dirs().await.unwrap();
        aggregator
            .handle(SummaryEvent::DockingComplete(successful_batch("Z1", 0, &collection_dir)))
            .await
            .unwrap();
        aggregator.finish().await.unwrap();

        // overview, csv summary, output archive
        assert_eq!(h.uploads.depth(), 3);
        let rx = h.uploads.receiver();
        let mut names = Vec::new();
        for _ in 0..3 {
            if let Received::Item(request) = rx.recv().await {
                names.push(display_name(&request.local_path));
            }
        }
        assert_eq!(names, vec!["overview.json.gz", "summary.txt.gz", "7.tar.gz"]);
    }
}
