//! Download stage: fetches collection archives into scratch space.

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use super::context::JobContext;
use super::events::{DownloadFailureLog, SummaryEvent};
use super::types::{CollectionTask, DownloadedCollection};
use crate::error::StageError;
use crate::scheduler::{QueueReceiver, QueueSender, Received};

/// File name of the fetched archive inside the collection scratch directory.
pub const ARCHIVE_FILE: &str = "tmp.tar.gz";

/// Runs one download worker until it receives a stop sentinel.
pub async fn run_downloader(
    ctx: Arc<JobContext>,
    rx: QueueReceiver<CollectionTask>,
    unpack: QueueSender<DownloadedCollection>,
    summary: QueueSender<SummaryEvent>,
) -> Result<(), StageError> {
    loop {
        match rx.recv().await {
            Received::Item(task) => download(&ctx, task, &unpack, &summary).await?,
            Received::Idle => continue,
            Received::Stop => return Ok(()),
            Received::Closed => return Err(StageError::QueueClosed(rx.name())),
        }
    }
}

async fn download(
    ctx: &JobContext,
    task: CollectionTask,
    unpack: &QueueSender<DownloadedCollection>,
    summary: &QueueSender<SummaryEvent>,
) -> Result<(), StageError> {
    let scratch_dir = ctx
        .scratch_root
        .join("collections")
        .join(format!("{}-{}", task.collection_key, Uuid::new_v4()));
    tokio::fs::create_dir_all(&scratch_dir).await?;
    let archive_path = scratch_dir.join(ARCHIVE_FILE);

    debug!(collection = %task.collection_key, source = %task.locator, "Fetching collection");

    match ctx.storage.fetch(&task.locator, &archive_path).await {
        Ok(bytes) => {
            info!(collection = %task.collection_key, bytes, "Collection downloaded");
            unpack
                .send(DownloadedCollection {
                    task,
                    scratch_dir,
                    archive_path,
                })
                .await?;
        }
        Err(e) => {
            error!(collection = %task.collection_key, error = %e, "Collection download failed");
            if let Err(cleanup) = tokio::fs::remove_dir_all(&scratch_dir).await {
                debug!(path = %scratch_dir.display(), error = %cleanup, "Scratch cleanup failed");
            }
            summary
                .send(SummaryEvent::DownloadFailed(DownloadFailureLog {
                    base_collection_key: task.collection_key,
                    reason: e.to_string(),
                    dockings: task.expected_dockings,
                }))
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::context::fixtures::{context, job_config};
    use crate::pipeline::types::SelectionMode;
    use crate::scheduler::StageQueue;
    use crate::storage::StorageLocator;
    use std::time::Duration;
    use tempfile::TempDir;

    fn queues() -> (
        StageQueue<CollectionTask>,
        StageQueue<DownloadedCollection>,
        StageQueue<SummaryEvent>,
    ) {
        let poll = Duration::from_millis(20);
        (
            StageQueue::new("download", 8, 25).with_poll_interval(poll),
            StageQueue::new("unpack", 8, 35).with_poll_interval(poll),
            StageQueue::new("summary", 8, 200).with_poll_interval(poll),
        )
    }

    #[tokio::test]
    async fn test_shared_fs_download_forwarded() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("AAAA_1.tar.gz");
        tokio::fs::write(&source, b"archive").await.unwrap();

        let ctx = Arc::new(context(
            job_config(1, 1, &temp.path().join("out")),
            &temp.path().join("scratch"),
            temp.path(),
        ));
        let (downloads, unpacks, summaries) = queues();
        let worker = tokio::spawn(run_downloader(
            Arc::clone(&ctx),
            downloads.receiver(),
            unpacks.sender(),
            summaries.sender(),
        ));

        downloads
            .sender()
            .send(CollectionTask {
                collection_key: "AAAA_1".to_string(),
                locator: StorageLocator::SharedFs(source),
                selection: SelectionMode::Full,
                expected_dockings: 4,
            })
            .await
            .unwrap();
        downloads.sender().stop().await.unwrap();
        worker.await.unwrap().unwrap();

        match unpacks.receiver().recv().await {
            Received::Item(item) => {
                assert_eq!(item.task.collection_key, "AAAA_1");
                assert_eq!(tokio::fs::read(&item.archive_path).await.unwrap(), b"archive");
                assert!(item.scratch_dir.starts_with(temp.path().join("scratch")));
            }
            other => panic!("expected downloaded collection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_download_reports_lost_dockings() {
        let temp = TempDir::new().unwrap();
        let ctx = Arc::new(context(
            job_config(1, 1, &temp.path().join("out")),
            &temp.path().join("scratch"),
            temp.path(),
        ));
        let (downloads, unpacks, summaries) = queues();
        let worker = tokio::spawn(run_downloader(
            Arc::clone(&ctx),
            downloads.receiver(),
            unpacks.sender(),
            summaries.sender(),
        ));

        downloads
            .sender()
            .send(CollectionTask {
                collection_key: "ZZZZ_9".to_string(),
                locator: StorageLocator::SharedFs(temp.path().join("missing.tar.gz")),
                selection: SelectionMode::Full,
                expected_dockings: 12,
            })
            .await
            .unwrap();
        downloads.sender().stop().await.unwrap();
        worker.await.unwrap().unwrap();

        match summaries.receiver().recv().await {
            Received::Item(SummaryEvent::DownloadFailed(log)) => {
                assert_eq!(log.base_collection_key, "ZZZZ_9");
                assert_eq!(log.dockings, 12);
            }
            other => panic!("expected download failure, got {:?}", other),
        }
        assert!(matches!(unpacks.receiver().recv().await, Received::Idle));

        let leftover = std::fs::read_dir(temp.path().join("scratch/collections"))
            .unwrap()
            .count();
        assert_eq!(leftover, 0);
    }
}
