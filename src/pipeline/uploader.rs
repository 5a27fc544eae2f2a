//! Upload stage: ships report artifacts to their destinations.

use std::sync::Arc;

use tracing::info;

use super::context::JobContext;
use super::scratch::remove_dir_logged;
use super::types::ArtifactUploadRequest;
use crate::error::StageError;
use crate::scheduler::{QueueReceiver, Received};

/// Runs one uploader until it receives a stop sentinel.
///
/// A failed upload is fatal: the worker returns the storage error.
pub async fn run_uploader(
    ctx: Arc<JobContext>,
    rx: QueueReceiver<ArtifactUploadRequest>,
) -> Result<(), StageError> {
    loop {
        match rx.recv().await {
            Received::Item(request) => {
                ctx.storage.put(&request.local_path, &request.destination).await?;
                info!(destination = %request.destination, "Artifact uploaded");
                remove_dir_logged(&request.scratch_dir).await;
            }
            Received::Idle => continue,
            Received::Stop => return Ok(()),
            Received::Closed => return Err(StageError::QueueClosed(rx.name())),
        }
    }
}
