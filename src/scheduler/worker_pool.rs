//! Worker pools for pipeline stages.
//!
//! A `StagePool` owns the workers that consume one `StageQueue`. Each worker
//! runs as an independent tokio task and returns `Result<(), StageError>`.
//!
//! # Features
//!
//! - Fixed number of workers per stage
//! - Ordered drain: one stop sentinel per worker, then join every worker
//! - Worker errors and panics are reported on a shared failure channel the
//!   moment they happen, so the driver can abort without waiting for a drain
//! - Abort for fatal shutdown

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::StageError;

use super::queue::{QueueReceiver, QueueSender, StageQueue};

/// Errors that can occur in a stage pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker returned an error or panicked.
    #[error("Worker {worker} of stage '{stage}' exited with failure: {reason}")]
    WorkerFailed {
        stage: &'static str,
        worker: String,
        reason: String,
    },

    /// The stage queue could not accept a stop sentinel.
    #[error("Queue for stage '{0}' closed before drain")]
    QueueClosed(&'static str),
}

/// A worker failure reported while the pipeline is still running.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub stage: &'static str,
    pub worker: String,
    pub reason: String,
}

impl From<WorkerFailure> for PoolError {
    fn from(failure: WorkerFailure) -> Self {
        PoolError::WorkerFailed {
            stage: failure.stage,
            worker: failure.worker,
            reason: failure.reason,
        }
    }
}

/// Sending half of the failure channel, cloned into every worker wrapper.
#[derive(Debug, Clone)]
pub struct FailureSink(mpsc::UnboundedSender<WorkerFailure>);

/// Creates the channel on which workers report fatal failures.
pub fn failure_channel() -> (FailureSink, mpsc::UnboundedReceiver<WorkerFailure>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FailureSink(tx), rx)
}

/// The workers of one pipeline stage.
pub struct StagePool<T> {
    stage: &'static str,
    sender: QueueSender<T>,
    handles: Vec<(String, JoinHandle<Result<(), StageError>>)>,
}

impl<T: Send + 'static> StagePool<T> {
    /// Spawns `num_workers` workers consuming `queue`.
    ///
    /// `make_worker` receives the worker index and a receiver handle and
    /// returns the worker future.
    pub fn spawn<F, Fut>(
        queue: &StageQueue<T>,
        num_workers: usize,
        failures: &FailureSink,
        mut make_worker: F,
    ) -> Self
    where
        F: FnMut(usize, QueueReceiver<T>) -> Fut,
        Fut: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        let stage = queue.name();
        let mut handles = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let worker_id = format!("{}-{}", stage, index);
            let worker = make_worker(index, queue.receiver());
            let failures = failures.clone();
            let id = worker_id.clone();

            let handle = tokio::spawn(async move {
                let result = match AssertUnwindSafe(worker).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(StageError::Panicked(panic_message(panic.as_ref()))),
                };

                if let Err(ref e) = result {
                    error!(worker_id = %id, error = %e, "Worker exited with failure");
                    let _ = failures.0.send(WorkerFailure {
                        stage,
                        worker: id.clone(),
                        reason: e.to_string(),
                    });
                } else {
                    debug!(worker_id = %id, "Worker stopped");
                }
                result
            });

            handles.push((worker_id, handle));
        }

        info!(stage, num_workers, "Stage pool started");

        Self {
            stage,
            sender: queue.sender(),
            handles,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Number of workers not yet joined.
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Sends one stop sentinel per worker, then joins every worker.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::WorkerFailed` for the first worker that returned an
    /// error or panicked.
    pub async fn drain(&mut self) -> Result<(), PoolError> {
        info!(stage = self.stage, workers = self.handles.len(), "Sending stop sentinels");

        for _ in 0..self.handles.len() {
            self.sender
                .stop()
                .await
                .map_err(|_| PoolError::QueueClosed(self.stage))?;
        }

        info!(stage = self.stage, "Joining workers");
        for (worker, handle) in self.handles.drain(..) {
            let reason = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join_err) => join_err.to_string(),
            };
            return Err(PoolError::WorkerFailed {
                stage: self.stage,
                worker,
                reason,
            });
        }

        info!(stage = self.stage, "Stage drained");
        Ok(())
    }

    /// Aborts every worker still running.
    pub fn abort(&mut self) {
        for (worker, handle) in self.handles.drain(..) {
            debug!(worker_id = %worker, "Aborting worker");
            handle.abort();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
