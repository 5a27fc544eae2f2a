//! Stage queues with stop sentinels and soft backpressure.
//!
//! Every pipeline stage reads from one `StageQueue`. The queue is a bounded
//! tokio channel shared by all workers of the consuming stage:
//!
//! - `Envelope::Stop` is the termination sentinel; the driver sends exactly one
//!   per worker when draining the stage.
//! - Receives block for at most the configured poll interval and then report
//!   `Received::Idle`, so workers can observe sentinels promptly and run idle
//!   work such as flushing partial batches.
//! - Producers call `QueueSender::send`, which first sleeps while the observed
//!   depth is above the high-water mark. This is a check-then-insert throttle,
//!   so short overshoots are possible; the channel capacity is the hard bound.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::error::StageError;

/// Sleep between depth checks while a producer is throttled.
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(200);

/// Default time a receive waits before reporting `Received::Idle`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Every receiver has been dropped.
    #[error("Queue '{0}' is closed")]
    Closed(&'static str),
}

impl From<QueueError> for StageError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Closed(name) => StageError::QueueClosed(name),
        }
    }
}

/// A queue message: either a work item or the stop sentinel.
#[derive(Debug)]
pub enum Envelope<T> {
    Item(T),
    Stop,
}

/// Outcome of a single receive attempt.
#[derive(Debug)]
pub enum Received<T> {
    Item(T),
    Stop,
    /// Nothing arrived within the poll interval.
    Idle,
    /// All senders are gone.
    Closed,
}

/// Bounded multi-consumer queue between two pipeline stages.
pub struct StageQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<Envelope<T>>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope<T>>>>,
    high_water: usize,
    poll_interval: Duration,
}

impl<T: Send + 'static> StageQueue<T> {
    /// Creates a queue with a hard `capacity` and a soft `high_water` mark.
    ///
    /// The capacity is raised to at least `high_water + 1` so the throttle is
    /// always reachable before the channel blocks.
    pub fn new(name: &'static str, capacity: usize, high_water: usize) -> Self {
        let capacity = capacity.max(high_water + 1).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            name,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            high_water,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the receive poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a producer handle.
    pub fn sender(&self) -> QueueSender<T> {
        QueueSender {
            name: self.name,
            tx: self.tx.clone(),
            high_water: self.high_water,
        }
    }

    /// Returns a consumer handle. All handles share the same underlying receiver.
    pub fn receiver(&self) -> QueueReceiver<T> {
        QueueReceiver {
            name: self.name,
            rx: Arc::clone(&self.rx),
            poll_interval: self.poll_interval,
        }
    }

    /// Number of messages currently buffered.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Producer side of a `StageQueue`.
pub struct QueueSender<T> {
    name: &'static str,
    tx: mpsc::Sender<Envelope<T>>,
    high_water: usize,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            high_water: self.high_water,
        }
    }
}

impl<T: Send + 'static> QueueSender<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of messages currently buffered.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Waits until the depth is at or below the high-water mark.
    pub async fn throttle(&self) {
        while self.depth() > self.high_water {
            trace!(queue = self.name, depth = self.depth(), "Throttling producer");
            tokio::time::sleep(THROTTLE_INTERVAL).await;
        }
    }

    /// Throttles, then enqueues the item.
    pub async fn send(&self, item: T) -> Result<(), QueueError> {
        self.throttle().await;
        self.send_now(item).await
    }

    /// Enqueues without the high-water throttle; still waits if the channel is full.
    pub async fn send_now(&self, item: T) -> Result<(), QueueError> {
        self.tx
            .send(Envelope::Item(item))
            .await
            .map_err(|_| QueueError::Closed(self.name))
    }

    /// Enqueues one stop sentinel.
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.tx
            .send(Envelope::Stop)
            .await
            .map_err(|_| QueueError::Closed(self.name))
    }
}

/// Consumer side of a `StageQueue`.
pub struct QueueReceiver<T> {
    name: &'static str,
    rx: Arc<Mutex<mpsc::Receiver<Envelope<T>>>>,
    poll_interval: Duration,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            rx: Arc::clone(&self.rx),
            poll_interval: self.poll_interval,
        }
    }
}

impl<T: Send + 'static> QueueReceiver<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Receives one message, waiting at most the poll interval.
    ///
    /// The wait includes time spent queued behind other workers for the
    /// shared receiver.
    pub async fn recv(&self) -> Received<T> {
        let attempt = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };

        match tokio::time::timeout(self.poll_interval, attempt).await {
            Ok(Some(Envelope::Item(item))) => Received::Item(item),
            Ok(Some(Envelope::Stop)) => Received::Stop,
            Ok(None) => Received::Closed,
            Err(_) => Received::Idle,
        }
    }
}
