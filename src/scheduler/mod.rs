//! Stage queues and worker pools.
//!
//! This module provides the concurrency plumbing shared by every pipeline stage:
//!
//! - **StageQueue**: bounded multi-consumer channel with stop sentinels,
//!   poll-interval receives, and a soft high-water throttle for producers
//! - **StagePool**: the workers of one stage, with ordered drain and abort
//!
//! # Architecture
//!
//! ```text
//!   producer ──send()──▶ ┌────────────┐ ──recv()──▶ worker 0
//!   (throttled above     │ StageQueue │ ──recv()──▶ worker 1
//!    high-water mark)    └────────────┘ ──recv()──▶ worker N
//!                              ▲
//!                 drain(): N × Stop, then join all
//! ```
//!
//! Workers that fail report on a shared failure channel immediately; the
//! driver selects on that channel while draining so a dead stage can never
//! stall the shutdown sequence.

pub mod queue;
pub mod worker_pool;

pub use queue::{
    Envelope, QueueError, QueueReceiver, QueueSender, Received, StageQueue, DEFAULT_POLL_INTERVAL,
};
pub use worker_pool::{failure_channel, FailureSink, PoolError, StagePool, WorkerFailure};
