//! The subjob pipeline.
//!
//! A subjob is a set of ligand collections pushed through six stages, each a
//! pool of tokio workers joined by a bounded [`StageQueue`](crate::scheduler::StageQueue):
//!
//! 1. **Download**: fetch the collection archive into scratch space
//! 2. **Unpack**: extract it and apply the selection mode (full, named,
//!    prescreen)
//! 3. **Validate**: screen ligands for banned elements and duplicate
//!    coordinates, then dispatch one docking task per scenario and replica
//! 4. **Execute**: batch tasks per scenario and run the docking backend
//! 5. **Aggregate**: the single writer of counters, summary tables and
//!    per-collection completion; writes the reports at shutdown
//! 6. **Upload**: ship report artifacts to the object store or shared
//!    filesystem
//!
//! Per-ligand and per-docking failures never cross a queue as errors; they
//! travel as [`SummaryEvent`]s and end up in the overview report. Anything a
//! worker returns as an error aborts the subjob.
//!
//! # Example
//!
//! ```rust,ignore
//! use dockforge::backend::BackendRegistry;
//! use dockforge::config::RuntimeSettings;
//! use dockforge::pipeline::run_workunit;
//! use std::sync::Arc;
//!
//! let mut settings = RuntimeSettings::new("wu-17", "3");
//! settings.job_tarball = Some("/shared/jobs/screen-01.tar.gz".into());
//! settings.vcpus = 8;
//!
//! let report = run_workunit(&settings, Arc::new(BackendRegistry::with_defaults())).await?;
//! ```

pub mod aggregator;
pub mod bootstrap;
pub mod completion;
pub mod context;
pub mod downloader;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod scratch;
pub mod types;
pub mod unpacker;
pub mod uploader;
pub mod validator;

pub use bootstrap::{run_workunit, BootstrapError, SubjobSelection};
pub use completion::{CompletionTracker, Expected};
pub use context::JobContext;
pub use events::{FailureLog, SkipReason, SummaryEvent};
pub use orchestrator::{RunnerError, SubjobReport, SubjobRunner};
pub use types::{CollectionTask, DockingStatus, DockingTask, ExecutionBatch, SelectionMode};
