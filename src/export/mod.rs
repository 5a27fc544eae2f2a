//! Report artifacts: overview JSON, summary tables and output tarballs.

pub mod archive;
pub mod csv_writer;
pub mod overview;
pub mod parquet_writer;
pub mod summary;

pub use archive::create_tar_gz;
pub use csv_writer::write_csv_gz;
pub use overview::{DockingsStatus, OverviewReport, RunMetadata};
pub use parquet_writer::write_parquet;
pub use summary::{ReducedTable, ScenarioSummaryRow, SummaryTable};
