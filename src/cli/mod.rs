//! Command-line interface for dockforge.
//!
//! Provides the `run` command for executing a subjob and `backends` for
//! listing the registered docking programs.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, RunArgs};
