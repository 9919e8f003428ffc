//! Stress driver for the concurrent collector
//!
//! Runs a multi-threaded allocation and mutation workload against a
//! [`memory_manager::Heap`], checks the reachable graph after every cycle and
//! reports the collector statistics.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod error;
pub mod logging;
pub mod workload;

pub use cli::Cli;
pub use error::{CliError, CliResult};
pub use workload::{Report, Workload, WorkloadOptions};
