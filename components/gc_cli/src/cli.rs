//! Command-line arguments

use crate::error::{CliError, CliResult};
use crate::workload::WorkloadOptions;
use clap::Parser;
use memory_manager::GcConfig;
use std::fs;
use std::path::PathBuf;

/// Drive a multi-threaded workload against the concurrent collector
#[derive(Parser, Debug)]
#[command(name = "gc-stress")]
#[command(version = "0.1.0")]
#[command(about = "Stress the concurrent generational collector", long_about = None)]
pub struct Cli {
    /// Number of mutator threads
    #[arg(short = 't', long, default_value_t = 4)]
    pub threads: usize,

    /// Number of collection cycles to drive
    #[arg(short = 'r', long, default_value_t = 10)]
    pub rounds: usize,

    /// Operations per thread and cycle
    #[arg(short = 'o', long, default_value_t = 10_000)]
    pub ops: usize,

    /// Root slots owned by each thread
    #[arg(short = 's', long, default_value_t = 256)]
    pub slots: usize,

    /// Seed of the operation mix
    #[arg(long, default_value_t = 0x5eed)]
    pub seed: u64,

    /// JSON configuration file (GC_* environment variables otherwise)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    pub log: String,
}

impl Cli {
    /// Loads the heap configuration from `--config` or the environment.
    pub fn load_config(&self) -> CliResult<GcConfig> {
        match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| CliError::ConfigFile {
                    path: path.clone(),
                    source,
                })?;
                Ok(GcConfig::from_json(&text)?)
            }
            None => Ok(GcConfig::from_env()?),
        }
    }

    /// Workload shape selected on the command line.
    pub fn options(&self) -> WorkloadOptions {
        WorkloadOptions {
            threads: self.threads,
            rounds: self.rounds,
            ops: self.ops,
            slots: self.slots,
            seed: self.seed,
        }
    }
}
