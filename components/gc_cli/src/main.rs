//! gc-stress
//!
//! Parses CLI arguments, builds the heap and runs the workload.

use clap::Parser;
use gc_cli::logging::init_logging;
use gc_cli::{Cli, CliResult, Workload};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "gc-stress failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> CliResult<()> {
    let config = cli.load_config()?;
    let workload = Workload::new(config, cli.options())?;
    let report = workload.run()?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}
