use std::process::ExitCode;

use clap::Parser;
use majsoul_ranks_cli::{init_logging, run_analyze, AnalyzeCli};

fn main() -> ExitCode {
    let cli = AnalyzeCli::parse();
    init_logging(cli.verbose);
    match run_analyze(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
