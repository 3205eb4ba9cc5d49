use std::process::ExitCode;

use clap::Parser;
use majsoul_ranks_cli::{init_logging, run_fetch, FetchCli};

fn main() -> ExitCode {
    let cli = FetchCli::parse();
    init_logging(cli.verbose);
    match run_fetch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
