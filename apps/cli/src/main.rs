//! bibsync CLI: keeps a BibTeX bibliography in sync with scraped
//! conference listings.
//!
//! Provisions the scraper's environment, runs the scraper, and merges its
//! output into the bibliography, logging each step to its own transcript.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    match commands::run(cli).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(report) => match commands::step_exit_code(&report) {
            // A failed step already explained itself in its transcript.
            Some(code) => {
                eprintln!("error: {report}");
                Ok(ExitCode::from(code))
            }
            None => Err(report),
        },
    }
}
