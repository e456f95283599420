//! Relay command-line entry point.

use clap::Parser;
use miette::Result;
use relay_cli::{ServerConfig, cli, error, logger, server, ui, worker};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    logger::init_logger(args.verbose, args.quiet, args.no_color);
    ui::init_colors(args.no_color);

    let result = match args.command {
        Some(cli::Command::Worker) => worker::run_worker().await,
        None => match ServerConfig::load(&args) {
            Ok(config) => server::serve(config, worker_flags(&args)).await,
            Err(e) => Err(e),
        },
    };

    result.map_err(error::cli_error_to_miette)
}

/// Logging flags a worker process inherits from the server.
fn worker_flags(args: &cli::Cli) -> Vec<String> {
    let mut flags = Vec::new();
    if args.verbose {
        flags.push("--verbose".to_string());
    }
    if args.quiet {
        flags.push("--quiet".to_string());
    }
    if args.no_color {
        flags.push("--no-color".to_string());
    }
    flags
}
