//! Command-line interface definition.
//!
//! `relay` with no subcommand starts the build server. The hidden `worker`
//! subcommand is what the server spawns for each worker process.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Relay - cached, watch-mode build server
#[derive(Parser, Debug)]
#[command(
    name = "relay",
    version,
    disable_version_flag = true,
    about = "Cached, watch-mode build server",
    long_about = "Relay answers build requests over HTTP.\n\
                  Identical requests share one build, watched builds stay warm between requests,\n\
                  and finished builds are cached on disk so a restarted server can answer at once."
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Address to bind to
    #[arg(short, long, global = true)]
    pub address: Option<String>,

    /// Number of worker processes (0 builds in-process)
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Server configuration file (defaults to ./relay.config.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    pub version: Option<bool>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run as a worker process, reading requests from stdin
    #[command(hide = true)]
    Worker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["relay"]).unwrap();

        assert_eq!(cli.port, None);
        assert_eq!(cli.address, None);
        assert_eq!(cli.workers, None);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_short_flags() {
        let cli =
            Cli::try_parse_from(["relay", "-p", "9000", "-a", "0.0.0.0", "-w", "4", "-q"]).unwrap();

        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.address.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.workers, Some(4));
        assert!(cli.quiet);
    }

    #[test]
    fn test_worker_subcommand() {
        let cli = Cli::try_parse_from(["relay", "worker", "--verbose"]).unwrap();

        assert_eq!(cli.command, Some(Command::Worker));
        assert!(cli.verbose);
    }

    #[test]
    fn test_short_v_is_version() {
        let err = Cli::try_parse_from(["relay", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["relay", "--verbose", "--quiet"]).is_err());
    }

    #[test]
    fn test_invalid_port() {
        assert!(Cli::try_parse_from(["relay", "--port", "not-a-port"]).is_err());
    }
}
