//! Logging setup for the relay binary.
//!
//! Library crates only emit `tracing` events. This module installs the
//! subscriber. Everything is written to stderr, because a worker process
//! uses stdout for its message stream.
//!
//! The filter is chosen in this order:
//! 1. `--verbose`: debug for relay crates
//! 2. `--quiet`: errors only
//! 3. `RUST_LOG`
//! 4. info for relay crates

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const VERBOSE_FILTER: &str = "relay=debug,relay_core=debug,relay_cli=debug";
const QUIET_FILTER: &str = "relay=error,relay_core=error,relay_cli=error";
const DEFAULT_FILTER: &str = "relay=info,relay_core=info,relay_cli=info";

/// Initialize the tracing subscriber. Call once, before any logging.
pub fn init_logger(verbose: bool, quiet: bool, no_color: bool) {
    init_logger_with_filter(build_filter(verbose, quiet), no_color);
}

/// Initialize logger with a custom environment filter.
pub fn init_logger_with_filter(filter: EnvFilter, no_color: bool) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .with_ansi(!no_color)
        .compact();

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn build_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}
