//! Error handling for the relay server.
//!
//! `CliError` covers everything that can stop the server or a worker process.
//! Errors that belong to a single build request never become a `CliError`:
//! they are serialized into the `{error, data}` response instead (see
//! [`crate::protocol::BuildData`]).
//!
//! ```rust,no_run
//! use relay_cli::error::{Result, ResultExt};
//! use std::path::Path;
//!
//! fn read_settings(path: &Path) -> Result<String> {
//!     std::fs::read_to_string(path).with_path(path)
//! }
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Top-level CLI error type.
#[derive(Debug, Error)]
pub enum CliError {
    /// Server configuration could not be assembled.
    #[error("Configuration error: {0}\n\nHint: Check relay.config.json and RELAY_* environment variables")]
    Config(String),

    /// Invalid command-line arguments or options
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// File or directory not found
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// I/O errors from file system or process operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP server failed to start or stopped unexpectedly.
    #[error("Server error: {0}")]
    Server(String),

    /// Worker transport failure.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors from relay-core
    #[error("Build error: {0}")]
    Core(#[from] relay_core::Error),

    /// Generic errors with custom messages
    #[error("{0}")]
    Custom(String),
}

/// Failure talking to a worker process.
///
/// Reported per in-flight request. A worker that dies is never restarted and
/// its requests are never retried elsewhere.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("No worker process is available")]
    NoWorkers,

    #[error("Worker {index} exited before answering")]
    Exited { index: usize },

    #[error("Could not send request to worker {index}: {message}")]
    Transport { index: usize, message: String },

    #[error("Worker {index} did not answer within {seconds}s")]
    Timeout { index: usize, seconds: u64 },

    #[error("Unexpected reply from worker {index}: {message}")]
    Protocol { index: usize, message: String },
}

impl WorkerError {
    /// Short machine-readable name, used in serialized error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::NoWorkers => "NoWorkersError",
            WorkerError::Exited { .. } => "WorkerExitedError",
            WorkerError::Transport { .. } => "WorkerTransportError",
            WorkerError::Timeout { .. } => "WorkerTimeoutError",
            WorkerError::Protocol { .. } => "WorkerProtocolError",
        }
    }
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        CliError::Config(err.to_string())
    }
}

/// Result type alias using `CliError` as the default error type.
pub type Result<T, E = CliError> = std::result::Result<T, E>;

/// Extension trait for adding context to `Result` types.
pub trait ResultExt<T> {
    /// Add a file path to the error context.
    ///
    /// A `NotFound` I/O error becomes [`CliError::FileNotFound`].
    fn with_path(self, path: impl AsRef<std::path::Path>) -> Result<T>;

    /// Add a helpful hint to the error context.
    fn with_hint(self, hint: impl std::fmt::Display) -> Result<T>;

    /// Prefix the error with a custom message.
    fn context(self, message: impl std::fmt::Display) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<CliError>,
{
    fn with_path(self, path: impl AsRef<std::path::Path>) -> Result<T> {
        self.map_err(|e| {
            let path = path.as_ref();
            match e.into() {
                CliError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    CliError::FileNotFound(path.to_path_buf())
                }
                other => CliError::Custom(format!("{}: {}", path.display(), other)),
            }
        })
    }

    fn with_hint(self, hint: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| CliError::Custom(format!("{}\n\nHint: {}", e.into(), hint)))
    }

    fn context(self, message: impl std::fmt::Display) -> Result<T> {
        self.map_err(|e| CliError::Custom(format!("{}: {}", message, e.into())))
    }
}

/// Convert a CliError to a miette report for top-level reporting.
pub fn cli_error_to_miette(err: CliError) -> miette::Report {
    match err {
        CliError::Config(message) => miette::miette!("Configuration error: {}", message),
        CliError::Core(e) => miette::miette!("Build failed ({}): {}", e.kind(), e),
        CliError::Worker(e) => {
            miette::miette!("{}\n\nHint: Run with --workers 0 to build in-process", e)
        }
        other => miette::miette!("{}", other),
    }
}
