//! Error types for relay-core.
//!
//! Build results are shared between every caller that waited on the same
//! compilation, so [`Error`] is `Clone`. Foreign errors that are not `Clone`
//! (`std::io::Error`, `serde_json::Error`) are wrapped in an `Arc`.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::output::BuildOutput;

/// Result type alias for relay-core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for a build request.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The bundler config could not be loaded or transformed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The compiler ran but reported errors.
    ///
    /// `output` carries the generated output when stats were available, so
    /// callers can still inspect which files were emitted.
    #[error("{message}")]
    Compile {
        message: String,
        output: Option<Arc<BuildOutput>>,
    },

    /// The compiler's watch loop failed fatally.
    #[error("Watcher failed: {0}")]
    WatcherFailed(String),

    /// The watcher was closed while callers were still waiting on it.
    #[error("Watcher closed before the build completed")]
    WatcherClosed,

    /// Persistent cache failure that aborted the request.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// The task driving a build went away before reporting a result.
    #[error("Build aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// Short machine-readable name, used for the `type` field of serialized
    /// error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::Compile { .. } => "CompileError",
            Error::WatcherFailed(_) => "WatcherError",
            Error::WatcherClosed => "WatcherClosed",
            Error::Cache(_) => "CacheError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Aborted(_) => "AbortedError",
        }
    }

    /// Output generated alongside a compile error, if any.
    pub fn output(&self) -> Option<&Arc<BuildOutput>> {
        match self {
            Error::Compile { output, .. } => output.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn compile(message: impl Into<String>) -> Self {
        Error::Compile {
            message: message.into(),
            output: None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(Arc::new(err))
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::WatcherFailed(err.to_string())
    }
}

/// Errors raised while loading and transforming a bundler config.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No config source was supplied with the build request.
    #[error("No config source given.\n\nHint: pass `config` as a file path or an inline object")]
    Missing,

    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read config file {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    /// Only `.json` and `.toml` config files can be loaded from disk.
    #[error("Unsupported config format: {}\n\nHint: use a .json or .toml config file", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Config file {} does not export an object", .0.display())]
    NotAnObject(PathBuf),

    #[error("Invalid config from {origin}: {message}")]
    Invalid { origin: String, message: String },

    #[error("Config factory failed: {0}")]
    Factory(String),

    #[error("Environment hook '{env}' failed: {message}")]
    EnvHook { env: String, message: String },

    /// Hot module replacement was requested without a required option.
    #[error("Hot module replacement requires `{0}` to be set")]
    MissingHmrField(&'static str),

    #[error("Config from {0} has no entry points")]
    NoEntries(String),

    #[error("Unknown bundler plugin '{0}'\n\nHint: the available plugins are: hot-module-replacement")]
    UnknownPlugin(String),
}

/// Errors raised by the persistent cache.
///
/// The staleness variants are expected outcomes of a cache read; the
/// orchestrator logs them and falls through to a fresh build.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Stale config file: {} changed after the cached build started", .0.display())]
    StaleConfig(PathBuf),

    #[error("Stale file dependency: {} changed after the cached build started", .0.display())]
    StaleDependency(PathBuf),

    #[error("Cached asset {} is unavailable: {message}", path.display())]
    MissingAsset { path: PathBuf, message: String },

    #[error("Dependency '{0}' is not installed")]
    UnresolvedDependency(String),

    #[error("Cache I/O error at {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("Cache serialization error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json(err.to_string())
    }
}
