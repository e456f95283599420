//! Compiler contract.
//!
//! A [`Compiler`] runs one bundler configuration. It can run once, or start a
//! watch session that recompiles whenever a file dependency changes. The
//! [`CompilerFactory`] builds compilers from loaded configs and reports the
//! toolchain versions that the persistent cache validates against.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::BundlerConfig;
use crate::error::Result;
use crate::options::BuildOptions;
use crate::watch::{WatchOptions, WatchSession};

/// Result of one compilation.
///
/// A compile that reports errors still produces stats; `errors` is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Content hash of the emitted code.
    pub hash: String,
    pub start_time: u64,
    pub end_time: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Directory the emitted files were written to.
    pub output_path: PathBuf,
    pub public_path: String,
    /// Chunk name to emitted file names, relative to `output_path`.
    pub chunks: IndexMap<String, Vec<String>>,
    /// Every emitted file name, relative to `output_path`.
    pub assets: Vec<String>,
    /// Absolute paths of the source files the build read.
    pub file_dependencies: Vec<PathBuf>,
}

impl Stats {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A compiler for one loaded config.
#[async_trait]
pub trait Compiler: Send + Sync + 'static {
    /// Compile once.
    ///
    /// Compilation problems are reported through [`Stats::errors`]. An `Err`
    /// means the compiler itself could not run.
    async fn run(&self) -> Result<Stats>;

    /// Start watching.
    ///
    /// The session's signal stream yields `Done` after every compile,
    /// `Invalid` when a change has been detected and a rebuild is coming, and
    /// `Failed` when watching cannot continue. Most implementations delegate
    /// to [`crate::watch::spawn_watch_loop`].
    fn watch(self: Arc<Self>, options: WatchOptions) -> WatchSession;
}

/// Creates a fresh compiler for each config.
pub trait CompilerFactory: Send + Sync + 'static {
    fn create(&self, config: &BundlerConfig, options: &BuildOptions) -> Result<Arc<dyn Compiler>>;

    /// Installed toolchain packages and their versions.
    fn versions(&self) -> IndexMap<String, String>;
}
