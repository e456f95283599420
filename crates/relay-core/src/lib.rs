//! # relay-core
//!
//! Caching, watch-mode build orchestration in front of a bundler.
//!
//! A build request ([`RawOptions`]) is resolved into a build identity. Every
//! request with the same identity shares one [`BuildWrapper`], which loads
//! the bundler config once and, in watch mode, keeps a single
//! [`CompilerWatcher`] alive. Successful builds are persisted to a JSON cache
//! file so a restarted process can answer immediately, as long as none of
//! the build's inputs changed since.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use relay_core::{BuildContext, ConfigSource, RawOptions};
//!
//! # async fn run() -> relay_core::Result<()> {
//! let context = BuildContext::with_rolldown();
//!
//! let output = context
//!     .build(RawOptions {
//!         config: Some(ConfigSource::path("relay.config.json")),
//!         watch: Some(true),
//!         ..Default::default()
//!     })
//!     .result()
//!     .await?;
//!
//! for (chunk, files) in &output.output {
//!     println!("{chunk}: {:?}", files.js);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`options`]: request normalization and build identity
//! - [`config`]: bundler config model and loader
//! - [`compiler`], [`watch`]: compiler contract and the generic watch loop
//! - [`watcher`]: watch state machine with coalesced waiters
//! - [`wrapper`]: per-identity build wrapper
//! - [`cache`]: persistent cache and installed versions
//! - [`context`]: wrapper registry and the build orchestrator
//! - [`bundler`]: the Rolldown compiler

pub mod bundler;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod options;
pub mod output;
pub mod watch;
pub mod watcher;
pub mod wrapper;

pub use bundler::{ROLLDOWN_VERSION, RolldownCompiler, RolldownCompilerFactory};
pub use cache::{CacheRegistry, InstalledVersions, PersistentCache};
pub use compiler::{Compiler, CompilerFactory, Stats};
pub use config::{
    BundlerConfig, ConfigSource, Entry, EntryImports, OutputConfig, OutputFormat, Platform,
    load_config,
};
pub use context::{
    BuildContext, BuildOutcome, ContextStatus, PendingBuild, Served, WrapperRegistry,
};
pub use error::{CacheError, ConfigError, Error, Result};
pub use options::{BuildOptions, RawOptions, resolve};
pub use output::{BuildOutput, ChunkFiles, ConfigIdentity};
pub use watch::{CompilerSignal, WatchCommand, WatchControl, WatchOptions, WatchSession};
pub use watcher::{CompilerWatcher, Completion, WatcherEvent, WatcherPhase};
pub use wrapper::{BuildResult, BuildWrapper};
