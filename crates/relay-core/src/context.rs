//! Build orchestration.
//!
//! [`BuildContext`] is the entry point for build requests. It resolves the
//! request, finds (or creates) the [`BuildWrapper`] for the build identity,
//! consults the persistent cache, and falls back to the wrapper when the
//! cache has nothing valid.
//!
//! ```rust,no_run
//! use relay_core::{BuildContext, ConfigSource, RawOptions};
//!
//! # async fn run() -> relay_core::Result<()> {
//! let context = BuildContext::with_rolldown();
//! let output = context
//!     .build(RawOptions {
//!         config: Some(ConfigSource::path("relay.config.json")),
//!         ..Default::default()
//!     })
//!     .result()
//!     .await?;
//! println!("{} assets", output.assets.len());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bundler::RolldownCompilerFactory;
use crate::cache::{CacheRegistry, InstalledVersions, PersistentCache};
use crate::compiler::CompilerFactory;
use crate::error::Error;
use crate::options::{BuildOptions, RawOptions, resolve};
use crate::wrapper::{BuildResult, BuildWrapper, toolchain_versions};

/// Map from build hash to the wrapper serving that identity.
#[derive(Default)]
pub struct WrapperRegistry {
    wrappers: DashMap<String, Arc<BuildWrapper>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrapper for `options.build_hash`, created with `create` on first use.
    pub fn get_or_create(
        &self,
        options: &Arc<BuildOptions>,
        create: impl FnOnce() -> Arc<BuildWrapper>,
    ) -> Arc<BuildWrapper> {
        self.wrappers
            .entry(options.build_hash.clone())
            .or_insert_with(create)
            .clone()
    }

    pub fn get(&self, build_hash: &str) -> Option<Arc<BuildWrapper>> {
        self.wrappers.get(build_hash).map(|w| Arc::clone(&w))
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// Drop every wrapper, closing their watchers.
    pub fn clear(&self) {
        for entry in self.wrappers.iter() {
            entry.value().close();
        }
        self.wrappers.clear();
    }

    fn watching(&self) -> usize {
        self.wrappers.iter().filter(|w| w.has_watcher()).count()
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Served {
    Cache,
    Build,
}

/// Result of a build request plus its origin.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub result: BuildResult,
    pub served: Served,
}

/// A build request in flight.
pub struct PendingBuild {
    wrapper: Arc<BuildWrapper>,
    rx: oneshot::Receiver<BuildOutcome>,
}

impl PendingBuild {
    /// The wrapper serving this request. Subscribe to it for watch events.
    pub fn wrapper(&self) -> &Arc<BuildWrapper> {
        &self.wrapper
    }

    pub async fn outcome(self) -> BuildOutcome {
        self.rx.await.unwrap_or_else(|_| BuildOutcome {
            result: Err(Error::Aborted("build task stopped".into())),
            served: Served::Build,
        })
    }

    pub async fn result(self) -> BuildResult {
        self.outcome().await.result
    }
}

/// Snapshot of a context's activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStatus {
    pub wrappers: usize,
    pub watching: usize,
    pub caches: usize,
    pub builds: u64,
    pub cache_hits: u64,
}

struct ContextInner {
    wrappers: WrapperRegistry,
    caches: CacheRegistry,
    compilers: Arc<dyn CompilerFactory>,
    versions: Arc<InstalledVersions>,
    builds: AtomicU64,
    cache_hits: AtomicU64,
}

/// Cheaply cloneable handle to the orchestrator state.
#[derive(Clone)]
pub struct BuildContext {
    inner: Arc<ContextInner>,
}

impl BuildContext {
    pub fn new(compilers: Arc<dyn CompilerFactory>) -> Self {
        let versions = Arc::new(InstalledVersions::new(toolchain_versions(compilers.as_ref())));
        Self {
            inner: Arc::new(ContextInner {
                wrappers: WrapperRegistry::new(),
                caches: CacheRegistry::new(),
                compilers,
                versions,
                builds: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
            }),
        }
    }

    /// Context backed by the Rolldown compiler.
    pub fn with_rolldown() -> Self {
        Self::new(Arc::new(RolldownCompilerFactory))
    }

    pub fn versions(&self) -> &Arc<InstalledVersions> {
        &self.inner.versions
    }

    /// Start a build request. Must be called inside a tokio runtime.
    pub fn build(&self, raw: RawOptions) -> PendingBuild {
        self.build_resolved(resolve(raw))
    }

    /// Start a build from already resolved options.
    pub fn build_resolved(&self, options: BuildOptions) -> PendingBuild {
        let options = Arc::new(options);
        let wrapper = self.wrapper(&options);
        let (tx, rx) = oneshot::channel();

        let inner = Arc::clone(&self.inner);
        let task_wrapper = Arc::clone(&wrapper);
        tokio::spawn(async move {
            let outcome = orchestrate(&inner, &options, task_wrapper).await;
            let _ = tx.send(outcome);
        });

        PendingBuild { wrapper, rx }
    }

    /// The wrapper for a build identity.
    pub fn wrapper(&self, options: &Arc<BuildOptions>) -> Arc<BuildWrapper> {
        let inner = &self.inner;
        inner.wrappers.get_or_create(options, || {
            let cache = options
                .cache
                .then(|| inner.caches.get(&options.cache_file, &inner.versions));
            BuildWrapper::new(
                Arc::clone(options),
                Arc::clone(&inner.compilers),
                cache,
                Arc::clone(&inner.versions),
            )
        })
    }

    pub fn cache(&self, path: &Path) -> Arc<PersistentCache> {
        self.inner.caches.get(path, &self.inner.versions)
    }

    pub fn status(&self) -> ContextStatus {
        ContextStatus {
            wrappers: self.inner.wrappers.len(),
            watching: self.inner.wrappers.watching(),
            caches: self.inner.caches.len(),
            builds: self.inner.builds.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Forget all wrappers and caches. Running watchers are closed.
    pub fn reset(&self) {
        self.inner.wrappers.clear();
        self.inner.caches.clear();
    }
}

async fn orchestrate(
    inner: &ContextInner,
    options: &BuildOptions,
    wrapper: Arc<BuildWrapper>,
) -> BuildOutcome {
    if options.cache {
        let cache = inner.caches.get(&options.cache_file, &inner.versions);
        if !cache.is_delegated() {
            match cache.get().await {
                Ok(Some(entry)) if entry.build_hash == options.build_hash => {
                    if options.watch && !wrapper.has_watcher() {
                        warm_watcher(Arc::clone(&wrapper));
                    }
                    inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                    info!(build_hash = %options.build_hash, "serving build from cache");
                    return BuildOutcome {
                        result: Ok(Arc::new(entry)),
                        served: Served::Cache,
                    };
                }
                Ok(Some(entry)) => {
                    warn!(
                        cached = %entry.build_hash,
                        requested = %options.build_hash,
                        "cache entry belongs to another build, clearing it"
                    );
                    if let Err(e) = cache.set(None, false) {
                        return BuildOutcome {
                            result: Err(e.into()),
                            served: Served::Build,
                        };
                    }
                }
                Ok(None) => debug!(build_hash = %options.build_hash, "cache miss"),
                Err(e) => info!(build_hash = %options.build_hash, "cached build rejected: {}", e),
            }
        }
    }

    inner.builds.fetch_add(1, Ordering::Relaxed);
    BuildOutcome {
        result: wrapper.once_done().await,
        served: Served::Build,
    }
}

/// Start the watcher in the background so later requests hit a live build.
fn warm_watcher(wrapper: Arc<BuildWrapper>) {
    tokio::spawn(async move {
        if let Err(e) = wrapper.once_done().await {
            debug!(build_hash = %wrapper.build_hash(), "background watch build failed: {}", e);
        }
    });
}
