//! Build wrapper.
//!
//! One [`BuildWrapper`] exists per build identity. It loads the config once,
//! creates compilers, turns compiler stats into [`BuildOutput`]s and, in
//! watch mode, owns the long-lived [`CompilerWatcher`].
//!
//! Watch-mode callers that arrive while a result is being produced are
//! queued and all receive the same `Arc<BuildOutput>`, in arrival order.
//! One-shot builds compile independently for each caller.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{OnceCell, broadcast, oneshot};
use tracing::{debug, error, info};

use crate::cache::{InstalledVersions, PersistentCache};
use crate::compiler::CompilerFactory;
use crate::config::{BundlerConfig, load_config};
use crate::error::{Error, Result};
use crate::options::BuildOptions;
use crate::output::{BuildOutput, ConfigIdentity, generate_output};
use crate::watch::WatchOptions;
use crate::watcher::{CompilerWatcher, Completion, WatcherEvent};

/// Result delivered to build callers.
pub type BuildResult = Result<Arc<BuildOutput>, Error>;

const EVENT_CAPACITY: usize = 64;

struct WrapperState {
    pending: Vec<oneshot::Sender<BuildResult>>,
    watcher: Option<Arc<CompilerWatcher>>,
}

pub struct BuildWrapper {
    options: Arc<BuildOptions>,
    compilers: Arc<dyn CompilerFactory>,
    cache: Option<Arc<PersistentCache>>,
    versions: Arc<InstalledVersions>,
    config: OnceCell<Arc<BundlerConfig>>,
    events: broadcast::Sender<WatcherEvent>,
    state: Mutex<WrapperState>,
}

impl BuildWrapper {
    pub fn new(
        options: Arc<BuildOptions>,
        compilers: Arc<dyn CompilerFactory>,
        cache: Option<Arc<PersistentCache>>,
        versions: Arc<InstalledVersions>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            options,
            compilers,
            cache,
            versions,
            config: OnceCell::new(),
            events,
            state: Mutex::new(WrapperState {
                pending: Vec::new(),
                watcher: None,
            }),
        })
    }

    pub fn options(&self) -> &Arc<BuildOptions> {
        &self.options
    }

    pub fn build_hash(&self) -> &str {
        &self.options.build_hash
    }

    pub fn watcher(&self) -> Option<Arc<CompilerWatcher>> {
        self.state.lock().watcher.clone()
    }

    pub fn has_watcher(&self) -> bool {
        self.state.lock().watcher.is_some()
    }

    /// Subscribe to watcher events. Works before the watcher exists.
    pub fn subscribe(&self) -> broadcast::Receiver<WatcherEvent> {
        self.events.subscribe()
    }

    /// The loaded config. Loaded on first use and reused afterwards.
    pub async fn config(&self) -> Result<Arc<BundlerConfig>> {
        let config = self
            .config
            .get_or_try_init(|| async { load_config(&self.options).await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(config))
    }

    /// Wait for a build result.
    pub async fn once_done(self: &Arc<Self>) -> BuildResult {
        if self.options.watch {
            self.watched_once_done().await
        } else {
            self.compile().await
        }
    }

    /// Compile once and write the result through to the cache.
    pub async fn compile(&self) -> BuildResult {
        let config = self.config().await?;
        let compiler = self.compilers.create(&config, &self.options)?;

        debug!(build_hash = %self.build_hash(), "starting compile");
        let stats = Arc::new(compiler.run().await?);
        let result = self.finish(Completion {
            error: stats.errors.first().map(|m| Error::compile(m.clone())),
            stats: Some(stats),
        });

        if let (Ok(output), Some(cache)) = (&result, &self.cache) {
            cache.set(Some(output.as_ref().clone()), false)?;
        }
        result
    }

    /// Stop the watcher, if one is running.
    pub fn close(&self) {
        if let Some(watcher) = self.state.lock().watcher.take() {
            watcher.close();
        }
    }

    async fn watched_once_done(self: &Arc<Self>) -> BuildResult {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut state = self.state.lock();
            state.pending.push(tx);
            state.pending.len() == 1
        };

        if first {
            let wrapper = Arc::clone(self);
            tokio::spawn(async move { wrapper.drive_watcher().await });
        }

        rx.await
            .unwrap_or_else(|_| Err(Error::Aborted("build wrapper dropped".into())))
    }

    async fn drive_watcher(self: Arc<Self>) {
        let result = match self.ensure_watcher().await {
            Ok(watcher) => {
                let completion = watcher.once_done().await;
                self.finish(completion)
            }
            Err(e) => Err(e),
        };

        let pending = std::mem::take(&mut self.state.lock().pending);
        for tx in pending {
            let _ = tx.send(result.clone());
        }
    }

    async fn ensure_watcher(&self) -> Result<Arc<CompilerWatcher>> {
        if let Some(watcher) = self.watcher() {
            return Ok(watcher);
        }

        let config = self.config().await?;
        let compiler = self.compilers.create(&config, &self.options)?;
        let watcher = CompilerWatcher::new(
            compiler,
            WatchOptions::from(self.options.as_ref()),
            self.events.clone(),
        );

        if let Some(cache) = &self.cache {
            self.spawn_cache_writer(Arc::clone(cache));
        }

        info!(build_hash = %self.build_hash(), "watching for changes");
        let mut state = self.state.lock();
        Ok(Arc::clone(state.watcher.get_or_insert(watcher)))
    }

    /// Persist every successful watch result, delegating the cache to the
    /// watcher from then on.
    fn spawn_cache_writer(&self, cache: Arc<PersistentCache>) {
        let mut events = self.events.subscribe();
        let options = Arc::clone(&self.options);
        let versions = Arc::clone(&self.versions);

        tokio::spawn(async move {
            loop {
                let completion = match events.recv().await {
                    Ok(WatcherEvent::Done(completion)) => completion,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "cache writer lagged behind watcher");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let (None, Some(stats)) = (&completion.error, &completion.stats) else {
                    continue;
                };
                let written = generate_output(stats, &options, identity(&options), versions.as_map())
                    .map_err(|e| e.to_string())
                    .and_then(|output| cache.set(Some(output), true).map_err(|e| e.to_string()));
                if let Err(e) = written {
                    error!(cache_file = %cache.path().display(), "failed to persist build: {}", e);
                }
            }
        });
    }

    fn finish(&self, completion: Completion) -> BuildResult {
        let Completion { error, stats } = completion;

        let output = match stats {
            Some(stats) => Some(Arc::new(generate_output(
                &stats,
                &self.options,
                identity(&self.options),
                self.versions.as_map(),
            )?)),
            None => None,
        };

        match (error, output) {
            (Some(Error::Compile { message, .. }), output) => Err(Error::Compile { message, output }),
            (Some(error), _) => Err(error),
            (None, Some(output)) => Ok(output),
            (None, None) => Err(Error::Aborted("compiler finished without stats".into())),
        }
    }
}

impl Drop for BuildWrapper {
    fn drop(&mut self) {
        if let Some(watcher) = self.state.get_mut().watcher.take() {
            watcher.close();
        }
    }
}

fn identity(options: &BuildOptions) -> ConfigIdentity {
    options
        .config
        .as_ref()
        .map(|source| source.identity())
        .unwrap_or(ConfigIdentity::Inline)
}

/// Versions map for the toolchain plus this crate.
pub(crate) fn toolchain_versions(compilers: &dyn CompilerFactory) -> IndexMap<String, String> {
    let mut versions = compilers.versions();
    versions.insert(env!("CARGO_PKG_NAME").to_string(), env!("CARGO_PKG_VERSION").to_string());
    versions
}
