//! Persistent build cache.
//!
//! Each build identity owns a JSON cache file holding its last successful
//! [`BuildOutput`]. The file is read lazily on first access and validated on
//! every [`PersistentCache::get`]. Writes go straight to disk.
//!
//! Once a watcher takes over a build, the cache is *delegated*: it keeps
//! persisting results, but reads return nothing so callers always ask the
//! live watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CacheError;
use crate::output::{BuildOutput, ConfigIdentity, unix_millis};

/// Package versions installed alongside the compiler.
#[derive(Debug, Clone, Default)]
pub struct InstalledVersions {
    versions: IndexMap<String, String>,
}

impl InstalledVersions {
    pub fn new(versions: IndexMap<String, String>) -> Self {
        Self { versions }
    }

    /// Installed version of `name`.
    pub fn resolve(&self, name: &str) -> Result<&str, CacheError> {
        self.versions
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| CacheError::UnresolvedDependency(name.to_string()))
    }

    pub fn as_map(&self) -> &IndexMap<String, String> {
        &self.versions
    }
}

#[derive(Default)]
struct CacheState {
    loaded: bool,
    entry: Option<BuildOutput>,
}

/// Cache file for one build identity.
pub struct PersistentCache {
    path: PathBuf,
    installed: Arc<InstalledVersions>,
    state: Mutex<CacheState>,
    delegated: AtomicBool,
}

impl PersistentCache {
    pub fn new(path: impl Into<PathBuf>, installed: Arc<InstalledVersions>) -> Self {
        Self {
            path: path.into(),
            installed,
            state: Mutex::new(CacheState::default()),
            delegated: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a watcher owns this build. Never resets.
    pub fn is_delegated(&self) -> bool {
        self.delegated.load(Ordering::SeqCst)
    }

    /// Return the cached entry if it is still valid.
    ///
    /// `Ok(None)` means there is nothing usable: no entry, an unparsable
    /// entry, a dependency version mismatch, or a delegated cache. `Err`
    /// means the entry exists but is stale.
    pub async fn get(&self) -> Result<Option<BuildOutput>, CacheError> {
        if self.is_delegated() {
            return Ok(None);
        }

        let Some(entry) = self.load().await else {
            return Ok(None);
        };

        for (name, required) in &entry.dependencies {
            let installed = self.installed.resolve(name)?;
            if installed != required {
                debug!(
                    dependency = %name,
                    cached = %required,
                    installed,
                    "cached build used a different version"
                );
                return Ok(None);
            }
        }

        if let ConfigIdentity::File { path } = &entry.config {
            if modified_millis(path).await? > entry.start_time {
                return Err(CacheError::StaleConfig(path.clone()));
            }
        }

        for dependency in &entry.file_dependencies {
            if modified_millis(dependency).await? > entry.start_time {
                return Err(CacheError::StaleDependency(dependency.clone()));
            }
        }

        for asset in &entry.assets {
            tokio::fs::metadata(asset)
                .await
                .map_err(|e| CacheError::MissingAsset {
                    path: asset.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(Some(entry))
    }

    /// Replace the stored entry and write it to disk.
    ///
    /// `None` clears the cache file. `delegate` latches the delegated flag.
    pub fn set(&self, entry: Option<BuildOutput>, delegate: bool) -> Result<(), CacheError> {
        let contents = match &entry {
            Some(entry) => serde_json::to_string_pretty(entry)?,
            None => "{}".to_string(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        std::fs::write(&self.path, contents).map_err(|e| self.io_error(e))?;

        {
            let mut state = self.state.lock();
            state.loaded = true;
            state.entry = entry;
        }
        if delegate {
            self.delegated.store(true, Ordering::SeqCst);
        }
        debug!(cache_file = %self.path.display(), delegate, "cache written");
        Ok(())
    }

    async fn load(&self) -> Option<BuildOutput> {
        {
            let state = self.state.lock();
            if state.loaded {
                return state.entry.clone();
            }
        }

        let entry = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<BuildOutput>(&contents) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(cache_file = %self.path.display(), "ignoring unusable cache entry: {}", e);
                    None
                }
            },
            Err(e) => {
                debug!(cache_file = %self.path.display(), "no cache entry: {}", e);
                None
            }
        };

        let mut state = self.state.lock();
        if !state.loaded {
            state.loaded = true;
            state.entry = entry;
        }
        state.entry.clone()
    }

    fn io_error(&self, err: std::io::Error) -> CacheError {
        CacheError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

async fn modified_millis(path: &Path) -> Result<u64, CacheError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let modified = metadata.modified().map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(unix_millis(modified))
}

/// Process-wide map from cache file path to its single cache instance.
#[derive(Default)]
pub struct CacheRegistry {
    caches: DashMap<PathBuf, Arc<PersistentCache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path, installed: &Arc<InstalledVersions>) -> Arc<PersistentCache> {
        self.caches
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(PersistentCache::new(path, Arc::clone(installed))))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    pub fn clear(&self) {
        self.caches.clear();
    }
}
