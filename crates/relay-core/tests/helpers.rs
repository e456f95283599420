//! Shared test utilities for relay-core integration tests.
//!
//! Provides a stub compiler factory that counts how often compilers are
//! created and run, so tests can assert on coalescing and cache hits without
//! invoking a real bundler.

#![allow(dead_code)]

use async_trait::async_trait;
use indexmap::IndexMap;
use relay_core::watch::spawn_watch_loop;
use relay_core::{
    BuildOptions, BundlerConfig, Compiler, CompilerFactory, ConfigSource, Entry, Result, Stats,
    WatchOptions, WatchSession,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Counters shared between a [`StubFactory`] and its compilers.
#[derive(Debug, Default)]
pub struct Counters {
    pub creates: AtomicUsize,
    pub runs: AtomicUsize,
}

impl Counters {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

/// Factory producing [`StubCompiler`]s.
pub struct StubFactory {
    pub counters: Arc<Counters>,
    pub delay: Duration,
    pub errors: Vec<String>,
}

impl StubFactory {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            delay: Duration::from_millis(50),
            errors: Vec::new(),
        }
    }

    pub fn failing(errors: &[&str]) -> Self {
        Self {
            errors: errors.iter().map(|e| e.to_string()).collect(),
            ..Self::new()
        }
    }
}

impl CompilerFactory for StubFactory {
    fn create(&self, _config: &BundlerConfig, _options: &BuildOptions) -> Result<Arc<dyn Compiler>> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubCompiler {
            counters: Arc::clone(&self.counters),
            delay: self.delay,
            errors: self.errors.clone(),
        }))
    }

    fn versions(&self) -> IndexMap<String, String> {
        let mut versions = IndexMap::new();
        versions.insert("stub-bundler".to_string(), "1.0.0".to_string());
        versions
    }
}

/// Compiler that emits nothing and reports a numbered hash per run.
pub struct StubCompiler {
    counters: Arc<Counters>,
    delay: Duration,
    errors: Vec<String>,
}

#[async_trait]
impl Compiler for StubCompiler {
    async fn run(&self) -> Result<Stats> {
        let start_time = now_millis();
        tokio::time::sleep(self.delay).await;
        let run = self.counters.runs.fetch_add(1, Ordering::SeqCst) + 1;

        let mut chunks = IndexMap::new();
        chunks.insert("main".to_string(), vec![format!("main-{run}.js")]);

        Ok(Stats {
            hash: format!("run-{run}"),
            start_time,
            end_time: now_millis(),
            errors: self.errors.clone(),
            output_path: PathBuf::from("/virtual/dist"),
            chunks,
            ..Default::default()
        })
    }

    fn watch(self: Arc<Self>, options: WatchOptions) -> WatchSession {
        spawn_watch_loop(self, options)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Inline config with one entry.
pub fn inline_config() -> ConfigSource {
    ConfigSource::inline(BundlerConfig {
        entry: Entry::Single("./index.js".into()),
        ..Default::default()
    })
}

/// Write a minimal project: an entry file exporting `value` and a JSON
/// config pointing at it. Returns the config path.
pub fn write_project(root: &Path, value: &str) -> PathBuf {
    std::fs::write(root.join("index.js"), format!("module.exports = \"{value}\";\n")).unwrap();
    let config = root.join("relay.config.json");
    std::fs::write(
        &config,
        r#"{"entry": {"main": "./index.js"}, "output": {"path": "dist"}}"#,
    )
    .unwrap();
    config
}

/// Concatenated contents of every emitted `.js` file.
pub fn emitted_js(assets: &[PathBuf]) -> String {
    assets
        .iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == "js"))
        .map(|path| std::fs::read_to_string(path).unwrap())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
