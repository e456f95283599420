//! Build wrapper tests.
//!
//! These tests verify how the wrapper shares work between callers:
//! - watch-mode callers coalesce onto one compile and one result, answered
//!   in the order they arrived
//! - one-shot builds compile independently per caller
//! - the config is loaded once per wrapper
//! - watch results are persisted to a delegated cache

mod helpers;

use helpers::{StubFactory, inline_config};
use relay_core::{
    BuildOptions, BuildWrapper, BundlerConfig, ConfigSource, Entry, Error, InstalledVersions,
    PersistentCache, RawOptions, resolve,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn options(watch: bool, config: ConfigSource) -> Arc<BuildOptions> {
    Arc::new(resolve(RawOptions {
        config: Some(config),
        watch: Some(watch),
        aggregate_timeout: Some(20),
        ..Default::default()
    }))
}

fn wrapper(
    options: Arc<BuildOptions>,
    factory: Arc<StubFactory>,
    cache: Option<Arc<PersistentCache>>,
) -> Arc<BuildWrapper> {
    BuildWrapper::new(options, factory, cache, Arc::new(InstalledVersions::default()))
}

#[tokio::test]
async fn test_watch_callers_share_one_result() {
    let factory = Arc::new(StubFactory::new());
    let wrapper = wrapper(options(true, inline_config()), Arc::clone(&factory), None);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move { wrapper.once_done().await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert!(Arc::ptr_eq(&results[0], &results[1]));
    assert!(Arc::ptr_eq(&results[1], &results[2]));
    assert_eq!(factory.counters.creates(), 1);
    assert_eq!(factory.counters.runs(), 1);
    assert!(wrapper.has_watcher());
    wrapper.close();
}

#[tokio::test]
async fn test_watch_callers_are_answered_in_arrival_order() {
    let factory = Arc::new(StubFactory::new());
    let wrapper = wrapper(options(true, inline_config()), Arc::clone(&factory), None);
    let answered = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for caller in 0..3 {
        let wrapper = Arc::clone(&wrapper);
        let answered = Arc::clone(&answered);
        handles.push(tokio::spawn(async move {
            let result = wrapper.once_done().await;
            answered.lock().push(caller);
            result
        }));
        // Each caller is queued before the next one starts.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(*answered.lock(), vec![0, 1, 2]);
    assert_eq!(factory.counters.runs(), 1);
    wrapper.close();
}

#[tokio::test]
async fn test_watch_reuses_ready_result() {
    let factory = Arc::new(StubFactory::new());
    let wrapper = wrapper(options(true, inline_config()), Arc::clone(&factory), None);

    let first = wrapper.once_done().await.unwrap();
    let second = wrapper.once_done().await.unwrap();

    assert_eq!(first.stats["hash"], second.stats["hash"]);
    assert_eq!(factory.counters.runs(), 1);
    wrapper.close();
}

#[tokio::test]
async fn test_invalidate_produces_new_result() {
    let factory = Arc::new(StubFactory::new());
    let wrapper = wrapper(options(true, inline_config()), Arc::clone(&factory), None);

    let first = wrapper.once_done().await.unwrap();
    wrapper.watcher().unwrap().invalidate();
    let second = wrapper.once_done().await.unwrap();

    assert_eq!(first.stats["hash"], "run-1");
    assert_eq!(second.stats["hash"], "run-2");
    wrapper.close();
}

#[tokio::test]
async fn test_one_shot_builds_do_not_share_results() {
    let factory = Arc::new(StubFactory::new());
    let wrapper = wrapper(options(false, inline_config()), Arc::clone(&factory), None);

    let (a, b) = tokio::join!(wrapper.once_done(), wrapper.once_done());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(factory.counters.runs(), 2);
    assert!(!wrapper.has_watcher());
}

#[tokio::test]
async fn test_config_is_loaded_once() {
    let loads = Arc::new(AtomicUsize::new(0));
    let source = {
        let loads = Arc::clone(&loads);
        ConfigSource::factory(move |_| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(BundlerConfig {
                entry: Entry::Single("./index.js".into()),
                ..Default::default()
            })
        })
    };
    let factory = Arc::new(StubFactory::new());
    let wrapper = wrapper(options(false, source), factory, None);

    wrapper.once_done().await.unwrap();
    wrapper.once_done().await.unwrap();

    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_config_errors_reach_every_watch_caller() {
    let factory = Arc::new(StubFactory::new());
    let wrapper = wrapper(
        options(true, ConfigSource::inline(BundlerConfig::default())),
        Arc::clone(&factory),
        None,
    );

    let (a, b) = tokio::join!(wrapper.once_done(), wrapper.once_done());

    assert!(matches!(a, Err(Error::Config(_))));
    assert!(matches!(b, Err(Error::Config(_))));
    assert_eq!(factory.counters.creates(), 0);
}

#[tokio::test]
async fn test_compile_errors_carry_output_and_skip_cache() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(PersistentCache::new(
        temp.path().join("build.json"),
        Arc::new(InstalledVersions::default()),
    ));
    let factory = Arc::new(StubFactory::failing(&["Unexpected token (1:4)"]));
    let wrapper = wrapper(options(false, inline_config()), factory, Some(Arc::clone(&cache)));

    let err = wrapper.once_done().await.unwrap_err();

    match err {
        Error::Compile { message, output } => {
            assert_eq!(message, "Unexpected token (1:4)");
            assert!(output.is_some());
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    assert!(!temp.path().join("build.json").exists());
}

#[tokio::test]
async fn test_one_shot_build_writes_cache() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(PersistentCache::new(
        temp.path().join("build.json"),
        Arc::new(InstalledVersions::default()),
    ));
    let wrapper = wrapper(
        options(false, inline_config()),
        Arc::new(StubFactory::new()),
        Some(Arc::clone(&cache)),
    );

    let output = wrapper.once_done().await.unwrap();

    assert!(!cache.is_delegated());
    let on_disk: relay_core::BuildOutput =
        serde_json::from_str(&std::fs::read_to_string(cache.path()).unwrap()).unwrap();
    assert_eq!(on_disk, *output);
}

#[tokio::test]
async fn test_watch_results_delegate_the_cache() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(PersistentCache::new(
        temp.path().join("build.json"),
        Arc::new(InstalledVersions::default()),
    ));
    let wrapper = wrapper(
        options(true, inline_config()),
        Arc::new(StubFactory::new()),
        Some(Arc::clone(&cache)),
    );

    wrapper.once_done().await.unwrap();

    let delegated = helpers::eventually(Duration::from_secs(5), || {
        let cache = Arc::clone(&cache);
        async move { cache.is_delegated() }
    })
    .await;
    assert!(delegated, "watch result was never persisted");
    assert!(cache.get().await.unwrap().is_none());
    assert!(cache.path().exists());
    wrapper.close();
}
