//! Hot module replacement notifications.
//!
//! Each HMR-enabled build has a namespace (by default `/<buildHash>`). The
//! [`HmrHub`] keeps one broadcast channel per namespace; SSE clients
//! subscribe to it and build watchers publish into it. Channels and
//! registrations are tracked apart: a client may open a channel before any
//! build registers the namespace.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use relay_core::{BuildWrapper, WatcherEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 32;

/// Event pushed to HMR clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HmrEvent {
    Done {
        hash: String,
        errors: Vec<String>,
        warnings: Vec<String>,
    },
    Invalid,
    Failed {
        message: String,
    },
}

impl HmrEvent {
    pub fn from_watcher(event: &WatcherEvent) -> Self {
        match event {
            WatcherEvent::Done(completion) => match &completion.stats {
                Some(stats) => HmrEvent::Done {
                    hash: stats.hash.clone(),
                    errors: stats.errors.clone(),
                    warnings: stats.warnings.clone(),
                },
                None => HmrEvent::Failed {
                    message: completion
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                },
            },
            WatcherEvent::Invalid => HmrEvent::Invalid,
            WatcherEvent::Failed(err) => HmrEvent::Failed {
                message: err.to_string(),
            },
        }
    }

    /// JSON body of the SSE message.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Namespaced broadcast of HMR events.
#[derive(Default)]
pub struct HmrHub {
    channels: DashMap<String, broadcast::Sender<HmrEvent>>,
    registered: DashSet<String>,
    paths: DashSet<String>,
}

impl HmrHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a namespace. Returns `true` the first time only, so the
    /// caller knows to start forwarding events for it. Clients that
    /// subscribed earlier keep their channel.
    pub fn register(&self, namespace: &str) -> bool {
        self.channel(namespace);
        let created = self.registered.insert(namespace.to_string());
        if created {
            debug!(namespace, "registered hmr namespace");
        }
        created
    }

    pub fn is_registered(&self, namespace: &str) -> bool {
        self.registered.contains(namespace)
    }

    /// Subscribe to a namespace. Clients may connect before the first build
    /// for it has been requested.
    pub fn subscribe(&self, namespace: &str) -> broadcast::Receiver<HmrEvent> {
        self.channel(namespace).subscribe()
    }

    fn channel(&self, namespace: &str) -> broadcast::Sender<HmrEvent> {
        self.channels
            .entry(namespace.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Send an event to every client of `namespace`. Returns the number of
    /// clients reached.
    pub fn publish(&self, namespace: &str, event: HmrEvent) -> usize {
        self.channels
            .get(namespace)
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0)
    }

    /// Remember a URL prefix that HMR clients connect under.
    pub fn add_path(&self, path: &str) {
        let path = path.trim_end_matches('/');
        if !path.is_empty() && self.paths.insert(path.to_string()) {
            debug!(path, "serving hmr events under custom path");
        }
    }

    /// Namespace addressed by a request path under one of the known
    /// prefixes. The longest matching prefix wins.
    pub fn namespace_for(&self, request_path: &str) -> Option<String> {
        self.paths
            .iter()
            .filter_map(|prefix| {
                let rest = request_path.strip_prefix(prefix.as_str())?;
                (rest.len() > 1 && rest.starts_with('/')).then(|| (prefix.len(), rest.to_string()))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, namespace)| namespace)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clients(&self, namespace: &str) -> usize {
        self.channels
            .get(namespace)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// Forward watcher events until the wrapper's event channel closes.
pub async fn forward_events(
    mut events: broadcast::Receiver<WatcherEvent>,
    mut emit: impl FnMut(HmrEvent) + Send,
) {
    loop {
        match events.recv().await {
            Ok(event) => emit(HmrEvent::from_watcher(&event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "hmr forwarder lagged behind watcher events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Publish a wrapper's watcher events to the hub under its HMR namespace.
///
/// Does nothing unless the build has HMR enabled, and only the first call
/// per namespace starts a forwarder.
pub fn attach(hub: &Arc<HmrHub>, wrapper: &Arc<BuildWrapper>) {
    let options = wrapper.options();
    if !options.hmr {
        return;
    }
    hub.add_path(&options.hmr_path);
    if !hub.register(&options.hmr_namespace) {
        return;
    }

    let namespace = options.hmr_namespace.clone();
    let events = wrapper.subscribe();
    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        forward_events(events, |event| {
            hub.publish(&namespace, event);
        })
        .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use indexmap::IndexMap;
    use relay_core::watch::spawn_watch_loop;
    use relay_core::{
        BuildContext, BuildOptions, BundlerConfig, Compiler, CompilerFactory, Completion,
        ConfigSource, Entry, RawOptions, Stats, WatchOptions, WatchSession,
    };
    use std::time::Duration;

    struct FixedCompiler;

    #[async_trait]
    impl Compiler for FixedCompiler {
        async fn run(&self) -> relay_core::Result<Stats> {
            Ok(Stats {
                hash: "h1".into(),
                ..Default::default()
            })
        }

        fn watch(self: Arc<Self>, options: WatchOptions) -> WatchSession {
            spawn_watch_loop(self, options)
        }
    }

    struct FixedFactory;

    impl CompilerFactory for FixedFactory {
        fn create(
            &self,
            _config: &BundlerConfig,
            _options: &BuildOptions,
        ) -> relay_core::Result<Arc<dyn Compiler>> {
            Ok(Arc::new(FixedCompiler))
        }

        fn versions(&self) -> IndexMap<String, String> {
            IndexMap::new()
        }
    }

    #[test]
    fn test_register_once() {
        let hub = HmrHub::new();

        assert!(hub.register("/abc"));
        assert!(!hub.register("/abc"));
        assert!(hub.is_registered("/abc"));
        assert_eq!(hub.namespaces(), vec!["/abc".to_string()]);
    }

    #[test]
    fn test_register_after_early_subscriber() {
        let hub = HmrHub::new();
        let _client = hub.subscribe("/abc");

        assert!(!hub.is_registered("/abc"));
        assert!(hub.register("/abc"));
        assert_eq!(hub.clients("/abc"), 1);
    }

    #[test]
    fn test_namespace_for_custom_paths() {
        let hub = HmrHub::new();
        hub.add_path("/__live__/");
        hub.add_path("/__live__/nested");

        assert_eq!(hub.namespace_for("/__live__/app").as_deref(), Some("/app"));
        assert_eq!(hub.namespace_for("/__live__/nested/x").as_deref(), Some("/x"));
        assert_eq!(hub.namespace_for("/__live__/"), None);
        assert_eq!(hub.namespace_for("/__live__app"), None);
        assert_eq!(hub.namespace_for("/elsewhere/app"), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_of_namespace_only() {
        let hub = HmrHub::new();
        let mut a = hub.subscribe("/a");
        let mut b = hub.subscribe("/b");

        assert_eq!(hub.publish("/a", HmrEvent::Invalid), 1);

        assert_eq!(a.recv().await.unwrap(), HmrEvent::Invalid);
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_clients() {
        let hub = HmrHub::new();
        assert_eq!(hub.publish("/nobody", HmrEvent::Invalid), 0);
    }

    #[test]
    fn test_event_json() {
        let done = HmrEvent::Done {
            hash: "h1".into(),
            errors: vec![],
            warnings: vec!["w".into()],
        };
        assert_eq!(
            done.to_json(),
            r#"{"type":"done","hash":"h1","errors":[],"warnings":["w"]}"#
        );
        assert_eq!(HmrEvent::Invalid.to_json(), r#"{"type":"invalid"}"#);
    }

    #[tokio::test]
    async fn test_forward_events_maps_watcher_events() {
        let (tx, rx) = broadcast::channel(8);
        let stats = Stats {
            hash: "h2".into(),
            errors: vec!["boom".into()],
            ..Default::default()
        };
        tx.send(WatcherEvent::Invalid).unwrap();
        tx.send(WatcherEvent::Done(Completion {
            error: None,
            stats: Some(Arc::new(stats)),
        }))
        .unwrap();
        drop(tx);

        let mut seen = Vec::new();
        forward_events(rx, |event| seen.push(event)).await;

        assert_eq!(
            seen,
            vec![
                HmrEvent::Invalid,
                HmrEvent::Done {
                    hash: "h2".into(),
                    errors: vec!["boom".into()],
                    warnings: vec![],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_client_connected_before_build_receives_events() {
        let temp = tempfile::TempDir::new().unwrap();
        let hub = Arc::new(HmrHub::new());
        let mut client = hub.subscribe("/app");
        let context = BuildContext::new(Arc::new(FixedFactory));

        let pending = context.build(RawOptions {
            config: Some(ConfigSource::inline(BundlerConfig {
                entry: Entry::Single("./index.js".into()),
                ..Default::default()
            })),
            watch: Some(true),
            cache: Some(false),
            hmr: Some(true),
            hmr_root: Some("http://127.0.0.1:9009".into()),
            hmr_namespace: Some("/app".into()),
            output_path: Some(temp.path().join("dist")),
            public_path: Some("/static".into()),
            ..Default::default()
        });
        attach(&hub, pending.wrapper());
        pending.result().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            HmrEvent::Done {
                hash: "h1".into(),
                errors: vec![],
                warnings: vec![],
            }
        );
        context.reset();
    }
}
