//! Build request options.
//!
//! A build request arrives as [`RawOptions`] (every field optional, camelCase
//! on the wire) and is normalized by [`resolve`] into [`BuildOptions`]. The
//! resolved options carry a `build_hash` that identifies the build: two
//! requests with the same hash share a wrapper, a watcher and a cache file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigSource;

/// Default debounce window between a file change and the rebuild.
pub const DEFAULT_AGGREGATE_TIMEOUT: Duration = Duration::from_millis(200);

/// Default URL path prefix of the hot module replacement endpoint.
pub const DEFAULT_HMR_PATH: &str = "/__hmr__";

/// Name of the directory under the system temp dir used for cache files.
pub const DEFAULT_CACHE_DIR_NAME: &str = "relay-cache";

/// Unvalidated build request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawOptions {
    pub config: Option<ConfigSource>,
    pub watch: Option<bool>,
    /// Debounce window in milliseconds.
    pub aggregate_timeout: Option<u64>,
    /// Poll interval in milliseconds. Enables polling file watches.
    pub poll_interval: Option<u64>,
    pub env: Option<String>,
    pub output_path: Option<PathBuf>,
    pub public_path: Option<String>,
    pub static_root: Option<PathBuf>,
    pub static_url: Option<String>,
    pub cache: Option<bool>,
    pub cache_dir: Option<PathBuf>,
    pub cache_file: Option<PathBuf>,
    pub hmr: Option<bool>,
    pub hmr_root: Option<String>,
    pub hmr_path: Option<String>,
    pub hmr_namespace: Option<String>,
    pub build_hash: Option<String>,
}

/// Normalized build request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    pub config: Option<ConfigSource>,
    pub watch: bool,
    #[serde(with = "duration_ms")]
    pub aggregate_timeout: Duration,
    #[serde(with = "duration_ms::option", default)]
    pub poll_interval: Option<Duration>,
    pub env: Option<String>,
    pub output_path: Option<PathBuf>,
    pub public_path: Option<String>,
    pub static_root: Option<PathBuf>,
    pub static_url: Option<String>,
    pub cache: bool,
    pub cache_dir: PathBuf,
    pub cache_file: PathBuf,
    pub hmr: bool,
    pub hmr_root: Option<String>,
    pub hmr_path: String,
    pub hmr_namespace: String,
    pub build_hash: String,
}

/// Normalize a raw build request.
///
/// Never fails: malformed inputs (a missing config, HMR without its required
/// fields) are reported later when the config is loaded.
///
/// * `public_path` and `static_url` gain exactly one trailing slash.
/// * `build_hash` is derived from the request unless supplied.
/// * `cache_file` defaults to `<cache_dir>/<build_hash>.json`.
/// * `hmr_namespace` defaults to `/<build_hash>`.
pub fn resolve(raw: RawOptions) -> BuildOptions {
    let watch = raw.watch.unwrap_or(false);
    let aggregate_timeout = raw
        .aggregate_timeout
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_AGGREGATE_TIMEOUT);
    let poll_interval = raw.poll_interval.map(Duration::from_millis);
    let public_path = raw.public_path.map(with_trailing_slash);
    let static_url = raw.static_url.map(with_trailing_slash);
    let cache = raw.cache.unwrap_or(true);
    let cache_dir = raw
        .cache_dir
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME));
    let hmr = raw.hmr.unwrap_or(false);
    let hmr_path = raw.hmr_path.unwrap_or_else(|| DEFAULT_HMR_PATH.to_string());

    let build_hash = match raw.build_hash {
        Some(hash) => hash,
        None => hash_identity(&Identity {
            version: env!("CARGO_PKG_VERSION"),
            config: match &raw.config {
                Some(ConfigSource::Path(path)) => Some(path_string(path)),
                _ => None,
            },
            watch,
            aggregate_timeout: aggregate_timeout.as_millis() as u64,
            poll_interval: poll_interval.map(|d| d.as_millis() as u64),
            env: raw.env.as_deref(),
            output_path: raw.output_path.as_deref().map(path_string),
            public_path: public_path.as_deref(),
            static_root: raw.static_root.as_deref().map(path_string),
            static_url: static_url.as_deref(),
            cache,
            cache_dir: path_string(&cache_dir),
            cache_file: raw.cache_file.as_deref().map(path_string),
            hmr,
            hmr_root: raw.hmr_root.as_deref(),
            hmr_path: &hmr_path,
            hmr_namespace: raw.hmr_namespace.as_deref(),
        }),
    };

    let cache_file = raw
        .cache_file
        .unwrap_or_else(|| cache_dir.join(format!("{build_hash}.json")));
    let hmr_namespace = raw
        .hmr_namespace
        .unwrap_or_else(|| format!("/{build_hash}"));

    BuildOptions {
        config: raw.config,
        watch,
        aggregate_timeout,
        poll_interval,
        env: raw.env,
        output_path: raw.output_path,
        public_path,
        static_root: raw.static_root,
        static_url,
        cache,
        cache_dir,
        cache_file,
        hmr,
        hmr_root: raw.hmr_root,
        hmr_path,
        hmr_namespace,
        build_hash,
    }
}

/// Ensure a URL prefix ends with exactly one `/`. Empty strings stay empty.
pub fn with_trailing_slash(value: String) -> String {
    if value.is_empty() {
        return value;
    }
    let mut trimmed = value.trim_end_matches('/').to_string();
    trimmed.push('/');
    trimmed
}

/// Resolved scalar settings that make up the build identity.
///
/// The config path takes part when the config comes from a file. Inline
/// objects and factories are not part of the identity. Defaulted
/// `cache_file` and `hmr_namespace` derive from the hash, so only explicit
/// values are included.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Identity<'a> {
    version: &'a str,
    config: Option<String>,
    watch: bool,
    aggregate_timeout: u64,
    poll_interval: Option<u64>,
    env: Option<&'a str>,
    output_path: Option<String>,
    public_path: Option<&'a str>,
    static_root: Option<String>,
    static_url: Option<&'a str>,
    cache: bool,
    cache_dir: String,
    cache_file: Option<String>,
    hmr: bool,
    hmr_root: Option<&'a str>,
    hmr_path: &'a str,
    hmr_namespace: Option<&'a str>,
}

fn hash_identity(identity: &Identity<'_>) -> String {
    // Only strings, numbers and booleans: encoding cannot fail.
    let encoded = serde_json::to_vec(identity)
        .unwrap_or_else(|_| format!("{identity:?}").into_bytes());
    blake3::hash(&encoded).to_hex().to_string()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Serialize durations as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
