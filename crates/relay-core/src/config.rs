//! Bundler config model and loader.
//!
//! A build request names its bundler config through a [`ConfigSource`]: a
//! `.json`/`.toml` file, an inline object, or a programmatic factory.
//! [`load_config`] obtains the config and applies, in order:
//!
//! 1. the environment hook selected by `options.env`
//! 2. hot module replacement wiring when `options.hmr` is set
//! 3. the `output_path`/`public_path` overrides from the request
//!
//! File configs are parsed through `figment`, the same layer that merges
//! declarative environment overrides on top of a base config.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::Figment;
use figment::providers::{Format, Json, Serialized, Toml};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::ConfigError;
use crate::options::BuildOptions;
use crate::output::ConfigIdentity;

/// Module id of the hot module replacement client injected into entries.
pub const HMR_CLIENT_ID: &str = "relay:hmr-client";

/// Plugin name added to the config when HMR is enabled.
pub const HMR_PLUGIN: &str = "hot-module-replacement";

/// Programmatic config producer.
pub type ConfigFactory =
    Arc<dyn Fn(&BuildOptions) -> Result<BundlerConfig, ConfigError> + Send + Sync>;

/// Where a build's bundler config comes from.
#[derive(Clone)]
pub enum ConfigSource {
    /// A `.json` or `.toml` file on disk.
    Path(PathBuf),
    /// An in-memory config object.
    Inline(Box<BundlerConfig>),
    /// A function evaluated once per wrapper.
    Factory(ConfigFactory),
}

impl ConfigSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        ConfigSource::Path(path.into())
    }

    pub fn inline(config: BundlerConfig) -> Self {
        ConfigSource::Inline(Box::new(config))
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn(&BuildOptions) -> Result<BundlerConfig, ConfigError> + Send + Sync + 'static,
    {
        ConfigSource::Factory(Arc::new(factory))
    }

    /// How a cached entry refers to this source.
    pub fn identity(&self) -> ConfigIdentity {
        match self {
            ConfigSource::Path(path) => ConfigIdentity::File { path: path.clone() },
            ConfigSource::Inline(_) => ConfigIdentity::Inline,
            ConfigSource::Factory(_) => ConfigIdentity::Factory,
        }
    }

    fn origin(&self) -> String {
        match self {
            ConfigSource::Path(path) => path.display().to_string(),
            ConfigSource::Inline(_) => "inline config".to_string(),
            ConfigSource::Factory(_) => "config factory".to_string(),
        }
    }
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ConfigSource::Inline(config) => f.debug_tuple("Inline").field(config).finish(),
            ConfigSource::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

// Factories cannot cross a process boundary; they serialize as `null`.
impl Serialize for ConfigSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfigSource::Path(path) => path.serialize(serializer),
            ConfigSource::Inline(config) => config.serialize(serializer),
            ConfigSource::Factory(_) => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for ConfigSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Path(PathBuf),
            Inline(Box<BundlerConfig>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Path(path) => ConfigSource::Path(path),
            Repr::Inline(config) => ConfigSource::Inline(config),
        })
    }
}

/// Bundler config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundlerConfig {
    /// Base directory for relative entry imports. File configs default to the
    /// directory containing the file.
    pub context: Option<PathBuf>,
    pub entry: Entry,
    pub output: OutputConfig,
    /// Names of bundler plugins to enable. The compiler maps each name onto
    /// a Rolldown plugin and rejects names it does not know.
    pub plugins: Vec<String>,
    /// Declarative per-environment overrides, merged on top of the config.
    pub env: IndexMap<String, serde_json::Value>,
    /// Programmatic per-environment hooks. Take precedence over `env`.
    #[serde(skip)]
    pub env_hooks: IndexMap<String, EnvHook>,
}

impl BundlerConfig {
    /// Register a programmatic environment hook.
    pub fn with_env_hook<F>(mut self, env: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut BundlerConfig, &BuildOptions) -> Result<(), String> + Send + Sync + 'static,
    {
        self.env_hooks.insert(env.into(), EnvHook(Arc::new(hook)));
        self
    }
}

/// Function that mutates a config for one environment.
#[derive(Clone)]
pub struct EnvHook(
    pub Arc<dyn Fn(&mut BundlerConfig, &BuildOptions) -> Result<(), String> + Send + Sync>,
);

impl fmt::Debug for EnvHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvHook(..)")
    }
}

/// Entry points, in any of the shapes a config may declare them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entry {
    Single(String),
    Multiple(Vec<String>),
    Named(IndexMap<String, EntryImports>),
}

/// Imports of one named entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryImports {
    One(String),
    Many(Vec<String>),
}

impl EntryImports {
    fn prepend(&mut self, import: &str) {
        match self {
            EntryImports::One(existing) => {
                *self = EntryImports::Many(vec![import.to_string(), std::mem::take(existing)]);
            }
            EntryImports::Many(list) => list.insert(0, import.to_string()),
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            EntryImports::One(import) => vec![import.clone()],
            EntryImports::Many(list) => list.clone(),
        }
    }
}

impl Default for Entry {
    fn default() -> Self {
        Entry::Multiple(Vec::new())
    }
}

impl Entry {
    pub fn is_empty(&self) -> bool {
        match self {
            Entry::Single(import) => import.is_empty(),
            Entry::Multiple(list) => list.is_empty(),
            Entry::Named(map) => map.is_empty(),
        }
    }

    /// Put `import` first in every entry, whatever shape the entry has.
    pub fn prepend(&mut self, import: &str) {
        match self {
            Entry::Single(existing) => {
                *self = Entry::Multiple(vec![import.to_string(), std::mem::take(existing)]);
            }
            Entry::Multiple(list) => list.insert(0, import.to_string()),
            Entry::Named(map) => {
                for imports in map.values_mut() {
                    imports.prepend(import);
                }
            }
        }
    }

    /// Entries as `(name, imports)` pairs. Unnamed shapes yield one unnamed
    /// entry.
    pub fn items(&self) -> Vec<(Option<String>, Vec<String>)> {
        match self {
            Entry::Single(import) => vec![(None, vec![import.clone()])],
            Entry::Multiple(list) => vec![(None, list.clone())],
            Entry::Named(map) => map
                .iter()
                .map(|(name, imports)| (Some(name.clone()), imports.to_vec()))
                .collect(),
        }
    }
}

/// Output section of a config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    pub path: Option<PathBuf>,
    pub public_path: Option<String>,
    pub format: OutputFormat,
    pub platform: Platform,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Esm,
    Cjs,
    Iife,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Browser,
    Node,
    Neutral,
}

/// Load and transform the config for a build.
pub async fn load_config(options: &BuildOptions) -> Result<BundlerConfig, ConfigError> {
    let source = options.config.as_ref().ok_or(ConfigError::Missing)?;

    let mut config = match source {
        ConfigSource::Path(path) => read_config_file(path).await?,
        ConfigSource::Inline(config) => (**config).clone(),
        ConfigSource::Factory(factory) => factory(options)?,
    };

    apply_env(&mut config, options)?;

    if options.hmr {
        inject_hmr(&mut config, options)?;
    }

    if let Some(path) = &options.output_path {
        config.output.path = Some(path.clone());
    }
    if let Some(public_path) = &options.public_path {
        config.output.public_path = Some(public_path.clone());
    }

    if config.entry.is_empty() {
        return Err(ConfigError::NoEntries(source.origin()));
    }

    debug!(origin = %source.origin(), "loaded bundler config");
    Ok(config)
}

/// Read a config file and validate that it holds an object.
pub async fn read_config_file(path: &Path) -> Result<BundlerConfig, ConfigError> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Read {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        }
    })?;

    let figment = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            let value: serde_json::Value =
                serde_json::from_str(&contents).map_err(|e| ConfigError::Invalid {
                    origin: path.display().to_string(),
                    message: e.to_string(),
                })?;
            if !value.is_object() {
                return Err(ConfigError::NotAnObject(path.to_path_buf()));
            }
            Figment::from(Json::string(&contents))
        }
        Some("toml") => Figment::from(Toml::string(&contents)),
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };

    let mut config: BundlerConfig = figment.extract().map_err(|e| ConfigError::Invalid {
        origin: path.display().to_string(),
        message: e.to_string(),
    })?;

    if config.context.is_none() {
        config.context = path.parent().map(Path::to_path_buf);
    }
    Ok(config)
}

fn apply_env(config: &mut BundlerConfig, options: &BuildOptions) -> Result<(), ConfigError> {
    let Some(env) = options.env.as_deref() else {
        return Ok(());
    };

    if let Some(hook) = config.env_hooks.get(env).cloned() {
        debug!(env, "applying environment hook");
        return (hook.0)(config, options).map_err(|message| ConfigError::EnvHook {
            env: env.to_string(),
            message,
        });
    }

    let Some(patch) = config.env.get(env).cloned() else {
        return Ok(());
    };

    debug!(env, "merging environment overrides");
    let hooks = std::mem::take(&mut config.env_hooks);
    let merged: BundlerConfig = Figment::from(Serialized::defaults(&*config))
        .merge(Serialized::defaults(patch))
        .extract()
        .map_err(|e| ConfigError::EnvHook {
            env: env.to_string(),
            message: e.to_string(),
        })?;

    *config = merged;
    config.env_hooks = hooks;
    Ok(())
}

fn inject_hmr(config: &mut BundlerConfig, options: &BuildOptions) -> Result<(), ConfigError> {
    let root = options
        .hmr_root
        .as_deref()
        .ok_or(ConfigError::MissingHmrField("hmrRoot"))?;
    if options.output_path.is_none() {
        return Err(ConfigError::MissingHmrField("outputPath"));
    }
    if options.public_path.is_none() {
        return Err(ConfigError::MissingHmrField("publicPath"));
    }

    let client = format!(
        "{HMR_CLIENT_ID}?root={root}&path={}&namespace={}",
        options.hmr_path, options.hmr_namespace
    );
    config.entry.prepend(&client);

    if !config.plugins.iter().any(|plugin| plugin == HMR_PLUGIN) {
        config.plugins.push(HMR_PLUGIN.to_string());
    }
    Ok(())
}
