//! Rolldown-backed compiler.
//!
//! Bundles a [`BundlerConfig`] with Rolldown and writes the output to the
//! configured output directory. Entries that list several imports are fed to
//! Rolldown through a generated shim module.
//!
//! Names in the config's `plugins` list map onto Rolldown plugins. The
//! `hot-module-replacement` plugin serves the HMR client module that
//! [`crate::config::load_config`] injects into every entry; without it that
//! import does not resolve.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use path_clean::PathClean;
use rolldown::{BundleOutput, BundlerBuilder, BundlerOptions, InputItem};
use rolldown_common::{ModuleType, Output, ResolvedExternal, StrOrBytes};
use rolldown_plugin::__inner::SharedPluginable;
use rolldown_plugin::{
    HookLoadArgs, HookLoadOutput, HookLoadReturn, HookResolveIdArgs, HookResolveIdOutput,
    HookResolveIdReturn, HookUsage, Plugin, PluginContext,
};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::compiler::{Compiler, CompilerFactory, Stats};
use crate::config::{BundlerConfig, HMR_CLIENT_ID, HMR_PLUGIN, OutputFormat, Platform};
use crate::error::{ConfigError, Result};
use crate::options::BuildOptions;
use crate::output::now_millis;
use crate::watch::{WatchOptions, WatchSession, spawn_watch_loop};

/// Version of the Rolldown crates this compiler is built against.
pub const ROLLDOWN_VERSION: &str = "0.5.1";

const ENTRY_SHIM_PREFIX: &str = "relay:entry:";
const DEFAULT_ENTRY_NAME: &str = "main";
const HMR_CLIENT_SOURCE: &str = include_str!("../assets/hmr-client.js");

/// Creates a [`RolldownCompiler`] per config.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolldownCompilerFactory;

impl CompilerFactory for RolldownCompilerFactory {
    fn create(
        &self,
        config: &BundlerConfig,
        _options: &BuildOptions,
    ) -> Result<Arc<dyn crate::compiler::Compiler>> {
        Ok(Arc::new(RolldownCompiler::new(config.clone())?))
    }

    fn versions(&self) -> IndexMap<String, String> {
        let mut versions = IndexMap::new();
        versions.insert("rolldown".to_string(), ROLLDOWN_VERSION.to_string());
        versions
    }
}

/// A bundler plugin a config can enable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamedPlugin {
    HotModuleReplacement,
}

impl NamedPlugin {
    fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            HMR_PLUGIN => Ok(NamedPlugin::HotModuleReplacement),
            other => Err(ConfigError::UnknownPlugin(other.to_string())),
        }
    }

    fn instantiate(self) -> SharedPluginable {
        match self {
            NamedPlugin::HotModuleReplacement => Arc::new(HotModuleReplacementPlugin),
        }
    }
}

pub struct RolldownCompiler {
    config: BundlerConfig,
    plugins: Vec<NamedPlugin>,
    cwd: PathBuf,
    output_path: PathBuf,
}

impl RolldownCompiler {
    /// Relative context and output paths resolve against the current
    /// directory. Unknown plugin names are a config error.
    pub fn new(config: BundlerConfig) -> Result<Self> {
        let current = std::env::current_dir()?;
        let cwd = match &config.context {
            Some(context) => current.join(context).clean(),
            None => current,
        };
        let output_path = match &config.output.path {
            Some(path) => cwd.join(path).clean(),
            None => cwd.join("dist"),
        };

        let mut plugins = Vec::new();
        for name in &config.plugins {
            let plugin = NamedPlugin::from_name(name)?;
            if !plugins.contains(&plugin) {
                plugins.push(plugin);
            }
        }

        Ok(Self {
            config,
            plugins,
            cwd,
            output_path,
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn plan(&self) -> BundlePlan {
        let mut plan = BundlePlan::default();

        for (name, imports) in self.config.entry.items() {
            let imports: Vec<String> = imports
                .iter()
                .map(|import| self.resolve_import(import, &mut plan))
                .collect();

            match imports.as_slice() {
                [] => {}
                [single] => plan.inputs.push(InputItem {
                    name,
                    import: single.clone(),
                }),
                many => {
                    let name = name.unwrap_or_else(|| DEFAULT_ENTRY_NAME.to_string());
                    let id = format!("{ENTRY_SHIM_PREFIX}{name}");
                    plan.modules.insert(id.clone(), entry_shim(many));
                    plan.inputs.push(InputItem {
                        name: Some(name),
                        import: id,
                    });
                }
            }
        }

        plan
    }

    fn resolve_import(&self, import: &str, plan: &mut BundlePlan) -> String {
        if import.starts_with(HMR_CLIENT_ID) {
            return import.to_string();
        }

        if import.starts_with("./") || import.starts_with("../") || Path::new(import).is_absolute()
        {
            let path = self.cwd.join(import).clean();
            plan.entry_files.push(path.clone());
            return path.to_string_lossy().into_owned();
        }

        import.to_string()
    }

    fn bundler_options(&self, inputs: Vec<InputItem>) -> BundlerOptions {
        BundlerOptions {
            input: Some(inputs),
            cwd: Some(self.cwd.clone()),
            format: Some(match self.config.output.format {
                OutputFormat::Esm => rolldown::OutputFormat::Esm,
                OutputFormat::Cjs => rolldown::OutputFormat::Cjs,
                OutputFormat::Iife => rolldown::OutputFormat::Iife,
            }),
            platform: Some(match self.config.output.platform {
                Platform::Browser => rolldown::Platform::Browser,
                Platform::Node => rolldown::Platform::Node,
                Platform::Neutral => rolldown::Platform::Neutral,
            }),
            ..Default::default()
        }
    }

    /// Write every chunk and asset, recording them in `stats`.
    async fn emit(&self, bundle: &BundleOutput, stats: &mut Stats) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_path).await?;
        let mut hasher = blake3::Hasher::new();

        for output in bundle.assets.iter() {
            match output {
                Output::Chunk(chunk) => {
                    let filename = chunk.filename.to_string();
                    self.write(&filename, chunk.code.as_bytes()).await?;
                    hasher.update(chunk.code.as_bytes());

                    stats
                        .chunks
                        .entry(chunk.name.to_string())
                        .or_default()
                        .push(filename.clone());
                    stats.assets.push(filename);

                    for id in chunk.module_ids.iter() {
                        let id = id.to_string();
                        let path = PathBuf::from(&id);
                        if path.is_absolute() && !stats.file_dependencies.contains(&path) {
                            stats.file_dependencies.push(path);
                        }
                    }
                }
                Output::Asset(asset) => {
                    let filename = asset.filename.to_string();
                    let bytes: &[u8] = match &asset.source {
                        StrOrBytes::Str(s) => s.as_bytes(),
                        StrOrBytes::Bytes(b) => b,
                    };
                    self.write(&filename, bytes).await?;
                    hasher.update(bytes);
                    stats.assets.push(filename);
                }
            }
        }

        stats.hash = hasher.finalize().to_hex().to_string();
        Ok(())
    }

    async fn write(&self, filename: &str, contents: &[u8]) -> Result<()> {
        let path = self.output_path.join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }
}

#[async_trait]
impl Compiler for RolldownCompiler {
    async fn run(&self) -> Result<Stats> {
        let plan = self.plan();
        let mut stats = Stats {
            start_time: now_millis(),
            output_path: self.output_path.clone(),
            public_path: self.config.output.public_path.clone().unwrap_or_default(),
            file_dependencies: plan.entry_files.clone(),
            ..Default::default()
        };

        let mut plugins: Vec<SharedPluginable> =
            vec![Arc::new(VirtualModulePlugin::new(plan.modules))];
        plugins.extend(self.plugins.iter().map(|plugin| plugin.instantiate()));
        let built = BundlerBuilder::default()
            .with_options(self.bundler_options(plan.inputs))
            .with_plugins(plugins)
            .build();

        let mut bundler = match built {
            Ok(bundler) => bundler,
            Err(e) => {
                stats.errors.push(format!("{:?}", e));
                stats.end_time = now_millis();
                return Ok(stats);
            }
        };

        match bundler.generate().await {
            Ok(bundle) => self.emit(&bundle, &mut stats).await?,
            Err(e) => stats.errors.push(format!("{:?}", e)),
        }

        stats.end_time = now_millis();
        debug!(
            output = %self.output_path.display(),
            assets = stats.assets.len(),
            errors = stats.errors.len(),
            "rolldown compile finished"
        );
        Ok(stats)
    }

    fn watch(self: Arc<Self>, options: WatchOptions) -> WatchSession {
        spawn_watch_loop(self, options)
    }
}

#[derive(Default)]
struct BundlePlan {
    inputs: Vec<InputItem>,
    modules: FxHashMap<String, String>,
    entry_files: Vec<PathBuf>,
}

/// Module that imports every entry import in order and re-exports the last.
fn entry_shim(imports: &[String]) -> String {
    let mut source = String::new();
    if let Some((last, rest)) = imports.split_last() {
        for import in rest {
            source.push_str(&format!("import {};\n", js_string(import)));
        }
        source.push_str(&format!("export * from {};\n", js_string(last)));
    }
    source
}

fn hmr_client(query: &str) -> String {
    let mut root = "";
    let mut path = "";
    let mut namespace = "";
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("root", value)) => root = value,
            Some(("path", value)) => path = value,
            Some(("namespace", value)) => namespace = value,
            _ => {}
        }
    }
    let url = format!("{}{}{}", root.trim_end_matches('/'), path, namespace);
    HMR_CLIENT_SOURCE.replace("__RELAY_HMR_URL__", &url)
}

fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// Serves generated entry shims to Rolldown.
#[derive(Debug, Clone)]
struct VirtualModulePlugin {
    modules: Arc<FxHashMap<String, String>>,
}

impl VirtualModulePlugin {
    fn new(modules: FxHashMap<String, String>) -> Self {
        Self {
            modules: Arc::new(modules),
        }
    }
}

impl Plugin for VirtualModulePlugin {
    fn name(&self) -> Cow<'static, str> {
        "relay-virtual-modules".into()
    }

    fn register_hook_usage(&self) -> HookUsage {
        HookUsage::ResolveId | HookUsage::Load
    }

    fn resolve_id(
        &self,
        _ctx: &PluginContext,
        args: &HookResolveIdArgs,
    ) -> impl std::future::Future<Output = HookResolveIdReturn> + Send {
        let specifier = args.specifier.to_string();
        let modules = Arc::clone(&self.modules);

        async move {
            if !modules.contains_key(&specifier) {
                return Ok(None);
            }
            Ok(Some(HookResolveIdOutput {
                id: specifier.into(),
                external: Some(ResolvedExternal::Bool(false)),
                ..Default::default()
            }))
        }
    }

    fn load(
        &self,
        _ctx: &PluginContext,
        args: &HookLoadArgs<'_>,
    ) -> impl std::future::Future<Output = HookLoadReturn> + Send {
        let id = args.id.to_string();
        let modules = Arc::clone(&self.modules);

        async move {
            Ok(modules.get(&id).map(|source| HookLoadOutput {
                code: source.clone().into(),
                module_type: Some(ModuleType::Js),
                ..Default::default()
            }))
        }
    }
}

/// Serves the hot module replacement client.
///
/// The client id carries its settings as a query
/// (`relay:hmr-client?root=..&path=..&namespace=..`), so each distinct id
/// loads a client bound to its own event stream.
#[derive(Debug, Clone, Copy)]
struct HotModuleReplacementPlugin;

impl HotModuleReplacementPlugin {
    fn source(id: &str) -> Option<String> {
        let query = id.strip_prefix(HMR_CLIENT_ID)?;
        Some(hmr_client(query.trim_start_matches('?')))
    }
}

impl Plugin for HotModuleReplacementPlugin {
    fn name(&self) -> Cow<'static, str> {
        HMR_PLUGIN.into()
    }

    fn register_hook_usage(&self) -> HookUsage {
        HookUsage::ResolveId | HookUsage::Load
    }

    fn resolve_id(
        &self,
        _ctx: &PluginContext,
        args: &HookResolveIdArgs,
    ) -> impl std::future::Future<Output = HookResolveIdReturn> + Send {
        let specifier = args.specifier.to_string();

        async move {
            if !specifier.starts_with(HMR_CLIENT_ID) {
                return Ok(None);
            }
            Ok(Some(HookResolveIdOutput {
                id: specifier.into(),
                external: Some(ResolvedExternal::Bool(false)),
                ..Default::default()
            }))
        }
    }

    fn load(
        &self,
        _ctx: &PluginContext,
        args: &HookLoadArgs<'_>,
    ) -> impl std::future::Future<Output = HookLoadReturn> + Send {
        let source = Self::source(&args.id.to_string());

        async move {
            Ok(source.map(|code| HookLoadOutput {
                code: code.into(),
                module_type: Some(ModuleType::Js),
                ..Default::default()
            }))
        }
    }
}
