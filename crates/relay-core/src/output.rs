//! Build output records.
//!
//! [`BuildOutput`] is what a caller receives for a finished build and also
//! what the persistent cache stores, so it round-trips through JSON.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::compiler::Stats;
use crate::error::Result;
use crate::options::BuildOptions;

/// Output of one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    /// Compile start, in milliseconds since the Unix epoch.
    pub start_time: u64,
    pub end_time: u64,
    pub config: ConfigIdentity,
    pub build_hash: String,
    /// The options the build ran with.
    #[serde(default)]
    pub build_options: serde_json::Value,
    /// Emitted files per chunk, grouped by kind.
    #[serde(default)]
    pub output: IndexMap<String, ChunkFiles<PathBuf>>,
    /// Absolute paths of every emitted file.
    pub assets: Vec<PathBuf>,
    /// Public URLs per chunk; present when `static_root` and `static_url`
    /// were both given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<IndexMap<String, ChunkFiles<String>>>,
    pub file_dependencies: Vec<PathBuf>,
    /// Package name to version for the toolchain that produced the build.
    pub dependencies: IndexMap<String, String>,
    pub stats: serde_json::Value,
}

/// Where the config of a cached build came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConfigIdentity {
    File { path: PathBuf },
    Inline,
    Factory,
}

/// Files of one chunk, split by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFiles<T> {
    #[serde(default)]
    pub js: Vec<T>,
    #[serde(default)]
    pub css: Vec<T>,
    #[serde(default)]
    pub other: Vec<T>,
}

impl<T> Default for ChunkFiles<T> {
    fn default() -> Self {
        Self {
            js: Vec::new(),
            css: Vec::new(),
            other: Vec::new(),
        }
    }
}

impl<T> ChunkFiles<T> {
    fn push(&mut self, kind: FileKind, value: T) {
        match kind {
            FileKind::Js => self.js.push(value),
            FileKind::Css => self.css.push(value),
            FileKind::Other => self.other.push(value),
        }
    }

    fn map<U>(&self, mut f: impl FnMut(&T) -> Option<U>) -> ChunkFiles<U> {
        ChunkFiles {
            js: self.js.iter().filter_map(&mut f).collect(),
            css: self.css.iter().filter_map(&mut f).collect(),
            other: self.other.iter().filter_map(&mut f).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Js,
    Css,
    Other,
}

fn classify(path: &Path) -> FileKind {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("js" | "mjs" | "cjs") => FileKind::Js,
        Some("css") => FileKind::Css,
        _ => FileKind::Other,
    }
}

/// Turn compiler stats into a [`BuildOutput`].
pub fn generate_output(
    stats: &Stats,
    options: &BuildOptions,
    config: ConfigIdentity,
    dependencies: &IndexMap<String, String>,
) -> Result<BuildOutput> {
    let mut output: IndexMap<String, ChunkFiles<PathBuf>> = IndexMap::new();
    for (chunk, files) in &stats.chunks {
        let group = output.entry(chunk.clone()).or_default();
        for file in files {
            let path = stats.output_path.join(file);
            group.push(classify(&path), path);
        }
    }

    let assets = stats
        .assets
        .iter()
        .map(|file| stats.output_path.join(file))
        .collect();

    let urls = match (&options.static_root, &options.static_url) {
        (Some(root), Some(url)) => Some(
            output
                .iter()
                .map(|(chunk, files)| {
                    (chunk.clone(), files.map(|path| public_url(root, url, path)))
                })
                .collect(),
        ),
        _ => None,
    };

    Ok(BuildOutput {
        start_time: stats.start_time,
        end_time: stats.end_time,
        config,
        build_hash: options.build_hash.clone(),
        build_options: serde_json::to_value(options)?,
        output,
        assets,
        urls,
        file_dependencies: stats.file_dependencies.clone(),
        dependencies: dependencies.clone(),
        stats: serde_json::to_value(stats)?,
    })
}

/// Map a file under `root` to its public URL. Files outside `root` have none.
fn public_url(root: &Path, url: &str, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!("{url}{}", segments.join("/")))
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}
