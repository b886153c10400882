//! Plugin lookup.
//!
//! Plugins are external binaries (a patched CRIU, the image streamer, the
//! GPU controller). Discovery and installation live elsewhere; the core only
//! asks whether a plugin is installed and where its binaries are.

use std::collections::BTreeMap;
use std::path::PathBuf;

pub const CRIU_PLUGIN: &str = "criu";
pub const STREAMER_PLUGIN: &str = "streamer";
pub const GPU_PLUGIN: &str = "gpu";

pub trait Plugins: Send + Sync {
    /// Binary paths of an installed plugin, or `None` if it is not installed.
    fn binary_paths(&self, name: &str) -> Option<Vec<PathBuf>>;

    fn is_installed(&self, name: &str) -> bool {
        self.binary_paths(name).is_some()
    }

    /// First binary of an installed plugin.
    fn binary(&self, name: &str) -> Option<PathBuf> {
        self.binary_paths(name)
            .and_then(|paths| paths.into_iter().next())
    }
}

/// Plugins declared up front, usually from the config file. A plugin counts
/// as installed when all of its binaries exist.
#[derive(Debug, Default, Clone)]
pub struct StaticPlugins {
    plugins: BTreeMap<String, Vec<PathBuf>>,
}

impl StaticPlugins {
    pub fn new(plugins: BTreeMap<String, Vec<PathBuf>>) -> Self {
        Self { plugins }
    }

    pub fn with(mut self, name: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        self.plugins
            .entry(name.into())
            .or_default()
            .push(binary.into());
        self
    }
}

impl Plugins for StaticPlugins {
    fn binary_paths(&self, name: &str) -> Option<Vec<PathBuf>> {
        let paths = self.plugins.get(name)?;
        if paths.is_empty() || !paths.iter().all(|p| p.exists()) {
            return None;
        }
        Some(paths.clone())
    }
}
