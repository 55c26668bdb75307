//! The fixed list of assets precached at install.

use shellkit_common::ShellConfig;
use url::Url;

use crate::ServiceWorkerError;

/// Ordered, duplicate-free list of root-relative asset paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
    paths: Vec<String>,
}

impl AssetManifest {
    /// Build a manifest, dropping repeated paths after their first occurrence.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut manifest = Self { paths: Vec::new() };
        for path in paths {
            manifest.push(path.into());
        }
        manifest
    }

    /// The configured manifest with the offline page and image appended,
    /// so fallbacks are always present after a successful install.
    pub fn from_config(config: &ShellConfig) -> Self {
        let mut manifest = Self::new(config.manifest.iter().cloned());
        manifest.push(config.offline_page.clone());
        manifest.push(config.offline_image.clone());
        manifest
    }

    fn push(&mut self, path: String) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Resolve every path against the site origin.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>, ServiceWorkerError> {
        self.paths
            .iter()
            .map(|path| {
                origin
                    .join(path)
                    .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{path}: {e}")))
            })
            .collect()
    }
}
