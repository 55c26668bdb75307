//! Offline shell configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::logging::LogFormat;
use crate::{ConfigError, Result};

/// Default cache version tag. Bumping it invalidates every stored asset.
pub const DEFAULT_CACHE_VERSION: &str = "portfolio-cache-v1";

/// Assets needed to boot the site without a network.
pub const DEFAULT_MANIFEST: &[&str] = &[
    "/",
    "/index.html",
    "/manifest.json",
    "/src/main.jsx",
    "/src/index.css",
    "/profile.jpg",
    "/vite.svg",
    "/src/components/Hero.jsx",
    "/src/components/About.jsx",
    "/src/components/Skills.jsx",
    "/src/components/Projects.jsx",
    "/src/components/Contact.jsx",
    "/resume.pdf",
];

/// Offline shell configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Origin the site is served from; manifest paths resolve against it
    pub origin: Url,

    /// Version tag naming the current cache store
    pub cache_version: String,

    /// Root-relative asset paths precached at install
    pub manifest: Vec<String>,

    /// Page served for navigations while offline
    pub offline_page: String,

    /// Placeholder served for images while offline
    pub offline_image: String,

    /// URL substring marking API requests
    pub api_marker: String,

    /// Network timeout in milliseconds; `None` waits forever
    pub network_timeout_ms: Option<u64>,

    /// Promote a freshly installed version without waiting for pages to close
    pub skip_waiting_on_install: bool,

    /// Logging settings
    pub logging: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Level name (trace, debug, info, warn, error)
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Optional `EnvFilter` directive overriding `level`
    pub filter: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:5173/").expect("static origin is valid"),
            cache_version: DEFAULT_CACHE_VERSION.to_string(),
            manifest: DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect(),
            offline_page: "/offline.html".to_string(),
            offline_image: "/offline.svg".to_string(),
            api_marker: "/api/".to_string(),
            network_timeout_ms: Some(30_000),
            skip_waiting_on_install: true,
            logging: LogSettings::default(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl ShellConfig {
    /// Create a config for `origin` with default settings.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON config string.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the cache version tag.
    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    /// Set the manifest.
    pub fn with_manifest<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Set whether install promotes the new version immediately.
    pub fn with_skip_waiting_on_install(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }

    /// Set the network timeout.
    pub fn with_network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout_ms = timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Network timeout as a `Duration`.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }

    /// Check that the config can drive a controller.
    pub fn validate(&self) -> Result<()> {
        if self.cache_version.trim().is_empty() {
            return Err(ConfigError::invalid("cache_version", "must not be empty"));
        }

        if self.origin.cannot_be_a_base() {
            return Err(ConfigError::invalid(
                "origin",
                format!("{} cannot be used as a base URL", self.origin),
            ));
        }

        let fallbacks = [
            ("offline_page", &self.offline_page),
            ("offline_image", &self.offline_image),
        ];
        for (field, path) in fallbacks {
            if !path.starts_with('/') {
                return Err(ConfigError::invalid(
                    field,
                    format!("{path:?} is not root-relative"),
                ));
            }
        }

        if let Some(bad) = self.manifest.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::invalid(
                "manifest",
                format!("{bad:?} is not root-relative"),
            ));
        }

        if self.api_marker.is_empty() {
            return Err(ConfigError::invalid("api_marker", "must not be empty"));
        }

        if self.network_timeout_ms == Some(0) {
            return Err(ConfigError::invalid(
                "network_timeout_ms",
                "use null to disable the timeout",
            ));
        }

        Ok(())
    }
}
