//! # ShellKit Service Worker
//!
//! Offline app-shell cache controller. A hosting environment drives one
//! [`OfflineController`] per deployed version through four handlers:
//!
//! - **install**: precache the asset manifest into the version's cache store
//! - **activate**: delete stale stores, claim open pages
//! - **fetch**: cache-first lookup, network fallback, offline substitutes
//! - **message**: `SKIP_WAITING` forces a waiting version to activate
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (one per site origin)
//!     ├── Registration
//!     │       ├── installing (Worker)
//!     │       ├── waiting (Worker)
//!     │       └── active (Worker)
//!     ├── Clients (open pages → controlling version)
//!     └── CacheStorage
//!             └── Cache (one per version tag)
//!                     └── request-key → CachedResponse
//!
//! OfflineController (one per version, shares the container's handles)
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod container;
pub mod controller;
pub mod fallback;
pub mod manifest;
pub mod message;
pub mod registration;
pub mod request;

pub use cache::{request_key, Cache, CacheStorage, CachedResponse};
pub use clients::{Client, ClientId, Clients};
pub use container::{LifecycleEvent, ServiceWorkerContainer};
pub use controller::{
    ActivationReport, CacheWrite, FetchOutcome, InstallReport, OfflineController, ResponseSource,
};
pub use manifest::AssetManifest;
pub use message::ClientMessage;
pub use registration::{Promotion, Registration, Worker, WorkerId, WorkerState};
pub use request::RequestKind;

pub use shellkit_common::ShellConfig;
pub use shellkit_net::{Fetcher, Request, Response};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Config error: {0}")]
    Config(#[from] shellkit_common::ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] shellkit_net::NetError),
}

impl ServiceWorkerError {
    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::StateError(message.into())
    }
}
