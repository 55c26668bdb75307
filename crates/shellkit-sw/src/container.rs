//! Per-origin container holding the state every controller version shares.

use std::sync::Arc;

use shellkit_common::ShellConfig;
use shellkit_net::Fetcher;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{ClientId, Clients};
use crate::controller::OfflineController;
use crate::registration::{Registration, WorkerState};
use crate::ServiceWorkerError;

/// Lifecycle notifications for the hosting environment.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A worker changed state.
    StateChange {
        version: String,
        new_state: WorkerState,
    },
    /// A stale cache store was deleted during activation.
    CacheDeleted { name: String },
    /// Open pages were claimed by a newly active version.
    ClientsClaimed { version: String, count: usize },
    /// A network response was written back into the cache.
    CacheWritten { version: String, url: String },
    /// A background cache write was dropped.
    CacheWriteFailed {
        version: String,
        url: String,
        reason: String,
    },
}

/// Service worker container for one site origin.
pub struct ServiceWorkerContainer {
    scope: Url,

    pub(crate) caches: Arc<RwLock<CacheStorage>>,

    pub(crate) registration: Arc<RwLock<Registration>>,

    pub(crate) clients: Arc<RwLock<Clients>>,

    pub(crate) event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: Arc::new(RwLock::new(Registration::new(scope.clone()))),
                scope,
                caches: Arc::new(RwLock::new(CacheStorage::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Create the controller for the version described by `config`.
    pub fn controller(
        &self,
        config: &ShellConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<OfflineController, ServiceWorkerError> {
        config.validate()?;

        if config.origin.origin() != self.scope.origin() {
            return Err(ServiceWorkerError::InvalidUrl(format!(
                "{} is outside scope {}",
                config.origin, self.scope
            )));
        }

        OfflineController::new(self, config, fetcher)
    }

    /// Track a newly opened page. It is controlled by the active version,
    /// if one has finished activating.
    pub async fn connect_client(&self, url: Url) -> ClientId {
        let controller = {
            let registration = self.registration.read().await;
            registration
                .active
                .as_ref()
                .filter(|w| w.is_active())
                .map(|w| w.version.clone())
        };

        let id = self.clients.write().await.add(url, controller.clone());
        debug!(client = id.raw(), controller = ?controller, "Client connected");
        id
    }

    /// Forget a closed page.
    pub async fn disconnect_client(&self, id: ClientId) -> bool {
        let removed = self.clients.write().await.remove(id).is_some();
        debug!(client = id.raw(), removed, "Client disconnected");
        removed
    }

    /// Version controlling `id`, if any.
    pub async fn controller_of(&self, id: ClientId) -> Option<String> {
        self.clients
            .read()
            .await
            .get(id)
            .and_then(|c| c.controller.clone())
    }

    /// Version of the active worker.
    pub async fn active_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .active_version()
            .map(str::to_string)
    }

    /// Version of the waiting worker.
    pub async fn waiting_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .waiting_version()
            .map(str::to_string)
    }

    /// State of the worker owning `version`.
    pub async fn state_of(&self, version: &str) -> Option<WorkerState> {
        self.registration.read().await.state_of(version)
    }

    /// Names of every cache store, sorted.
    pub async fn cache_names(&self) -> Vec<String> {
        let mut names = self.caches.read().await.keys();
        names.sort();
        names
    }

    /// Shared handle to the cache storage.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }
}
