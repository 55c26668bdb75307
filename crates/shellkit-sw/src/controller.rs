//! The offline controller: install, activate, fetch, and message handlers
//! for one deployed version.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use http::Method;
use shellkit_common::ShellConfig;
use shellkit_net::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse};
use crate::clients::Clients;
use crate::container::{LifecycleEvent, ServiceWorkerContainer};
use crate::fallback;
use crate::manifest::AssetManifest;
use crate::message::ClientMessage;
use crate::registration::{Promotion, Registration, WorkerState};
use crate::request::RequestKind;
use crate::ServiceWorkerError;

// ==================== Reports ====================

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallReport {
    pub version: String,

    /// Number of manifest entries written.
    pub cached: usize,

    /// Present when the new version was promoted and activated right away.
    pub activation: Option<ActivationReport>,
}

/// Result of the activate phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationReport {
    pub version: String,

    /// Stale cache stores removed, sorted.
    pub deleted_caches: Vec<String>,

    /// Pages whose controller changed to this version.
    pub claimed_clients: usize,
}

// ==================== Fetch Outcome ====================

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// Offline substitute after a network failure.
    Fallback,
}

/// Background write of a network response into the cache.
///
/// Dropping the handle detaches the task; it still runs to completion.
#[derive(Debug)]
pub struct CacheWrite {
    handle: JoinHandle<bool>,
}

impl CacheWrite {
    /// Wait for the write. Returns whether the entry was stored.
    pub async fn wait(self) -> bool {
        match self.handle.await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Cache write task did not complete");
                false
            }
        }
    }
}

/// Response for one intercepted request, plus any cache write it started.
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: Response,

    pub source: ResponseSource,

    cache_write: Option<CacheWrite>,
}

impl FetchOutcome {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self {
            response,
            source,
            cache_write: None,
        }
    }

    /// Whether a background cache write was started.
    pub fn is_caching(&self) -> bool {
        self.cache_write.is_some()
    }

    /// Take the pending cache write, leaving the response.
    pub fn take_cache_write(&mut self) -> Option<CacheWrite> {
        self.cache_write.take()
    }

    /// Return the response without waiting for the cache write.
    pub fn into_response(self) -> Response {
        self.response
    }

    /// Wait for the cache write, then return the response.
    pub async fn settle(mut self) -> Response {
        if let Some(write) = self.cache_write.take() {
            write.wait().await;
        }
        self.response
    }
}

// ==================== Controller ====================

/// Controller for one version of the offline cache.
///
/// All versions created from the same container share its cache storage,
/// registration, and clients.
pub struct OfflineController {
    version: String,
    origin: Url,
    manifest: AssetManifest,
    offline_page: Url,
    offline_image: Url,
    api_marker: String,
    network_timeout: Option<Duration>,
    skip_waiting_on_install: bool,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<RwLock<CacheStorage>>,
    registration: Arc<RwLock<Registration>>,
    clients: Arc<RwLock<Clients>>,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl OfflineController {
    pub(crate) fn new(
        container: &ServiceWorkerContainer,
        config: &ShellConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let resolve = |path: &str| {
            config
                .origin
                .join(path)
                .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{path}: {e}")))
        };

        Ok(Self {
            version: config.cache_version.clone(),
            origin: config.origin.clone(),
            manifest: AssetManifest::from_config(config),
            offline_page: resolve(&config.offline_page)?,
            offline_image: resolve(&config.offline_image)?,
            api_marker: config.api_marker.clone(),
            network_timeout: config.network_timeout(),
            skip_waiting_on_install: config.skip_waiting_on_install,
            fetcher,
            caches: Arc::clone(&container.caches),
            registration: Arc::clone(&container.registration),
            clients: Arc::clone(&container.clients),
            event_tx: container.event_tx.clone(),
        })
    }

    /// Version tag of this controller's cache store.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    fn emit(&self, event: LifecycleEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, new_state: WorkerState) {
        self.emit(LifecycleEvent::StateChange {
            version: self.version.clone(),
            new_state,
        });
    }

    // ==================== Install ====================

    /// Install phase: precache the manifest into this version's store.
    ///
    /// Population is all-or-nothing: if any entry fails, nothing is written
    /// and the worker becomes redundant. When the new version may be
    /// promoted straight away, the activate phase runs before returning.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.registration.write().await.begin_install(&self.version)?;
        self.emit_state(WorkerState::Installing);

        info!(
            version = %self.version,
            entries = self.manifest.len(),
            "Installing"
        );

        let entries = match self.precache().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(version = %self.version, error = %e, "Install failed");
                self.registration.write().await.install_failed(&self.version);
                self.emit_state(WorkerState::Redundant);
                return Err(e);
            }
        };

        let cached = entries.len();
        {
            let mut caches = self.caches.write().await;
            let cache = caches.open(&self.version);
            for (url, entry) in entries {
                cache.put(&Method::GET, &url, entry)?;
            }
        }

        {
            let mut registration = self.registration.write().await;
            registration.install_complete(&self.version)?;
            if self.skip_waiting_on_install {
                registration.request_skip_waiting(&self.version);
            }
        }
        self.emit_state(WorkerState::Installed);
        info!(version = %self.version, cached, "Installed");

        let activation = self.activate_if_eligible().await?;

        Ok(InstallReport {
            version: self.version.clone(),
            cached,
            activation,
        })
    }

    async fn precache(&self) -> Result<Vec<(Url, CachedResponse)>, ServiceWorkerError> {
        let urls = self.manifest.resolve(&self.origin)?;

        let fetches = urls.into_iter().map(|url| async move {
            let request = Request::get(url.clone()).mode(RequestMode::SameOrigin);
            let response = self.fetch_network(request).await.map_err(|e| {
                ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;

            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }

            trace!(url = %url, bytes = response.body().len(), "Precached");
            Ok((url, CachedResponse::from_response(&response)))
        });

        try_join_all(fetches).await
    }

    // ==================== Activate ====================

    async fn controlled_by_active(&self, registration: &Registration) -> usize {
        match registration.active_version() {
            Some(active) => self.clients.read().await.controlled_by(active),
            None => 0,
        }
    }

    async fn activate_if_eligible(&self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let eligible = {
            let registration = self.registration.read().await;
            let controlled = self.controlled_by_active(&registration).await;
            registration.can_promote(&self.version, controlled)
        };

        if !eligible {
            debug!(version = %self.version, "Waiting for open pages to close");
            return Ok(None);
        }
        self.activate().await.map(Some)
    }

    /// Activate phase: promote this version if it is waiting, delete every
    /// other cache store, then claim all open pages.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        {
            let mut registration = self.registration.write().await;
            match registration.state_of(&self.version) {
                Some(WorkerState::Installed) => {
                    let controlled = self.controlled_by_active(&registration).await;
                    match registration.promote(&self.version, controlled) {
                        Promotion::Promoted { replaced } => {
                            if let Some(old) = replaced {
                                debug!(version = %old.version, "Replaced active version");
                                self.emit(LifecycleEvent::StateChange {
                                    version: old.version,
                                    new_state: WorkerState::Redundant,
                                });
                            }
                        }
                        Promotion::Blocked { controlled_clients } => {
                            return Err(ServiceWorkerError::state(format!(
                                "version {} is waiting on {controlled_clients} open page(s)",
                                self.version
                            )));
                        }
                        Promotion::NotWaiting => {
                            return Err(ServiceWorkerError::state(format!(
                                "version {} is not waiting",
                                self.version
                            )));
                        }
                    }
                }
                Some(WorkerState::Activating) => {}
                other => {
                    return Err(ServiceWorkerError::state(format!(
                        "cannot activate version {} in state {other:?}",
                        self.version
                    )));
                }
            }
        }
        self.emit_state(WorkerState::Activating);
        info!(version = %self.version, "Activating");

        let deleted_caches = self.delete_stale_caches().await;

        let claimed_clients = self.clients.write().await.claim(&self.version);
        self.emit(LifecycleEvent::ClientsClaimed {
            version: self.version.clone(),
            count: claimed_clients,
        });

        self.registration
            .write()
            .await
            .finish_activation(&self.version)?;
        self.emit_state(WorkerState::Activated);

        info!(
            version = %self.version,
            deleted = deleted_caches.len(),
            claimed = claimed_clients,
            "Activated"
        );

        Ok(ActivationReport {
            version: self.version.clone(),
            deleted_caches,
            claimed_clients,
        })
    }

    async fn delete_stale_caches(&self) -> Vec<String> {
        let stale: Vec<String> = {
            let caches = self.caches.read().await;
            caches
                .keys()
                .into_iter()
                .filter(|name| *name != self.version)
                .collect()
        };

        let mut deleted = Vec::with_capacity(stale.len());
        for name in stale {
            if self.caches.write().await.delete(&name) {
                info!(cache = %name, "Deleted stale cache");
                self.emit(LifecycleEvent::CacheDeleted { name: name.clone() });
                deleted.push(name);
            } else {
                warn!(cache = %name, "Stale cache already gone");
            }
        }
        deleted.sort();
        deleted
    }

    // ==================== Fetch ====================

    async fn fetch_network(&self, request: Request) -> Result<Response, NetError> {
        match self.network_timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetcher.fetch(request))
                .await
                .map_err(|_| NetError::Timeout(limit))?,
            None => self.fetcher.fetch(request).await,
        }
    }

    async fn lookup(&self, url: &Url) -> Option<CachedResponse> {
        self.caches
            .read()
            .await
            .get(&self.version)
            .and_then(|cache| cache.match_url(url))
            .cloned()
    }

    /// Fetch phase: cache first, then network, then an offline substitute.
    ///
    /// Never fails; a network error always yields some response.
    pub async fn fetch(&self, request: Request) -> FetchOutcome {
        let kind = RequestKind::classify(&request, &self.api_marker);
        let url = request.url.clone();
        let method = request.method.clone();

        if method == Method::GET {
            if let Some(hit) = self.lookup(&url).await {
                trace!(url = %url, "Cache hit");
                return FetchOutcome::new(hit.to_response(), ResponseSource::Cache);
            }
        }

        trace!(url = %url, kind = %kind, "Cache miss, going to network");

        match self.fetch_network(request).await {
            Ok(response) => {
                let mut outcome = FetchOutcome::new(response, ResponseSource::Network);
                if is_cacheable(&self.origin, &method, &outcome.response) {
                    outcome.cache_write = Some(self.spawn_cache_write(url, &outcome.response));
                } else {
                    trace!(
                        url = %url,
                        method = %method,
                        status = outcome.response.status,
                        response_type = %outcome.response.response_type,
                        "Not caching response"
                    );
                }
                outcome
            }
            Err(e) => {
                warn!(url = %url, kind = %kind, error = %e, "Network failed, serving offline fallback");
                FetchOutcome::new(self.offline_fallback(kind, url).await, ResponseSource::Fallback)
            }
        }
    }

    fn spawn_cache_write(&self, url: Url, response: &Response) -> CacheWrite {
        let caches = Arc::clone(&self.caches);
        let events = self.event_tx.clone();
        let version = self.version.clone();
        let entry = CachedResponse::from_response(response);

        let handle = tokio::spawn(async move {
            let mut storage = caches.write().await;
            let result = match storage.get_mut(&version) {
                Some(cache) => cache.put(&Method::GET, &url, entry),
                None => Err(ServiceWorkerError::CacheError(format!(
                    "cache store {version} no longer exists"
                ))),
            };
            drop(storage);

            match result {
                Ok(()) => {
                    trace!(url = %url, version = %version, "Cached network response");
                    let _ = events.send(LifecycleEvent::CacheWritten {
                        version,
                        url: url.to_string(),
                    });
                    true
                }
                Err(e) => {
                    warn!(url = %url, version = %version, error = %e, "Cache write failed");
                    let _ = events.send(LifecycleEvent::CacheWriteFailed {
                        version,
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                    false
                }
            }
        });

        CacheWrite { handle }
    }

    async fn offline_fallback(&self, kind: RequestKind, url: Url) -> Response {
        let substitute = match kind {
            RequestKind::Navigation => &self.offline_page,
            RequestKind::Image => &self.offline_image,
            RequestKind::Api => return fallback::offline_api_response(url),
            RequestKind::Other => return fallback::service_unavailable(url),
        };

        match self.lookup(substitute).await {
            Some(cached) => cached.to_response(),
            None => {
                warn!(url = %url, substitute = %substitute, "Offline fallback not cached");
                fallback::service_unavailable(url)
            }
        }
    }

    // ==================== Message ====================

    /// Message phase. `SKIP_WAITING` activates this version if it is
    /// waiting; otherwise the message is ignored.
    pub async fn message(
        &self,
        message: ClientMessage,
    ) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        match message {
            ClientMessage::SkipWaiting => {
                let flagged = self
                    .registration
                    .write()
                    .await
                    .request_skip_waiting(&self.version);

                if !flagged {
                    debug!(version = %self.version, "SKIP_WAITING ignored, not waiting");
                    return Ok(None);
                }

                info!(version = %self.version, "SKIP_WAITING received");
                self.activate_if_eligible().await
            }
        }
    }

    /// Validate a raw JSON payload, then handle it.
    pub async fn message_json(
        &self,
        raw: &str,
    ) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let message = ClientMessage::from_json(raw).map_err(|e| {
            warn!(error = %e, "Rejected client message");
            e
        })?;
        self.message(message).await
    }
}

/// Only same-origin 200 responses to GET requests are written back.
///
/// A fetcher with no origin configured labels every response `Basic`, so the
/// final URL's origin is compared as well.
fn is_cacheable(origin: &Url, method: &Method, response: &Response) -> bool {
    *method == Method::GET
        && response.status == 200
        && response.response_type == ResponseType::Basic
        && response.url.origin() == origin.origin()
}
