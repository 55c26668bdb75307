//! End-to-end lifecycle tests: install, activate, fetch, and message against
//! an in-memory network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use shellkit_net::{LoaderConfig, NetError, RequestDestination, ResourceLoader, ResponseType};
use shellkit_sw::{
    request_key, ClientMessage, Fetcher, LifecycleEvent, OfflineController, Request, Response,
    ResponseSource, ServiceWorkerContainer, ServiceWorkerError, ShellConfig, WorkerState,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ORIGIN: &str = "https://portfolio.example/";
const OFFLINE_HTML: &str = "<h1>You are offline</h1>";
const OFFLINE_SVG: &str = "<svg><text>offline</text></svg>";

struct Route {
    status: u16,
    response_type: ResponseType,
    body: Bytes,
}

/// In-memory network. Unknown paths answer 404.
struct MockNetwork {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
    online: AtomicBool,
    hang: AtomicBool,
}

impl MockNetwork {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            hang: AtomicBool::new(false),
        })
    }

    /// Serves every default manifest asset plus both offline fallbacks.
    fn site() -> Arc<Self> {
        let network = Self::empty();
        for path in ShellConfig::default().manifest {
            network.route(&path, 200, format!("asset {path}"));
        }
        network.route("/offline.html", 200, OFFLINE_HTML);
        network.route("/offline.svg", 200, OFFLINE_SVG);
        network
    }

    fn route(&self, path: &str, status: u16, body: impl Into<Bytes>) {
        self.route_typed(path, status, ResponseType::Basic, body);
    }

    fn route_typed(
        &self,
        path: &str,
        status: u16,
        response_type: ResponseType,
        body: impl Into<Bytes>,
    ) {
        self.route_absolute(url(path), status, response_type, body);
    }

    fn route_absolute(
        &self,
        target: Url,
        status: u16,
        response_type: ResponseType,
        body: impl Into<Bytes>,
    ) {
        self.routes.lock().unwrap().insert(
            target.to_string(),
            Route {
                status,
                response_type,
                body: body.into(),
            },
        );
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    fn calls(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&url(path).to_string())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let key = request_key(&request.url);
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".to_string()));
        }

        let routes = self.routes.lock().unwrap();
        Ok(match routes.get(&key) {
            Some(route) => Response::new(request.url.clone(), route.status)
                .with_type(route.response_type)
                .with_body(route.body.clone()),
            None => Response::new(request.url.clone(), 404),
        })
    }
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn config(version: &str) -> ShellConfig {
    ShellConfig::for_origin(Url::parse(ORIGIN).unwrap()).with_cache_version(version)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> (
    ServiceWorkerContainer,
    mpsc::UnboundedReceiver<LifecycleEvent>,
    Arc<MockNetwork>,
) {
    init_tracing();
    let (container, rx) = ServiceWorkerContainer::new(Url::parse(ORIGIN).unwrap());
    (container, rx, MockNetwork::site())
}

fn controller(
    container: &ServiceWorkerContainer,
    network: &Arc<MockNetwork>,
    config: &ShellConfig,
) -> OfflineController {
    container.controller(config, network.clone()).unwrap()
}

fn drain(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ==================== Install ====================

#[tokio::test]
async fn install_caches_every_manifest_url() {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));

    let report = sw.install().await.unwrap();
    assert_eq!(report.cached, sw.manifest().len());

    let caches = container.caches();
    let storage = caches.read().await;
    let cache = storage.get("v1").unwrap();
    for asset in sw.manifest().resolve(&Url::parse(ORIGIN).unwrap()).unwrap() {
        let hit = cache.match_url(&asset).unwrap();
        assert_eq!(hit.status, 200, "{asset}");
    }
}

#[tokio::test]
async fn first_install_activates_immediately() {
    let (container, mut rx, network) = setup();
    let sw = controller(&container, &network, &config("v1").with_skip_waiting_on_install(false));

    let report = sw.install().await.unwrap();
    assert!(report.activation.is_some());
    assert_eq!(container.active_version().await.as_deref(), Some("v1"));
    assert_eq!(container.state_of("v1").await, Some(WorkerState::Activated));

    let states: Vec<WorkerState> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            LifecycleEvent::StateChange { new_state, .. } => Some(new_state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            WorkerState::Installing,
            WorkerState::Installed,
            WorkerState::Activating,
            WorkerState::Activated,
        ]
    );
}

#[tokio::test]
async fn failed_install_leaves_no_cache() {
    let (container, mut rx, network) = setup();
    network.route("/resume.pdf", 404, "");
    let sw = controller(&container, &network, &config("v1"));

    let err = sw.install().await.unwrap_err();
    match err {
        ServiceWorkerError::InstallFailed { url, reason } => {
            assert!(url.ends_with("/resume.pdf"));
            assert!(reason.contains("404"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(container.cache_names().await.is_empty());
    assert_eq!(container.state_of("v1").await, None);
    assert!(drain(&mut rx).contains(&LifecycleEvent::StateChange {
        version: "v1".to_string(),
        new_state: WorkerState::Redundant,
    }));
}

#[tokio::test]
async fn install_while_offline_fails_without_retry() {
    let (container, _rx, network) = setup();
    network.set_online(false);
    let sw = controller(&container, &network, &config("v1"));

    assert!(matches!(
        sw.install().await,
        Err(ServiceWorkerError::InstallFailed { .. })
    ));
    assert_eq!(network.calls("/"), 1);
    assert!(container.cache_names().await.is_empty());
}

#[tokio::test]
async fn failed_install_can_be_retried_by_host() {
    let (container, _rx, network) = setup();
    network.set_online(false);
    let sw = controller(&container, &network, &config("v1"));
    assert!(sw.install().await.is_err());

    network.set_online(true);
    assert!(sw.install().await.is_ok());
    assert_eq!(container.active_version().await.as_deref(), Some("v1"));
}

// ==================== Activate ====================

#[tokio::test]
async fn activate_deletes_stale_stores() {
    let (container, mut rx, network) = setup();
    container.caches().write().await.open("v-old");

    let sw = controller(&container, &network, &config("v-current"));
    let report = sw.install().await.unwrap();

    let activation = report.activation.unwrap();
    assert_eq!(activation.deleted_caches, vec!["v-old".to_string()]);
    assert_eq!(container.cache_names().await, vec!["v-current".to_string()]);
    assert!(drain(&mut rx).contains(&LifecycleEvent::CacheDeleted {
        name: "v-old".to_string()
    }));
}

#[tokio::test]
async fn activate_claims_open_pages() {
    let (container, _rx, network) = setup();
    let page = container.connect_client(url("/")).await;
    assert!(container.controller_of(page).await.is_none());

    let sw = controller(&container, &network, &config("v1"));
    let activation = sw.install().await.unwrap().activation.unwrap();

    assert_eq!(activation.claimed_clients, 1);
    assert_eq!(container.controller_of(page).await.as_deref(), Some("v1"));

    let later = container.connect_client(url("/#projects")).await;
    assert_eq!(container.controller_of(later).await.as_deref(), Some("v1"));
}

#[tokio::test]
async fn update_waits_while_old_version_controls_pages() {
    let (container, _rx, network) = setup();
    let v1 = controller(&container, &network, &config("v1"));
    v1.install().await.unwrap();
    container.connect_client(url("/")).await;

    let v2 = controller(&container, &network, &config("v2").with_skip_waiting_on_install(false));
    let report = v2.install().await.unwrap();

    assert!(report.activation.is_none());
    assert_eq!(container.active_version().await.as_deref(), Some("v1"));
    assert_eq!(container.waiting_version().await.as_deref(), Some("v2"));
    assert_eq!(
        container.cache_names().await,
        vec!["v1".to_string(), "v2".to_string()]
    );

    assert!(matches!(
        v2.activate().await,
        Err(ServiceWorkerError::StateError(_))
    ));
}

#[tokio::test]
async fn update_activates_once_pages_close() {
    let (container, _rx, network) = setup();
    let v1 = controller(&container, &network, &config("v1"));
    v1.install().await.unwrap();
    let page = container.connect_client(url("/")).await;

    let v2 = controller(&container, &network, &config("v2").with_skip_waiting_on_install(false));
    v2.install().await.unwrap();

    container.disconnect_client(page).await;
    let activation = v2.activate().await.unwrap();

    assert_eq!(activation.deleted_caches, vec!["v1".to_string()]);
    assert_eq!(container.active_version().await.as_deref(), Some("v2"));
    assert_eq!(container.state_of("v1").await, None);
}

#[tokio::test]
async fn skip_waiting_on_install_takes_over_open_pages() {
    let (container, _rx, network) = setup();
    let v1 = controller(&container, &network, &config("v1"));
    v1.install().await.unwrap();
    let page = container.connect_client(url("/")).await;

    let v2 = controller(&container, &network, &config("v2"));
    let activation = v2.install().await.unwrap().activation.unwrap();

    assert_eq!(activation.claimed_clients, 1);
    assert_eq!(container.controller_of(page).await.as_deref(), Some("v2"));
    assert_eq!(container.cache_names().await, vec!["v2".to_string()]);
}

// ==================== Message ====================

#[tokio::test]
async fn skip_waiting_message_activates_waiting_version() {
    let (container, _rx, network) = setup();
    let v1 = controller(&container, &network, &config("v1"));
    v1.install().await.unwrap();
    let page = container.connect_client(url("/")).await;

    let v2 = controller(&container, &network, &config("v2").with_skip_waiting_on_install(false));
    v2.install().await.unwrap();
    assert_eq!(container.state_of("v2").await, Some(WorkerState::Installed));

    let activation = v2
        .message_json(&ClientMessage::SkipWaiting.to_json())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(activation.version, "v2");
    assert_eq!(activation.deleted_caches, vec!["v1".to_string()]);
    assert_eq!(container.state_of("v2").await, Some(WorkerState::Activated));
    assert_eq!(container.controller_of(page).await.as_deref(), Some("v2"));
}

#[tokio::test]
async fn skip_waiting_ignored_by_active_version() {
    let (container, _rx, network) = setup();
    let v1 = controller(&container, &network, &config("v1"));
    v1.install().await.unwrap();

    let result = v1.message(ClientMessage::SkipWaiting).await.unwrap();
    assert!(result.is_none());
    assert_eq!(container.active_version().await.as_deref(), Some("v1"));
}

#[tokio::test]
async fn unknown_message_rejected() {
    let (container, _rx, network) = setup();
    let v1 = controller(&container, &network, &config("v1"));

    let result = v1.message_json(r#"{ "type": "CLEAR_ALL" }"#).await;
    assert!(matches!(result, Err(ServiceWorkerError::InvalidMessage(_))));
}

// ==================== Fetch ====================

#[tokio::test]
async fn second_fetch_is_a_cache_hit() {
    let (container, mut rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();
    network.route("/blog/posts.json", 200, r#"[{"title":"hello"}]"#);

    let first = sw.fetch(Request::get(url("/blog/posts.json"))).await;
    assert_eq!(first.source, ResponseSource::Network);
    assert!(first.is_caching());
    let first = first.settle().await;

    let second = sw.fetch(Request::get(url("/blog/posts.json"))).await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert!(!second.is_caching());
    assert_eq!(second.response.body(), first.body());
    assert_eq!(network.calls("/blog/posts.json"), 1);

    assert!(drain(&mut rx).contains(&LifecycleEvent::CacheWritten {
        version: "v1".to_string(),
        url: url("/blog/posts.json").to_string(),
    }));
}

#[tokio::test]
async fn cache_hit_served_without_revalidation() {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();
    let before = network.calls("/index.html");

    network.route("/index.html", 200, "fresher copy");
    let outcome = sw.fetch(Request::get(url("/index.html"))).await;

    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(outcome.response.text().unwrap(), "asset /index.html");
    assert_eq!(network.calls("/index.html"), before);
}

#[tokio::test]
async fn non_get_request_never_cached() {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();
    network.route("/contact", 200, "thanks");

    let request = Request::post(url("/contact"), Bytes::from_static(b"name=ada"));
    let outcome = sw.fetch(request).await;

    assert_eq!(outcome.source, ResponseSource::Network);
    assert!(!outcome.is_caching());
    assert_eq!(outcome.response.text().unwrap(), "thanks");

    let caches = container.caches();
    let storage = caches.read().await;
    assert!(storage.get("v1").unwrap().match_url(&url("/contact")).is_none());
}

#[tokio::test]
async fn non_get_skips_cache_lookup() {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();

    let request = Request::get(url("/index.html")).method(Method::PUT);
    let outcome = sw.fetch(request).await;

    assert_eq!(outcome.source, ResponseSource::Network);
}

#[tokio::test]
async fn error_and_cross_origin_responses_not_cached() {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();
    network.route("/missing.png", 404, "");
    network.route_typed("/fonts/inter.woff2", 0, ResponseType::Opaque, "");
    network.route_typed("/github/repos", 200, ResponseType::Cors, "[]");

    for path in ["/missing.png", "/fonts/inter.woff2", "/github/repos"] {
        let outcome = sw.fetch(Request::get(url(path))).await;
        assert_eq!(outcome.source, ResponseSource::Network, "{path}");
        assert!(!outcome.is_caching(), "{path}");

        let again = sw.fetch(Request::get(url(path))).await;
        assert_eq!(again.source, ResponseSource::Network, "{path}");
        assert_eq!(network.calls(path), 2, "{path}");
    }
}

#[tokio::test]
async fn foreign_origin_labelled_basic_not_cached() {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();

    let foreign = Url::parse("https://api.github.example/users/repos").unwrap();
    network.route_absolute(foreign.clone(), 200, ResponseType::Basic, "[]");

    let outcome = sw.fetch(Request::get(foreign.clone())).await;
    assert_eq!(outcome.source, ResponseSource::Network);
    assert_eq!(outcome.response.response_type, ResponseType::Basic);
    assert!(!outcome.is_caching());

    let caches = container.caches();
    let storage = caches.read().await;
    assert!(storage.get("v1").unwrap().match_url(&foreign).is_none());
}

#[tokio::test]
async fn default_loader_responses_from_other_origins_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/repos"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    init_tracing();
    let (container, _rx) = ServiceWorkerContainer::new(Url::parse(ORIGIN).unwrap());
    container.caches().write().await.open("v1");
    let loader = Arc::new(ResourceLoader::new(LoaderConfig::default()).unwrap());
    let sw = container.controller(&config("v1"), loader).unwrap();

    let target = Url::parse(&format!("{}/users/repos", server.uri())).unwrap();
    let outcome = sw.fetch(Request::get(target.clone())).await;

    assert_eq!(outcome.response.status, 200);
    assert!(!outcome.is_caching());

    let caches = container.caches();
    let storage = caches.read().await;
    assert!(storage.get("v1").unwrap().match_url(&target).is_none());
}

#[tokio::test]
async fn concurrent_writes_to_one_key_leave_one_entry() {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();
    network.route("/stats.json", 200, "{}");

    let (a, b) = futures::join!(
        sw.fetch(Request::get(url("/stats.json"))),
        sw.fetch(Request::get(url("/stats.json")))
    );
    a.settle().await;
    b.settle().await;

    let caches = container.caches();
    let storage = caches.read().await;
    let cache = storage.get("v1").unwrap();
    let matching = cache
        .keys()
        .into_iter()
        .filter(|k| k.ends_with("/stats.json"))
        .count();
    assert_eq!(matching, 1);
}

#[tokio::test]
async fn cache_write_without_store_is_dropped() {
    let (container, mut rx, network) = setup();
    // Never installed, so there is no "v9" store to write into.
    let sw = controller(&container, &network, &config("v9"));
    network.route("/late.json", 200, "{}");

    let mut outcome = sw.fetch(Request::get(url("/late.json"))).await;
    assert_eq!(outcome.response.status, 200);

    let write = outcome.take_cache_write().unwrap();
    assert!(!write.wait().await);
    assert!(container.cache_names().await.is_empty());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, LifecycleEvent::CacheWriteFailed { version, .. } if version == "v9")));
}

// ==================== Offline fallback ====================

async fn installed_offline() -> (ServiceWorkerContainer, Arc<MockNetwork>, OfflineController) {
    let (container, _rx, network) = setup();
    let sw = controller(&container, &network, &config("v1"));
    sw.install().await.unwrap();
    network.set_online(false);
    (container, network, sw)
}

#[tokio::test]
async fn offline_navigation_gets_offline_page() {
    let (_container, _network, sw) = installed_offline().await;

    let outcome = sw.fetch(Request::navigate(url("/about"))).await;

    assert_eq!(outcome.source, ResponseSource::Fallback);
    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.response.text().unwrap(), OFFLINE_HTML);
}

#[tokio::test]
async fn offline_image_gets_placeholder() {
    let (_container, _network, sw) = installed_offline().await;

    let request = Request::get(url("/images/project-1.png")).destination(RequestDestination::Image);
    let outcome = sw.fetch(request).await;

    assert_eq!(outcome.source, ResponseSource::Fallback);
    assert_eq!(outcome.response.text().unwrap(), OFFLINE_SVG);
}

#[tokio::test]
async fn offline_api_gets_json_error() {
    let (_container, _network, sw) = installed_offline().await;

    let outcome = sw.fetch(Request::get(url("/api/visitors"))).await;

    assert_eq!(outcome.source, ResponseSource::Fallback);
    assert_eq!(outcome.response.status, 503);
    let body: serde_json::Value = outcome.response.json().unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "error": "Offline",
            "message": "No internet connection available",
            "offline": true
        })
    );
}

#[tokio::test]
async fn offline_other_gets_service_unavailable() {
    let (_container, _network, sw) = installed_offline().await;

    let outcome = sw.fetch(Request::get(url("/src/components/Blog.jsx"))).await;

    assert_eq!(outcome.source, ResponseSource::Fallback);
    assert_eq!(outcome.response.status, 503);
    assert_eq!(outcome.response.text().unwrap(), "Offline");
}

#[tokio::test]
async fn offline_cached_asset_still_served() {
    let (_container, _network, sw) = installed_offline().await;

    let outcome = sw.fetch(Request::get(url("/src/index.css"))).await;

    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(outcome.response.text().unwrap(), "asset /src/index.css");
}

#[tokio::test]
async fn offline_navigation_without_cached_page_gets_503() {
    let (container, _network, sw) = installed_offline().await;
    container
        .caches()
        .write()
        .await
        .get_mut("v1")
        .unwrap()
        .delete(&url("/offline.html"));

    let outcome = sw.fetch(Request::navigate(url("/about"))).await;

    assert_eq!(outcome.source, ResponseSource::Fallback);
    assert_eq!(outcome.response.status, 503);
}

#[tokio::test(start_paused = true)]
async fn hanging_network_times_out_into_fallback() {
    let (container, _rx, network) = setup();
    network.set_hang(true);
    let config = config("v1").with_network_timeout(Some(Duration::from_secs(5)));
    let sw = controller(&container, &network, &config);

    let outcome = sw.fetch(Request::get(url("/api/github"))).await;

    assert_eq!(outcome.source, ResponseSource::Fallback);
    assert_eq!(outcome.response.status, 503);
}
