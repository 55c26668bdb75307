//! Network fetcher backed by `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{NetError, Request, RequestMode, Response, ResponseType};

/// Anything that can turn a request into a response off the network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. An `Err` means the network itself failed;
    /// HTTP error statuses come back as `Ok`.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        (**self).fetch(request).await
    }
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Origin of the page issuing requests; decides basic vs cors/opaque.
    /// `None` treats every response as same-origin.
    pub origin: Option<Url>,
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Timeout applied when the request does not carry its own.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            origin: None,
            user_agent: format!("ShellKit/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Some(Duration::from_secs(30)),
            max_redirects: 10,
        }
    }
}

impl LoaderConfig {
    /// Config for pages served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin: Some(origin),
            ..Default::default()
        }
    }
}

/// Resource loader for fetching URLs.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = ?config.origin.as_ref().map(|o| o.as_str()), "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn is_cross_origin(&self, url: &Url) -> bool {
        self.config
            .origin
            .as_ref()
            .is_some_and(|origin| origin.origin() != url.origin())
    }

    fn response_type(&self, request: &Request, final_url: &Url) -> ResponseType {
        if !self.is_cross_origin(final_url) {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        if request.mode == RequestMode::SameOrigin && self.is_cross_origin(&request.url) {
            warn!(url = %request.url, "Cross-origin request in same-origin mode");
            return Err(NetError::InvalidRequest(format!(
                "{} is cross-origin",
                request.url
            )));
        }

        let timeout = request.timeout.or(self.config.default_timeout);

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let timed_out = |e: reqwest::Error| {
            if e.is_timeout() {
                NetError::Timeout(timeout.unwrap_or_default())
            } else {
                NetError::HttpError(e)
            }
        };

        let response = req_builder.send().await.map_err(timed_out)?;

        let final_url = response.url().clone();
        let response_type = self.response_type(&request, &final_url);

        if response_type == ResponseType::Opaque {
            trace!(url = %final_url, "Opaque response");
            return Ok(Response::opaque(final_url));
        }

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(timed_out)?;

        trace!(
            url = %final_url,
            status,
            response_type = %response_type,
            body_len = body.len(),
            "Response received"
        );

        let mut out = Response::new(final_url, status)
            .with_body(body)
            .with_type(response_type);
        out.headers = headers;
        Ok(out)
    }
}
