//! Responses synthesized when neither cache nor network can answer.

use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use serde_json::json;
use shellkit_net::{Response, ResponseType};
use url::Url;

/// Status for every synthesized offline response.
pub const OFFLINE_STATUS: StatusCode = StatusCode::SERVICE_UNAVAILABLE;

/// JSON error returned for API requests while offline.
pub fn offline_api_response(url: Url) -> Response {
    let body = json!({
        "error": "Offline",
        "message": "No internet connection available",
        "offline": true,
    });

    Response::new(url, OFFLINE_STATUS.as_u16())
        .with_type(ResponseType::Synthetic)
        .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .with_header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
        .with_body(body.to_string())
}

/// Plain-text 503 for requests with no dedicated offline substitute.
pub fn service_unavailable(url: Url) -> Response {
    Response::new(url, OFFLINE_STATUS.as_u16())
        .with_type(ResponseType::Synthetic)
        .with_header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .with_header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
        .with_body("Offline")
}
