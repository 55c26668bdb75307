//! Request classification for offline fallback.

use std::fmt;

use shellkit_net::{Request, RequestDestination};

/// What kind of substitute a request gets when the network is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Top-level page load.
    Navigation,
    /// `<img>` and friends.
    Image,
    /// URL contains the API marker.
    Api,
    Other,
}

impl RequestKind {
    /// Classify a request. Navigation wins over image, image over API.
    pub fn classify(request: &Request, api_marker: &str) -> Self {
        if request.is_navigation() {
            RequestKind::Navigation
        } else if request.destination == RequestDestination::Image {
            RequestKind::Image
        } else if request.url.as_str().contains(api_marker) {
            RequestKind::Api
        } else {
            RequestKind::Other
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Navigation => "navigation",
            RequestKind::Image => "image",
            RequestKind::Api => "api",
            RequestKind::Other => "other",
        };
        f.write_str(name)
    }
}
