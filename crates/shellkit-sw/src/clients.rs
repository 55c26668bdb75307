//! Open pages and the version controlling each.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,

    pub url: Url,

    /// Version tag of the controlling worker, if any.
    pub controller: Option<String>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened page.
    pub fn add(&mut self, url: Url, controller: Option<String>) -> ClientId {
        let id = ClientId::new();
        self.clients.insert(
            id,
            Client {
                id,
                url,
                controller,
            },
        );
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Number of pages controlled by `version`.
    pub fn controlled_by(&self, version: &str) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller.as_deref() == Some(version))
            .count()
    }

    /// Make `version` the controller of every open page.
    ///
    /// Returns the number of pages whose controller changed.
    pub fn claim(&mut self, version: &str) -> usize {
        let mut changed = 0;
        for client in self.clients.values_mut() {
            if client.controller.as_deref() != Some(version) {
                client.controller = Some(version.to_string());
                changed += 1;
            }
        }
        changed
    }
}
