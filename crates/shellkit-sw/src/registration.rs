//! Installing / waiting / active slots and the worker state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed or replaced by a newer version.
    Redundant,
}

/// One deployed version of the controller.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,

    /// Cache version tag this worker owns.
    pub version: String,

    pub state: WorkerState,

    /// Set by install or a `SKIP_WAITING` message.
    pub skip_waiting: bool,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl Worker {
    pub fn new(version: &str) -> Self {
        Self {
            id: WorkerId::new(),
            version: version.to_string(),
            state: WorkerState::Parsed,
            skip_waiting: false,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }
}

/// Result of trying to move a waiting worker into the active slot.
#[derive(Debug)]
pub enum Promotion {
    /// Now activating; carries the worker it replaced, already redundant.
    Promoted { replaced: Option<Worker> },
    /// Still waiting: the current version controls open pages.
    Blocked { controlled_clients: usize },
    /// The version is not in the waiting slot.
    NotWaiting,
}

/// Registration for one scope.
#[derive(Debug)]
pub struct Registration {
    pub scope: Url,

    pub installing: Option<Worker>,

    /// Installed but not active.
    pub waiting: Option<Worker>,

    pub active: Option<Worker>,
}

impl Registration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    fn slots(&self) -> impl Iterator<Item = &Worker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
    }

    /// State of the worker owning `version`, if it holds a slot.
    pub fn state_of(&self, version: &str) -> Option<WorkerState> {
        self.slots().find(|w| w.version == version).map(|w| w.state)
    }

    pub fn active_version(&self) -> Option<&str> {
        self.active.as_ref().map(|w| w.version.as_str())
    }

    pub fn waiting_version(&self) -> Option<&str> {
        self.waiting.as_ref().map(|w| w.version.as_str())
    }

    /// Start installing `version`. An older installing worker becomes redundant.
    pub fn begin_install(&mut self, version: &str) -> Result<WorkerId, ServiceWorkerError> {
        let already = [&self.waiting, &self.active]
            .into_iter()
            .flatten()
            .any(|w| w.version == version);
        if already {
            return Err(ServiceWorkerError::state(format!(
                "version {version} is already installed"
            )));
        }

        if let Some(mut old) = self.installing.take() {
            old.set_state(WorkerState::Redundant);
        }

        let mut worker = Worker::new(version);
        worker.set_state(WorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        Ok(id)
    }

    /// Move the installing worker to the waiting slot.
    pub fn install_complete(&mut self, version: &str) -> Result<(), ServiceWorkerError> {
        let mut worker = match self.installing.take() {
            Some(w) if w.version == version => w,
            other => {
                self.installing = other;
                return Err(ServiceWorkerError::state(format!(
                    "version {version} is not installing"
                )));
            }
        };

        worker.set_state(WorkerState::Installed);
        if let Some(mut old) = self.waiting.replace(worker) {
            old.set_state(WorkerState::Redundant);
        }
        Ok(())
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self, version: &str) {
        if self.installing.as_ref().is_some_and(|w| w.version == version) {
            if let Some(mut worker) = self.installing.take() {
                worker.set_state(WorkerState::Redundant);
            }
        }
    }

    /// Flag the waiting worker to skip waiting. Returns false if `version`
    /// is not the waiting worker.
    pub fn request_skip_waiting(&mut self, version: &str) -> bool {
        match self.waiting {
            Some(ref mut w) if w.version == version => {
                w.skip_waiting = true;
                true
            }
            _ => false,
        }
    }

    /// Whether the waiting `version` may be promoted now.
    pub fn can_promote(&self, version: &str, controlled_clients: usize) -> bool {
        match self.waiting {
            Some(ref w) if w.version == version => {
                w.skip_waiting || self.active.is_none() || controlled_clients == 0
            }
            _ => false,
        }
    }

    /// Promote the waiting `version` to activating.
    ///
    /// `controlled_clients` is the number of pages the current active
    /// version controls.
    pub fn promote(&mut self, version: &str, controlled_clients: usize) -> Promotion {
        if self.waiting_version() != Some(version) {
            return Promotion::NotWaiting;
        }
        if !self.can_promote(version, controlled_clients) {
            return Promotion::Blocked { controlled_clients };
        }

        let Some(mut worker) = self.waiting.take() else {
            return Promotion::NotWaiting;
        };
        worker.set_state(WorkerState::Activating);

        let replaced = self.active.replace(worker).map(|mut old| {
            old.set_state(WorkerState::Redundant);
            old
        });
        Promotion::Promoted { replaced }
    }

    /// Mark the activating `version` as activated.
    pub fn finish_activation(&mut self, version: &str) -> Result<(), ServiceWorkerError> {
        match self.active {
            Some(ref mut w) if w.version == version && w.state == WorkerState::Activating => {
                w.set_state(WorkerState::Activated);
                Ok(())
            }
            _ => Err(ServiceWorkerError::state(format!(
                "version {version} is not activating"
            ))),
        }
    }
}
