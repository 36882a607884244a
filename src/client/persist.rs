//! Local persistence of the last known state.
//!
//! A client can show the last canonical state it saw before it reconnects.
//! Storage is an external collaborator behind [`StatePersistence`]; writes
//! are debounced by [`Debouncer`] so bursts of deltas cost one rewrite.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{PERSIST_DEBOUNCE, PersistError};
use crate::delta::StateTree;
use crate::transport::Endpoint;

/// A server this client has connected to successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownServer {
    /// Endpoint as configured.
    pub endpoint: Endpoint,
    /// User the client authenticated as.
    pub user: String,
    /// Protocol version the server announced last time.
    pub protocol_version: u32,
}

/// Everything written to local storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Last canonical state, public keys only.
    #[serde(default)]
    pub state: StateTree,
    /// Servers connected to before, most recent first.
    #[serde(default)]
    pub known_servers: Vec<KnownServer>,
}

impl PersistedState {
    /// Record a successful connection, moving the server to the front.
    pub fn remember(&mut self, server: KnownServer) {
        self.known_servers
            .retain(|s| !(s.endpoint == server.endpoint && s.user == server.user));
        self.known_servers.insert(0, server);
    }
}

/// Storage backend for [`PersistedState`].
pub trait StatePersistence: Send {
    /// Load the stored state, `None` if nothing was stored yet.
    fn load(&self) -> Result<Option<PersistedState>, PersistError>;

    /// Replace the stored state.
    fn save(&self, state: &PersistedState) -> Result<(), PersistError>;
}

/// Stores state as a JSON document at a path.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatePersistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<PersistedState>, PersistError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        // The previous file stays intact until the new one is complete.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "persisted state");
        Ok(())
    }
}

/// Coalesces change notifications into at most one write per window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(PERSIST_DEBOUNCE)
    }
}

impl Debouncer {
    /// Create a debouncer with the given window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Note a change. The first change in a window arms the deadline.
    pub fn touch(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// When a write is due.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a write is due at `now`. Disarms when it is.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if d <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
