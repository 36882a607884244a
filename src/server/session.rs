//! Server session management.
//!
//! One [`ServerSession`] exists per authenticated websocket. It carries
//! the [`Identity`] that redaction and command routing act on.

use std::fmt;
use std::time::Instant;

/// Session ID (48-bit, random).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerSessionId([u8; 6]);

impl ServerSessionId {
    /// Create a session ID from bytes.
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Generate a random session ID.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Convert to a u64 (zero-padded).
    pub fn to_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[..6].copy_from_slice(&self.0);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Display for ServerSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.to_u64())
    }
}

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// User name the client authenticated as.
    pub user: String,
    /// Whether the user may see privileged state.
    pub privileged: bool,
}

impl Identity {
    /// Regular user.
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: name.into(),
            privileged: false,
        }
    }

    /// Privileged user.
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            user: name.into(),
            privileged: true,
        }
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `init` was sent; commands and deltas flow.
    Active,
    /// The server dropped the session; nothing more is sent.
    Closing,
}

/// Per-client session.
#[derive(Debug, Clone)]
pub struct ServerSession {
    id: ServerSessionId,
    identity: Identity,
    state: SessionState,
    connected_at: Instant,
}

impl ServerSession {
    /// Create an active session.
    pub fn new(id: ServerSessionId, identity: Identity, now: Instant) -> Self {
        Self {
            id,
            identity,
            state: SessionState::Active,
            connected_at: now,
        }
    }

    /// Get the session ID.
    pub fn id(&self) -> ServerSessionId {
        self.id
    }

    /// Authenticated identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Get the session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the session as closing.
    pub fn close(&mut self) {
        self.state = SessionState::Closing;
    }

    /// Check if session is active.
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// When the session was opened.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}
