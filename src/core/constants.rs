//! Protocol constants.
//!
//! Wire-level values are fixed by the protocol. Timing values are the
//! defaults used by `ClientConfig` and may be overridden per client.

use std::time::Duration;

// =============================================================================
// PROTOCOL VERSIONS
// =============================================================================

/// Protocol version announced by this crate's server in `init`.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest server protocol version a client will talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Servers announcing less than this get a one-time, non-blocking warning.
pub const RECOMMENDED_PROTOCOL_VERSION: u32 = 3;

// =============================================================================
// WIRE TAGS
// =============================================================================

/// Server reply to a client transaction.
pub const MSG_REPLY: &str = "reply";

/// Full snapshot sent once per connection after authentication.
pub const MSG_INIT: &str = "init";

/// Canonical state change.
pub const MSG_STORE_DELTA: &str = "store-delta";

/// Server-forced connection failure.
pub const MSG_ERROR: &str = "error";

/// Query parameter carrying the client identity in the connection URL.
pub const QUERY_USER: &str = "user";

/// Query parameter carrying the client credential in the connection URL.
pub const QUERY_SECRET: &str = "secret";

// =============================================================================
// STATE TREE
// =============================================================================

/// Keys starting with this character are server-local and never leave the
/// process: they are skipped by every diff and dropped by every public clone.
pub const PRIVATE_KEY_PREFIX: char = '_';

// =============================================================================
// TIMING CONSTANTS - CONNECTION
// =============================================================================

/// How long a connection attempt may race before it counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// How long a sent command may wait for its reply before the connection
/// is considered broken.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(7);

/// First reconnect delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Upper bound on the reconnect delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(16);

// =============================================================================
// TIMING CONSTANTS - COMMANDS & PREDICTIONS
// =============================================================================

/// Outstanding work older than this flips the `stalling` flag.
pub const STALL_THRESHOLD: Duration = Duration::from_millis(500);

/// Default time a prediction stays applied after its reply.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(2);

// =============================================================================
// TIMING CONSTANTS - PERSISTENCE
// =============================================================================

/// Minimum spacing between two rewrites of the persisted state.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);

// =============================================================================
// SERVER
// =============================================================================

/// Default listen address for the server.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8480";

/// Default websocket path served by the server and used by literal endpoints.
pub const DEFAULT_SYNC_PATH: &str = "/sync";

/// Default listen port, used when expanding a controller identifier to its
/// local-network address.
pub const DEFAULT_PORT: u16 = 8480;

// =============================================================================
// ENDPOINT EXPANSION
// =============================================================================

/// Domain a controller identifier is resolved under on the local network.
pub const DEFAULT_LOCAL_DOMAIN: &str = "local";

/// Domain of the remote relay that forwards to a controller.
pub const DEFAULT_RELAY_DOMAIN: &str = "relay.lumen-hub.net";
