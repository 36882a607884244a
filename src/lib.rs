//! # Lumen Sync
//!
//! Optimistic state synchronization between home-automation controllers and
//! their clients. A controller owns one JSON state tree and streams changes
//! to every connected client as merge-patch deltas; clients send commands
//! and may predict their effect locally so the UI reacts before the reply.
//!
//! - **Deltas**: minimal merge-patches over JSON trees, private keys never
//!   leave the server
//! - **Predictions**: reversible local changes, superseded per target and
//!   rolled back cleanly when a command fails
//! - **Resilience**: ordered command queue replayed across reconnects,
//!   racing candidate endpoints with capped exponential backoff
//! - **Redaction**: per-identity deltas on the server side
//!
//! ## Feature Flags
//!
//! - `sync` (default): wire messages, commands, prediction ledger, store, queue
//! - `transport` (default): connection state machine, endpoints, websockets
//! - `client` (default): [`client::ClientSession`] and the tokio [`client::LumenClient`]
//! - `server` (default): broadcaster and the tokio [`server::LumenServer`]
//!
//! ## Modules
//!
//! - [`core`]: constants and error types (always included)
//! - [`delta`]: diff and apply over state trees (always included)
//! - [`sync`], [`transport`], [`client`], [`server`]: feature-gated layers
//!
//! ## Example Usage
//!
//! ```rust
//! use lumen_sync::delta::{apply, diff, StateTree};
//! use serde_json::json;
//!
//! let tree = |v: serde_json::Value| -> StateTree { v.as_object().cloned().unwrap_or_default() };
//! let before = tree(json!({"lights": {"l1": {"on": false, "level": 40}}}));
//! let after = tree(json!({"lights": {"l1": {"on": true, "level": 40}}}));
//!
//! let delta = diff(&after, &before);
//! assert_eq!(serde_json::Value::Object(delta.clone()), json!({"lights": {"l1": {"on": true}}}));
//!
//! let mut replica = before.clone();
//! apply(&mut replica, &delta);
//! assert_eq!(replica, after);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Delta codec (always included)
pub mod delta;

// Sync layer (feature-gated)
#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::delta::{Delta, StateTree, apply, diff};

    #[cfg(feature = "sync")]
    pub use crate::sync::{
        ChangeKind, ClientStore, Command, CommandKind, Ping, Pong, RecallScene, Rename,
        SetState, StoreChange, Target, Toggle,
    };

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        Backoff, ConnectMode, ConnectionState, ConnectionStatus, Credentials, Endpoint,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{ClientConfig, LumenClient, LumenClientBuilder, Prediction};

    #[cfg(feature = "server")]
    pub use crate::server::{
        Authenticator, CommandHandler, Identity, LumenServer, LumenServerBuilder, ServerConfig,
        StaticCredentials,
    };
}

// Re-export commonly used items at crate root
pub use core::{CommandError, ConnectionError, LumenError};
pub use delta::{Delta, StateTree};
