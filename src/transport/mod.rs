//! Lumen - Transport Layer
//!
//! This module implements connection management:
//!
//! - **Connection state machine**: [`ConnectionMachine`], a sans-IO FSM over
//!   [`ConnectionState`] with racing candidates and injected time
//! - **Backoff**: [`Backoff`], capped exponential reconnect delay
//! - **Endpoints**: [`Endpoint`] expansion into candidate URLs carrying
//!   [`Credentials`]
//! - **Async sockets**: [`LumenSocket`], a tokio-tungstenite websocket task
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Client session / server actor       │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   FSM, backoff, endpoints, sockets      │
//! ├─────────────────────────────────────────┤
//! │         WebSocket (ws / wss)            │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod endpoint;
mod socket;
mod timing;

pub use connection::*;
pub use endpoint::*;
pub use socket::*;
pub use timing::*;
