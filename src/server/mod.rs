//! Lumen - Server Library
//!
//! The authoritative half of the protocol:
//! - [`Authenticator`] checks the credentials in the connection URL
//! - [`Broadcaster`] batches mutations and redacts deltas per identity
//! - [`ServerSession`] tracks one authenticated client
//! - [`LumenServer`] runs the websocket listener and the single actor that
//!   owns state and domain logic

mod auth;
mod broadcaster;
#[allow(clippy::module_inception)]
mod server;
mod session;

pub use auth::*;
pub use broadcaster::*;
pub use server::*;
pub use session::*;
