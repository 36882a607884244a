//! Lumen - Client Library
//!
//! A sans-IO [`ClientSession`] and the tokio [`LumenClient`] that drives it.

#[allow(clippy::module_inception)]
mod client;
mod persist;
mod session;

pub use client::*;
pub use persist::*;
pub use session::*;
