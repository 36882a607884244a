//! Lumen - Sync Layer
//!
//! Implements:
//! - Typed commands and the JSON wire messages that carry them
//! - Optimistic predictions with reversible rollback
//! - The client-side store of canonical and predicted state
//! - The ordered command queue with reply correlation and replay

mod command;
mod ledger;
mod message;
mod queue;
mod store;

pub use command::*;
pub use ledger::*;
pub use message::*;
pub use queue::*;
pub use store::*;
