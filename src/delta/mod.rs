//! Lumen - Delta Codec
//!
//! Pure functions over JSON state trees:
//! - [`diff`] computes the minimal merge-patch turning one snapshot into another
//! - [`apply`] applies such a patch in place
//! - [`clone_public`] and [`restrict`] project trees for the wire and for rollback
//!
//! A delta has the same shape as a state tree, except that a `null` leaf
//! means "delete this key". Arrays are always replaced wholesale. Keys
//! starting with [`PRIVATE_KEY_PREFIX`](crate::core::PRIVATE_KEY_PREFIX)
//! never appear in a delta or a public clone.

mod apply;
mod diff;

pub use apply::*;
pub use diff::*;

use serde_json::{Map, Value};

use crate::core::PRIVATE_KEY_PREFIX;

/// A nested mapping of plain values, arrays and nested mappings.
pub type StateTree = Map<String, Value>;

/// A merge-patch over a [`StateTree`]; `null` leaves delete.
pub type Delta = Map<String, Value>;

/// Whether `key` holds server-local bookkeeping that must not reach the wire.
pub fn is_private_key(key: &str) -> bool {
    key.starts_with(PRIVATE_KEY_PREFIX)
}

/// Check if a delta carries no change.
pub fn is_empty(delta: &Delta) -> bool {
    delta.is_empty()
}
