//! Lumen - Core types, errors, and constants.
//!
//! This module provides the foundational error types and protocol constants.
//! It is always compiled.

mod constants;
pub mod duration_ms;
mod error;

pub use constants::*;
pub use error::*;
