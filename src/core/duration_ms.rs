//! Serde adapter storing a [`Duration`] as integer milliseconds.
//!
//! Use with `#[serde(with = "lumen_sync::core::duration_ms")]`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serialize as milliseconds.
pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(ms)
}

/// Deserialize from milliseconds.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
