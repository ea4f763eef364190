//! Serde helpers.

pub mod duration;
pub mod duration_ms;
pub mod hash_map;
