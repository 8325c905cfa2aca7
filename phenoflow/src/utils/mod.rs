//! Small helpers for timestamps and JSON values.

pub mod json;
pub mod timestamps;

pub use json::{is_empty_value, json_safe_f64, prune_empty};
pub use timestamps::{elapsed_seconds, iso_timestamp, now_utc, Timestamp};
