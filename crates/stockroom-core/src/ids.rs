//! # Identifier Shapes
//!
//! Local records may carry any string identifier (`"C1"`, `"SALE-0042"`, an
//! autoincrement integer), while the cloud mints UUIDs. Whether a value is
//! already in remote shape decides:
//!
//! - PATCH by `id` vs. natural key in the transport
//! - whether POST sends or omits the `id`
//! - whether the translator rewrites a foreign key (idempotence)

use serde_json::Value;
use uuid::Uuid;

/// Returns true if `value` looks like a server identifier
/// (hyphenated `8-4-4-4-12` hex UUID, any version).
pub fn is_remote_id(value: &str) -> bool {
    // 36 chars rules out the simple, braced and urn forms Uuid also accepts
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}

/// Extracts an identifier from a JSON value.
///
/// Strings are taken as-is (blank strings count as absent); integers are
/// rendered in decimal so autoincrement keys behave like string ids.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => n.as_i64().map(|i| i.to_string()),
        _ => None,
    }
}
