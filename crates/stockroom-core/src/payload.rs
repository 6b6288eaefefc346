//! # Record Shaping
//!
//! Converts records between the local SQLite shape and the cloud shape.
//!
//! ```text
//!   local (SQLite)                         remote (PostgREST)
//!   ─────────────────                      ─────────────────────
//!   full_name: "Ana"        ── rename ──►  display_name: "Ana"
//!   is_active: 1            ── bool   ──►  is_active: true
//!   attributes: "{\"a\":1}" ── json   ──►  attributes: {"a": 1}
//!   legacy_col: ...         ── drop   ──►  (unknown columns never leave)
//! ```
//!
//! Both directions only emit columns the table declares, so a table without
//! `updated_at` never has one injected.

use serde_json::Value;

use crate::tables::TableSpec;
use crate::Record;

/// Shapes a local record for the wire.
pub fn to_remote(spec: &TableSpec, record: &Record) -> Record {
    let mut out = Record::new();
    for (column, value) in record {
        if !spec.has_column(column) {
            continue;
        }
        let value = if spec.bool_columns.contains(&column.as_str()) {
            to_bool(value)
        } else if spec.json_columns.contains(&column.as_str()) {
            to_native_json(value)
        } else {
            value.clone()
        };
        out.insert(remote_name(spec, column).to_string(), value);
    }
    out
}

/// Normalizes a server row into local field names and storage types.
pub fn from_remote(spec: &TableSpec, row: &Record) -> Record {
    let mut out = Record::new();
    for (field, value) in row {
        let column = local_name(spec, field);
        if !spec.has_column(column) {
            continue;
        }
        let value = if spec.bool_columns.contains(&column) {
            to_flag(value)
        } else if spec.json_columns.contains(&column) {
            to_json_text(value)
        } else {
            value.clone()
        };
        out.insert(column.to_string(), value);
    }
    out
}

/// Remote name of a local column.
pub fn remote_name<'a>(spec: &TableSpec, local: &'a str) -> &'a str {
    spec.renames
        .iter()
        .find(|(_, l)| *l == local)
        .map(|(remote, _)| *remote)
        .unwrap_or(local)
}

/// Local name of a remote field.
pub fn local_name<'a>(spec: &TableSpec, remote: &'a str) -> &'a str {
    spec.renames
        .iter()
        .find(|(r, _)| *r == remote)
        .map(|(_, local)| *local)
        .unwrap_or(remote)
}

fn to_bool(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Bool(n.as_i64().map(|i| i != 0).unwrap_or(false)),
        Value::String(s) => match s.trim() {
            "1" | "true" | "TRUE" | "t" => Value::Bool(true),
            "0" | "false" | "FALSE" | "f" | "" => Value::Bool(false),
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}

fn to_flag(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::from(i64::from(*b)),
        _ => value.clone(),
    }
}

fn to_native_json(value: &Value) -> Value {
    match value {
        // unparseable text goes out as-is; the server will reject it if it must
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
        _ => value.clone(),
    }
}

fn to_json_text(value: &Value) -> Value {
    match value {
        Value::Null | Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}
