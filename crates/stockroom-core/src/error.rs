//! # Error Types
//!
//! Domain-specific error types for stockroom-core, plus the error
//! classification shared by every layer of the sync engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  stockroom-core errors (this file)                                     │
//! │  ├── CoreError        - Registry / payload errors                      │
//! │  ├── ValidationError  - Settings validation failures                   │
//! │  └── ErrorClass       - RETRYABLE vs PERMANENT                          │
//! │                                                                         │
//! │  stockroom-db errors (separate crate)                                  │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  stockroom-sync errors (separate crate)                                │
//! │  └── SyncError        - Transport, lock, orchestration failures        │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError → journal     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Journal Tags
//! Every error stored on a journal entry starts with `[RETRYABLE]` or
//! `[PERMANENT]`, so the auto-retry pass can discriminate without
//! re-deriving the classification from free text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Table is not part of the sync allow-list.
    #[error("Table '{0}' is not synced")]
    UnknownTable(String),

    /// Table is explicitly excluded from sync.
    #[error("Table '{0}' is excluded from sync")]
    DeniedTable(String),

    /// A record payload could not be interpreted.
    ///
    /// ## When This Occurs
    /// - Journal payload is not a JSON object
    /// - Remote row is missing its `id`
    #[error("Invalid payload for {table}: {reason}")]
    InvalidPayload { table: String, reason: String },

    /// Unknown enum value read from storage or configuration.
    #[error("Unknown {kind} value: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    pub fn invalid_payload(table: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidPayload {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors for user-editable settings.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., URL without scheme).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Error Classification
// =============================================================================

const RETRYABLE_TAG: &str = "[RETRYABLE]";
const PERMANENT_TAG: &str = "[PERMANENT]";

/// Whether a failure is expected to resolve on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network trouble, rate limiting, 5xx, a parent not yet synced.
    Retryable,
    /// Validation, auth, irrecoverable missing parent, corrupted payload.
    Permanent,
}

impl ErrorClass {
    fn tag(self) -> &'static str {
        match self {
            ErrorClass::Retryable => RETRYABLE_TAG,
            ErrorClass::Permanent => PERMANENT_TAG,
        }
    }
}

/// Prefixes `message` with the tag for `class`.
///
/// Already-tagged messages are re-tagged rather than double-tagged.
pub fn tag_message(class: ErrorClass, message: &str) -> String {
    let bare = strip_tag(message);
    format!("{} {}", class.tag(), bare)
}

/// Reads the class back from a stored message.
///
/// Untagged messages (written by older builds) are treated as retryable.
pub fn classify_message(message: &str) -> ErrorClass {
    if message.trim_start().starts_with(PERMANENT_TAG) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Retryable
    }
}

fn strip_tag(message: &str) -> &str {
    let trimmed = message.trim_start();
    trimmed
        .strip_prefix(RETRYABLE_TAG)
        .or_else(|| trimmed.strip_prefix(PERMANENT_TAG))
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagging_round_trip() {
        let msg = tag_message(ErrorClass::Permanent, "missing parent customers:C9");
        assert_eq!(msg, "[PERMANENT] missing parent customers:C9");
        assert_eq!(classify_message(&msg), ErrorClass::Permanent);

        let retag = tag_message(ErrorClass::Retryable, &msg);
        assert_eq!(retag, "[RETRYABLE] missing parent customers:C9");
        assert_eq!(classify_message(&retag), ErrorClass::Retryable);
    }

    #[test]
    fn test_untagged_messages_are_retryable() {
        assert_eq!(classify_message("connection reset"), ErrorClass::Retryable);
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "base_url".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(core_err.to_string(), "Validation error: base_url is required");
    }
}
