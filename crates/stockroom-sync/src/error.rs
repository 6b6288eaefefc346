//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Run Control         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Http           │  │  SyncDisabled           │ │
//! │  │  InvalidUrl     │  │  ConnectionFail │  │  AlreadyInProgress      │ │
//! │  │  NotConfigured  │  │  Timeout        │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Database     │  │   Translation   │                              │
//! │  │                 │  │                 │                              │
//! │  │  Database       │  │  WaitingForPar. │  ← retryable                 │
//! │  │  Core           │  │  WaitingForCre. │  ← retryable                 │
//! │  │                 │  │  MissingParent  │  ← permanent                 │
//! │  │                 │  │  ParentFailed   │  ← permanent                 │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every error maps to an [`ErrorClass`]; the class decides the
//! `[RETRYABLE]`/`[PERMANENT]` tag written onto the journal entry.

use thiserror::Error;

use stockroom_core::{CoreError, ErrorClass};
use stockroom_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// PostgREST error code for a foreign key violation.
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid provider URL.
    #[error("Invalid provider URL: {0}")]
    InvalidUrl(String),

    /// No provider URL or credential stored.
    #[error("Cloud provider is not configured")]
    NotConfigured,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Run Control
    // =========================================================================
    /// Sync is switched off in the persisted settings.
    #[error("Sync is disabled")]
    SyncDisabled,

    /// Another run holds the sync lock.
    #[error("Sync already in progress")]
    AlreadyInProgress,

    /// The scheduler is shutting down.
    #[error("Sync scheduler is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// The backend answered with a non-success status.
    #[error("HTTP {status}{}: {message}", code_suffix(.code))]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Could not reach the backend.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request exceeded its timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// A success response whose body could not be used.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Translation Errors
    // =========================================================================
    /// A parent exists locally but has no remote id yet.
    #[error("Waiting for parent {parent}:{parent_id} ({field})")]
    WaitingForParent {
        field: String,
        parent: String,
        parent_id: String,
    },

    /// A parent referenced by a required foreign key does not exist locally.
    #[error("Missing parent {parent}:{parent_id} ({field})")]
    MissingParent {
        field: String,
        parent: String,
        parent_id: String,
    },

    /// The parent's own push failed permanently.
    #[error("Parent {parent}:{parent_id} failed to sync ({field})")]
    ParentFailed {
        field: String,
        parent: String,
        parent_id: String,
    },

    /// A delete for a record whose create has not reached the server yet.
    #[error("Waiting for {table}:{record_id} to be created remotely")]
    WaitingForCreate { table: String, record_id: String },

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Local database failure.
    #[error(transparent)]
    Database(#[from] DbError),

    /// Registry or payload rule violation.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// JSON (de)serialization failure.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Database(DbError::from(err))
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            SyncError::ConnectionFailed(err.to_string())
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                code: None,
                message: err.to_string(),
            }
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Builds an HTTP error.
    pub fn http(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        SyncError::Http {
            status,
            code,
            message: message.into(),
        }
    }

    /// Whether the failure is expected to resolve on its own.
    ///
    /// ## Retryable
    /// - Network failures and timeouts
    /// - 408, 429, 5xx
    /// - 404 (create race) and remote foreign key violations (`23503`)
    /// - A parent that has not been pushed yet, or a delete whose create
    ///   has not
    /// - Local database engine errors (busy, pool exhausted)
    ///
    /// ## Permanent
    /// - Any other 4xx: validation, auth, permission, unique violations
    /// - A parent missing locally, or one whose push failed permanently
    /// - Corrupted payloads, registry violations, configuration errors
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Timeout(_)
            | SyncError::InvalidResponse(_)
            | SyncError::WaitingForParent { .. }
            | SyncError::WaitingForCreate { .. }
            | SyncError::AlreadyInProgress
            | SyncError::ShuttingDown
            | SyncError::ChannelError(_)
            | SyncError::Internal(_) => ErrorClass::Retryable,

            SyncError::Http { status, code, .. } => {
                if code.as_deref() == Some(PG_FOREIGN_KEY_VIOLATION) {
                    return ErrorClass::Retryable;
                }
                match status {
                    404 | 408 | 429 | 500..=599 => ErrorClass::Retryable,
                    _ => ErrorClass::Permanent,
                }
            }

            SyncError::Database(db) if db.is_data_error() => ErrorClass::Permanent,
            SyncError::Database(_) => ErrorClass::Retryable,

            SyncError::MissingParent { .. }
            | SyncError::ParentFailed { .. }
            | SyncError::Core(_)
            | SyncError::SerializationFailed(_)
            | SyncError::InvalidConfig(_)
            | SyncError::InvalidUrl(_)
            | SyncError::NotConfigured
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_)
            | SyncError::SyncDisabled => ErrorClass::Permanent,
        }
    }

    /// Returns true if this error is recoverable and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::NotConfigured
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true for an auth or permission rejection.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::Http { status: 401 | 403, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_classification() {
        assert!(SyncError::http(503, None, "unavailable").is_retryable());
        assert!(SyncError::http(429, None, "slow down").is_retryable());
        assert!(SyncError::http(408, None, "timeout").is_retryable());
        assert!(SyncError::http(404, None, "gone").is_retryable());

        assert!(!SyncError::http(400, Some("22P02".into()), "bad uuid").is_retryable());
        assert!(!SyncError::http(401, None, "jwt expired").is_retryable());
        assert!(!SyncError::http(409, Some("23505".into()), "duplicate").is_retryable());

        // parent row not there yet on the server
        assert!(SyncError::http(409, Some("23503".into()), "fk").is_retryable());
    }

    #[test]
    fn test_translation_classification() {
        let waiting = SyncError::WaitingForParent {
            field: "customer_id".into(),
            parent: "customers".into(),
            parent_id: "C1".into(),
        };
        let missing = SyncError::MissingParent {
            field: "customer_id".into(),
            parent: "customers".into(),
            parent_id: "C1".into(),
        };
        let failed = SyncError::ParentFailed {
            field: "customer_id".into(),
            parent: "customers".into(),
            parent_id: "C1".into(),
        };
        let unsent = SyncError::WaitingForCreate {
            table: "customers".into(),
            record_id: "C1".into(),
        };
        assert_eq!(waiting.class(), ErrorClass::Retryable);
        assert_eq!(unsent.class(), ErrorClass::Retryable);
        assert_eq!(missing.class(), ErrorClass::Permanent);
        assert_eq!(failed.class(), ErrorClass::Permanent);
        assert!(missing.to_string().contains("customers:C1"));
        assert!(failed.to_string().contains("customers:C1"));
    }

    #[test]
    fn test_database_classification() {
        assert!(SyncError::Database(DbError::PoolExhausted).is_retryable());
        assert!(!SyncError::Database(DbError::duplicate("products.sku", "A1")).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::http(400, Some("PGRST204".into()), "unknown column");
        assert_eq!(err.to_string(), "HTTP 400 (PGRST204): unknown column");
        assert!(SyncError::http(401, None, "x").is_auth_error());
        assert!(SyncError::NotConfigured.is_config_error());
    }
}
