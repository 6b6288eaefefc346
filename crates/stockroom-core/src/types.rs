//! # Sync Types
//!
//! The data shapes shared by the journal, the engine and the UI.
//!
//! ## Journal Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Journal Entry Lifecycle                           │
//! │                                                                         │
//! │   enqueue ──► pending ──► syncing ──┬──► synced                        │
//! │                  ▲           │      └──► error ──┐                      │
//! │                  │           │ locked_at > 5 min │ [RETRYABLE], aged    │
//! │                  │           ▼                   │ out of its backoff   │
//! │                  └──── recover_stuck ◄───────────┘ window               │
//! │                                                                         │
//! │   conflict entries are parked for manual resolution and never pushed   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::CoreError;
use crate::tables::EntityKind;
use crate::Record;

// =============================================================================
// Change Type
// =============================================================================

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    /// A remote change that collided with unsynced local state under the
    /// `manual` strategy. Carries both versions; never pushed.
    Conflict,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
            ChangeType::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeType::Create),
            "update" => Ok(ChangeType::Update),
            "delete" => Ok(ChangeType::Delete),
            "conflict" => Ok(ChangeType::Conflict),
            other => Err(CoreError::UnknownVariant {
                kind: "change_type",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Where a journal entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            other => Err(CoreError::UnknownVariant {
                kind: "sync_status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Conflict Strategy
// =============================================================================

/// Which side wins when a remote change collides with local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Apply remote unconditionally.
    #[default]
    ServerWins,
    /// Keep local, skip remote.
    ClientWins,
    /// Park both versions as a `conflict` journal entry.
    Manual,
}

impl ConflictStrategy {
    pub const VALUES: [&'static str; 3] = ["server_wins", "client_wins", "manual"];

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "server_wins" => Ok(ConflictStrategy::ServerWins),
            "client_wins" => Ok(ConflictStrategy::ClientWins),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(CoreError::UnknownVariant {
                kind: "conflict_strategy",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Journal
// =============================================================================

/// One durable local change awaiting propagation to the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub change_type: ChangeType,
    /// Record snapshot. `None` for deletes recorded without a snapshot.
    pub payload: Option<Value>,
    pub sync_status: SyncStatus,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    /// The payload as a record map, if it is a JSON object.
    pub fn payload_record(&self) -> Option<&Record> {
        self.payload.as_ref().and_then(Value::as_object)
    }
}

/// Why `enqueue` did not write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Sync is globally disabled.
    SyncDisabled,
    /// An entry for the same triple is currently being pushed.
    InFlight,
}

/// Result of `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "value")]
pub enum EnqueueOutcome {
    Inserted(i64),
    Requeued(i64),
    Skipped(SkipReason),
}

impl EnqueueOutcome {
    /// Journal id written, if any.
    pub fn entry_id(&self) -> Option<i64> {
        match self {
            EnqueueOutcome::Inserted(id) | EnqueueOutcome::Requeued(id) => Some(*id),
            EnqueueOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, EnqueueOutcome::Skipped(_))
    }
}

/// Journal counts by status, for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct JournalCounts {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    /// All `error` entries, retryable or not.
    pub errors: i64,
    /// `error` entries tagged `[PERMANENT]`.
    pub permanent_errors: i64,
    /// `syncing` entries past the staleness window.
    pub stuck: i64,
    /// Unresolved `conflict` entries.
    pub conflicts: i64,
}

// =============================================================================
// Identifier Mapping
// =============================================================================

/// Local id ⇄ server id correspondence for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub table_name: String,
    pub local_id: String,
    pub remote_id: String,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Metadata
// =============================================================================

/// Connection details for the cloud backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the REST endpoint, e.g. `https://x.example.co/rest/v1`.
    pub base_url: String,
    /// Sent as the `apikey` header.
    pub api_key: String,
    /// Sent as `Authorization: Bearer`. Falls back to `api_key` when absent.
    pub access_token: Option<String>,
}

impl ProviderConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    pub fn bearer(&self) -> &str {
        self.access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.api_key)
    }
}

/// The singleton sync settings/state row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_enabled: bool,
    pub sync_interval_minutes: i64,
    pub provider: ProviderConfig,
    pub conflict_strategy: ConflictStrategy,
    /// Written only by the sync lock.
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Remote Changes
// =============================================================================

/// One change enumerated from the cloud, already in local field shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub table: EntityKind,
    /// Server-side id.
    pub record_id: String,
    pub change_type: ChangeType,
    pub data: Record,
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl RemoteChange {
    /// True when the remote row carries a soft-delete marker.
    pub fn marks_deleted(&self) -> bool {
        self.data
            .get(crate::DELETED_AT)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }
}

// =============================================================================
// Run Reports
// =============================================================================

/// Outcome of the inbound half of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PullReport {
    pub fetched: u32,
    pub applied: u32,
    pub ignored: u32,
    pub kept_local: u32,
    pub conflicts: u32,
    /// Parked in the backlog because a foreign key did not resolve yet.
    pub deferred: u32,
    /// Backlog entries that finally applied.
    pub backlog_applied: u32,
    pub failed: u32,
}

/// Outcome of first-contact reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InitialSyncReport {
    pub remote_rows: u32,
    pub downloaded: u32,
    pub enqueued: u32,
    pub deferred: u32,
}

/// Outcome of a full `sync_all` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncReport {
    pub pushed: u32,
    pub failed: u32,
    /// Waiting for a parent mapping; retried later.
    pub deferred: u32,
    /// Remote write acknowledged but local bookkeeping failed.
    pub orphaned: u32,
    pub retried: u32,
    pub backfilled: u32,
    pub initial: Option<InitialSyncReport>,
    pub pull: Option<PullReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_string_forms() {
        for ct in [
            ChangeType::Create,
            ChangeType::Update,
            ChangeType::Delete,
            ChangeType::Conflict,
        ] {
            assert_eq!(ct.as_str().parse::<ChangeType>().unwrap(), ct);
            assert_eq!(serde_json::to_value(ct).unwrap(), json!(ct.as_str()));
        }
        for value in ConflictStrategy::VALUES {
            assert_eq!(value.parse::<ConflictStrategy>().unwrap().as_str(), value);
        }
        assert!("synced".parse::<SyncStatus>().is_ok());
        assert!("done".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_default_strategy_is_server_wins() {
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::ServerWins);
    }

    #[test]
    fn test_bearer_falls_back_to_api_key() {
        let mut provider = ProviderConfig {
            base_url: "https://db.example.com/rest/v1".into(),
            api_key: "anon".into(),
            access_token: None,
        };
        assert_eq!(provider.bearer(), "anon");
        provider.access_token = Some("session".into());
        assert_eq!(provider.bearer(), "session");
        assert!(provider.is_configured());
    }

    #[test]
    fn test_marks_deleted() {
        let mut data = Record::new();
        data.insert("id".into(), json!("r1"));
        let mut change = RemoteChange {
            table: EntityKind::Customer,
            record_id: "r1".into(),
            change_type: ChangeType::Update,
            data,
            server_timestamp: None,
        };
        assert!(!change.marks_deleted());
        change.data.insert("deleted_at".into(), json!("2024-01-01T00:00:00Z"));
        assert!(change.marks_deleted());
    }
}
