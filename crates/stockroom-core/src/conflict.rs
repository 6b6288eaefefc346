//! # Conflict Resolution
//!
//! Pure decision table applied to every inbound remote change.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  update + deleted_at  ──►  treated as delete                            │
//! │                                                                         │
//! │  local row absent?                                                      │
//! │     delete         ──► Ignore                                           │
//! │     create/update  ──► Adopt                                            │
//! │                                                                         │
//! │  local row present:                                                     │
//! │     conflict = active journal entry  OR  local.updated_at > last_sync   │
//! │                                                                         │
//! │     server_wins ──► ApplyRemote                                         │
//! │     client_wins ──► KeepLocal                                           │
//! │     manual      ──► conflict ? DeferToManual : ApplyRemote              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChangeType, ConflictStrategy};

/// Everything the resolver needs to know about one remote change.
#[derive(Debug, Clone)]
pub struct ConflictInput {
    pub change_type: ChangeType,
    /// The remote row carries a non-null `deleted_at`.
    pub remote_marks_deleted: bool,
    pub local_exists: bool,
    pub local_updated_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// A pending or syncing journal entry exists for the record.
    pub has_active_entry: bool,
    pub strategy: ConflictStrategy,
}

/// What to do with a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// No local row: insert the remote one.
    Adopt,
    /// Nothing to do (delete of a row we never had).
    Ignore,
    /// Overwrite (or soft-delete) the local row.
    ApplyRemote,
    /// Leave local data untouched.
    KeepLocal,
    /// Park both versions for a human.
    DeferToManual,
}

/// The change type conflict evaluation works with.
pub fn effective_change_type(change_type: ChangeType, remote_marks_deleted: bool) -> ChangeType {
    if change_type == ChangeType::Update && remote_marks_deleted {
        ChangeType::Delete
    } else {
        change_type
    }
}

/// Returns true when local state has moved since the last sync boundary.
pub fn is_conflict(input: &ConflictInput) -> bool {
    if input.has_active_entry {
        return true;
    }
    match (input.local_updated_at, input.last_sync_at) {
        (Some(local), Some(boundary)) => local > boundary,
        _ => false,
    }
}

/// Decides what to do with a remote change.
pub fn resolve(input: &ConflictInput) -> Resolution {
    let change = effective_change_type(input.change_type, input.remote_marks_deleted);

    if !input.local_exists {
        return match change {
            ChangeType::Delete => Resolution::Ignore,
            _ => Resolution::Adopt,
        };
    }

    match input.strategy {
        ConflictStrategy::ServerWins => Resolution::ApplyRemote,
        ConflictStrategy::ClientWins => Resolution::KeepLocal,
        ConflictStrategy::Manual => {
            if is_conflict(input) {
                Resolution::DeferToManual
            } else {
                Resolution::ApplyRemote
            }
        }
    }
}

/// A human's answer to a parked `conflict` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Re-push the local version.
    KeepLocal,
    /// Overwrite local with the remote version.
    TakeRemote,
}
