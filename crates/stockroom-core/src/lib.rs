//! # stockroom-core: Pure Sync Rules for Stockroom
//!
//! This crate holds every rule of the sync engine that can be expressed
//! without touching a database, a socket, or a clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Stockroom Sync Architecture                       │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 stockroom-sync (SyncEngine)                     │   │
//! │  │     sync_all ──► push journal ──► pull remote ──► apply         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ stockroom-core (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐          │   │
//! │  │   │  tables  │ │ payload  │ │ conflict │ │  health  │          │   │
//! │  │   │ registry │ │ shaping  │ │ decision │ │  levels  │          │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────┘          │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  stockroom-db (Database Layer)                  │   │
//! │  │        change journal, id mappings, metadata, entities          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tables`] - Allow-list, deny-list, and dependency order of synced tables
//! - [`types`] - Journal entries, mappings, metadata, remote changes
//! - [`ids`] - Remote identifier shape checks
//! - [`payload`] - Local ⇄ remote record shaping
//! - [`conflict`] - Conflict decision table
//! - [`health`] - Health level derivation
//! - [`settings`] - Validation and merging of user-editable settings
//! - [`error`] - Domain errors and `[RETRYABLE]`/`[PERMANENT]` tagging
//! - [`time`] - Canonical timestamp encoding

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod health;
pub mod ids;
pub mod payload;
pub mod settings;
pub mod tables;
pub mod time;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, ErrorClass, ValidationError};
pub use health::{HealthLevel, SyncHealth};
pub use settings::SettingsUpdate;
pub use tables::{EntityKind, ForeignKey, TableSpec};
pub use types::*;

/// A record as it travels through the engine: column name → JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// How long a journal entry may sit in `syncing` before it is considered
/// orphaned by a crashed run and recovered to `pending`.
pub const STALE_SYNCING_SECS: i64 = 5 * 60;

/// Lease duration written by the sync lock.
pub const LOCK_LEASE_SECS: i64 = 5 * 60;

/// A lease with less than this much time left may be taken over.
pub const LOCK_STEAL_WINDOW_MS: i64 = 1_000;

/// Failed entries older than this are no longer auto-retried.
pub const AUTO_RETRY_MAX_AGE_HOURS: i64 = 24;

/// Column carrying the soft-delete marker on every synced table.
pub const DELETED_AT: &str = "deleted_at";

/// Column carrying the last-modified timestamp (absent on some tables).
pub const UPDATED_AT: &str = "updated_at";

/// Column carrying the creation timestamp.
pub const CREATED_AT: &str = "created_at";
