//! # stockroom-sync: Sync Engine for Stockroom
//!
//! Moves changes between the local SQLite store and a PostgREST-style cloud
//! backend, in both directions, without ever losing a local edit.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncScheduler (background loop)                 │  │
//! │  │          interval tick │ manual trigger │ journal cleanup        │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │  ┌────────────────────────────▼─────────────────────────────────────┐  │
//! │  │                    SyncEngine (orchestrator)                     │  │
//! │  │                                                                  │  │
//! │  │   SyncLock ─► initial sync ─► push journal ─► pull remote        │  │
//! │  └──────┬───────────────────────┬───────────────────────┬───────────┘  │
//! │         ▼                       ▼                       ▼               │
//! │  ┌──────────────┐  ┌────────────────────────┐  ┌──────────────────┐    │
//! │  │ stockroom-db │  │  ForeignKeyTranslator  │  │  CloudBackend    │    │
//! │  │              │  │                        │  │  (RestTransport) │    │
//! │  │ journal      │  │  local ids ⇄ remote    │  │                  │    │
//! │  │ id mappings  │  │  parent auto-enqueue   │  │  PATCH → POST    │    │
//! │  │ backlog      │  │                        │  │  paged GETs      │    │
//! │  └──────────────┘  └────────────────────────┘  └──────────────────┘    │
//! │                                                                         │
//! │  OFFLINE-FIRST: every local write is journaled first and pushed later.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] - `SyncEngine`: push, pull, initial sync, conflict resolution
//! - [`transport`] - `CloudBackend` trait and the PostgREST client
//! - [`translator`] - Foreign key rewriting between id spaces
//! - [`lock`] - Single-run lock backed by a persisted lease
//! - [`scheduler`] - Background loop and event emitter
//! - [`config`] - TOML + environment configuration
//! - [`error`] - `SyncError` and its retryable/permanent classification

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod scheduler;
pub mod translator;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{EngineSettings, HttpSettings, SyncConfig};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use lock::{LockToken, SyncLock};
pub use scheduler::{NoOpEmitter, SchedulerHandle, SyncEventEmitter, SyncScheduler};
pub use translator::{ForeignKeyTranslator, Inbound, Outbound};
pub use transport::{CloudBackend, RestTransport, UpsertOperation, UpsertOutcome};
