//! # stockroom-db: Database Layer for Stockroom Sync
//!
//! Local persistence for the retail store and the sync bookkeeping that
//! rides alongside it.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Stockroom Data Flow                              │
//! │                                                                         │
//! │  sync-agent / stockroom-sync                                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   stockroom-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ Journal       │    │ 001_retail   │  │   │
//! │  │   │ SqlitePool    │◄───│ Mappings      │    │ 002_sync     │  │   │
//! │  │   │ Transactions  │    │ Metadata      │    │ 003_indexes  │  │   │
//! │  │   │               │    │ Backlog       │    │              │  │   │
//! │  │   │               │    │ Entities      │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (WAL)                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Journal, mappings, metadata, backlog and entities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stockroom_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("stockroom.db")).await?;
//!
//! db.metadata().set_enabled(true).await?;
//! db.entities().create(EntityKind::Customer, record).await?;
//! let batch = db.journal().dequeue_pending(50).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::backlog::{BacklogEntry, RemoteBacklogRepository};
pub use repository::entity::{
    EntityAdapter, EntityRegistry, EntityRepository, TableAdapter, UserAdapter,
};
pub use repository::journal::ChangeJournalRepository;
pub use repository::mapping::IdMappingRepository;
pub use repository::metadata::SyncMetadataRepository;
