//! # Repository Module
//!
//! Repositories over the local SQLite store.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Sync Bookkeeping vs Business Rows                    │
//! │                                                                         │
//! │  Application writes                 Sync engine                         │
//! │       │                                  │                              │
//! │       ▼                                  ▼                              │
//! │  EntityRepository ──► journal    ChangeJournalRepository (sync_queue)  │
//! │       │                          IdMappingRepository     (id_mappings) │
//! │       ▼                          SyncMetadataRepository  (singleton)   │
//! │  EntityAdapter per table         RemoteBacklogRepository (parked pulls)│
//! │       │                                  │                              │
//! │       └──────────────┬───────────────────┘                              │
//! │                      ▼                                                  │
//! │               SQLite Database                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every repository method that the engine composes has an associated
//! `*_in` form taking `&mut SqliteConnection`, so a single transaction can
//! span the row write, the mapping and the journal update.
//!
//! ## Available Repositories
//!
//! - [`ChangeJournalRepository`] - Outbound change journal
//! - [`IdMappingRepository`] - Local/remote id mappings
//! - [`SyncMetadataRepository`] - Settings, checkpoint and run lease
//! - [`RemoteBacklogRepository`] - Inbound changes waiting for parents
//! - [`EntityRepository`] - Journaled writes to the synced tables

pub mod backlog;
pub mod entity;
pub mod journal;
pub mod mapping;
pub mod metadata;

pub use backlog::{BacklogEntry, RemoteBacklogRepository};
pub use entity::{EntityAdapter, EntityRegistry, EntityRepository, TableAdapter, UserAdapter};
pub use journal::ChangeJournalRepository;
pub use mapping::IdMappingRepository;
pub use metadata::SyncMetadataRepository;
