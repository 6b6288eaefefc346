//! # Database Migrations
//!
//! Embedded, versioned SQL migrations. Schema changes happen here, once, at
//! startup; no code path inspects columns at runtime.
//!
//! ## Migration Set
//! ```text
//! migrations/sqlite/
//! ├── 001_retail_schema.sql   # the thirteen synced tables (+ local-only)
//! ├── 002_sync_tables.sql     # sync_queue, id_mappings, sync_metadata,
//! │                           # pending_remote_changes
//! └── 003_sync_indexes.sql    # drain order, reverse lookups, FK lookups
//! ```
//!
//! ## Adding New Migrations
//!
//! 1. Create a new file in `migrations/sqlite/` with the next sequence number
//! 2. Write idempotent SQL (use `IF NOT EXISTS` where possible)
//! 3. **NEVER** modify existing migrations - always add new ones

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

/// Embedded migrations from the `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations.
///
/// Applied versions are tracked in `_sqlx_migrations`; each migration runs
/// in its own transaction.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Returns `(total_migrations, applied_migrations)` for diagnostics.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((total, applied as usize))
}
