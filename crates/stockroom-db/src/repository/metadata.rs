//! # Sync Metadata Repository
//!
//! The singleton `sync_metadata` row (id = 1): settings, the pull
//! checkpoint, and the persisted half of the sync lock.
//!
//! The row is created lazily on first access with defaults: sync disabled,
//! 15 minute interval, `server_wins`, and a fresh device id.
//!
//! ## Lease Columns
//! `lock_expires_at` is written only through [`try_acquire_lease`] and
//! [`release_lease`]; nothing else in the workspace touches it.
//!
//! [`try_acquire_lease`]: SyncMetadataRepository::try_acquire_lease
//! [`release_lease`]: SyncMetadataRepository::release_lease

use chrono::{DateTime, Duration, SubsecRound, Utc};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DbResult;
use stockroom_core::settings::SettingsUpdate;
use stockroom_core::time::{format_ts, format_ts_micros, parse_ts};
use stockroom_core::{CoreError, ProviderConfig, SyncMetadata};

#[derive(Debug, FromRow)]
struct MetadataRow {
    last_sync_at: Option<String>,
    sync_enabled: i64,
    sync_interval_minutes: i64,
    provider_config: String,
    conflict_strategy: String,
    lock_expires_at: Option<String>,
    device_id: String,
    updated_at: String,
}

impl MetadataRow {
    fn into_metadata(self) -> DbResult<SyncMetadata> {
        let provider = serde_json::from_str::<ProviderConfig>(&self.provider_config)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Stored provider config unreadable, using defaults");
                ProviderConfig::default()
            });

        Ok(SyncMetadata {
            last_sync_at: self.last_sync_at.as_deref().and_then(parse_ts),
            sync_enabled: self.sync_enabled != 0,
            sync_interval_minutes: self.sync_interval_minutes,
            provider,
            conflict_strategy: self.conflict_strategy.parse()?,
            lock_expires_at: self.lock_expires_at.as_deref().and_then(parse_ts),
            device_id: self.device_id,
            updated_at: parse_ts(&self.updated_at).unwrap_or_else(Utc::now),
        })
    }
}

/// Repository for the sync metadata singleton.
#[derive(Debug, Clone)]
pub struct SyncMetadataRepository {
    pool: SqlitePool,
}

impl SyncMetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncMetadataRepository { pool }
    }

    async fn ensure_row_in(conn: &mut SqliteConnection, now: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sync_metadata (id, device_id, updated_at) VALUES (1, ?1, ?2)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(format_ts(now))
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            info!("Sync metadata initialized");
        }
        Ok(())
    }

    /// Reads the metadata row, creating it with defaults if missing.
    pub async fn get(&self) -> DbResult<SyncMetadata> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn).await
    }

    pub async fn get_in(conn: &mut SqliteConnection) -> DbResult<SyncMetadata> {
        Self::ensure_row_in(conn, Utc::now()).await?;
        let row: MetadataRow = sqlx::query_as(
            r#"
            SELECT last_sync_at, sync_enabled, sync_interval_minutes, provider_config,
                   conflict_strategy, lock_expires_at, device_id, updated_at
            FROM sync_metadata WHERE id = 1
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;
        row.into_metadata()
    }

    /// Turns sync on or off globally.
    pub async fn set_enabled(&self, enabled: bool) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        let now = Utc::now();
        Self::ensure_row_in(&mut conn, now).await?;
        sqlx::query("UPDATE sync_metadata SET sync_enabled = ?1, updated_at = ?2 WHERE id = 1")
            .bind(enabled)
            .bind(format_ts(now))
            .execute(&mut *conn)
            .await?;
        info!(enabled, "Sync enabled flag updated");
        Ok(())
    }

    /// Advances the pull checkpoint.
    pub async fn set_last_sync_at(&self, at: DateTime<Utc>) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::set_last_sync_at_in(&mut conn, at).await
    }

    /// The checkpoint is kept at microsecond precision.
    pub async fn set_last_sync_at_in(conn: &mut SqliteConnection, at: DateTime<Utc>) -> DbResult<()> {
        Self::ensure_row_in(conn, at).await?;
        let checkpoint = format_ts_micros(at);
        sqlx::query("UPDATE sync_metadata SET last_sync_at = ?1, updated_at = ?2 WHERE id = 1")
            .bind(&checkpoint)
            .bind(format_ts(at))
            .execute(&mut *conn)
            .await?;
        debug!(last_sync_at = %checkpoint, "Sync checkpoint advanced");
        Ok(())
    }

    /// Applies a validated partial settings update.
    ///
    /// A blank or placeholder credential never replaces a stored one.
    pub async fn apply_settings(&self, update: &SettingsUpdate) -> DbResult<SyncMetadata> {
        update.validate().map_err(CoreError::from)?;
        let strategy = update.strategy().map_err(CoreError::from)?;

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        let current = Self::get_in(&mut tx).await?;

        let provider = update.merge_provider(&current.provider);
        let enabled = update.enabled.unwrap_or(current.sync_enabled);
        let interval = update
            .interval_minutes
            .unwrap_or(current.sync_interval_minutes);
        let strategy = strategy.unwrap_or(current.conflict_strategy);

        sqlx::query(
            r#"
            UPDATE sync_metadata SET
                sync_enabled = ?1,
                sync_interval_minutes = ?2,
                provider_config = ?3,
                conflict_strategy = ?4,
                updated_at = ?5
            WHERE id = 1
            "#,
        )
        .bind(enabled)
        .bind(interval)
        .bind(serde_json::to_string(&provider)?)
        .bind(strategy.as_str())
        .bind(format_ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        let updated = Self::get_in(&mut tx).await?;
        tx.commit().await?;

        info!(
            enabled = updated.sync_enabled,
            interval_minutes = updated.sync_interval_minutes,
            strategy = %updated.conflict_strategy,
            "Sync settings updated"
        );
        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // Lease (used by the sync lock only)
    // -------------------------------------------------------------------------

    /// Writes `lock_expires_at = now + lease` if the stored lease is absent,
    /// expired, or has less than `steal_window` left.
    ///
    /// ## Returns
    /// * `Some(expires_at)` - Lease acquired; pass `expires_at` to
    ///   [`release_lease`](Self::release_lease)
    /// * `None` - Another holder's lease is still live
    pub async fn try_acquire_lease(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        steal_window: Duration,
    ) -> DbResult<Option<DateTime<Utc>>> {
        // stored at millisecond precision; the returned value must match it
        let expires_at = (now + lease).trunc_subsecs(3);
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        Self::ensure_row_in(&mut tx, now).await?;

        let result = sqlx::query(
            r#"
            UPDATE sync_metadata SET lock_expires_at = ?1
            WHERE id = 1
              AND (lock_expires_at IS NULL OR lock_expires_at < ?2)
            "#,
        )
        .bind(format_ts(expires_at))
        .bind(format_ts(now + steal_window))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let acquired = result.rows_affected() == 1;
        debug!(acquired, "Sync lease acquisition attempted");
        Ok(acquired.then_some(expires_at))
    }

    /// Clears the persisted lease if it is still the one written with
    /// `expires_at`. A lease taken over by another holder is left alone.
    ///
    /// ## Returns
    /// `true` if the lease was cleared.
    pub async fn release_lease(&self, expires_at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_metadata SET lock_expires_at = NULL WHERE id = 1 AND lock_expires_at = ?1",
        )
        .bind(format_ts(expires_at))
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected() == 1;
        if !released {
            debug!(expires_at = %format_ts(expires_at), "Lease no longer ours, left in place");
        }
        Ok(released)
    }

    /// Current lease expiry, if any.
    pub async fn lease_expires_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT lock_expires_at FROM sync_metadata WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(raw.flatten().as_deref().and_then(parse_ts))
    }

    /// Overwrites the lease expiry. Test hook for simulating another holder.
    #[cfg(test)]
    pub(crate) async fn force_lease(&self, expires_at: Option<DateTime<Utc>>) -> DbResult<()> {
        sqlx::query("UPDATE sync_metadata SET lock_expires_at = ?1 WHERE id = 1")
            .bind(expires_at.map(format_ts))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
