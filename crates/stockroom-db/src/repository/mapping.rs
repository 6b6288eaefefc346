//! # Identifier Mapping Repository
//!
//! Persists `(table, local_id) → remote_id` so a record pushed once is
//! always addressed by its server id afterwards, across restarts.
//!
//! Both directions are indexed: the primary key serves outbound lookups,
//! `idx_id_mappings_remote` serves inbound reverse lookups.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::error::DbResult;
use stockroom_core::time::{format_ts, parse_ts};
use stockroom_core::IdMapping;

/// Repository for identifier mappings.
#[derive(Debug, Clone)]
pub struct IdMappingRepository {
    pool: SqlitePool,
}

impl IdMappingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        IdMappingRepository { pool }
    }

    /// Server id for a local id, if mapped.
    pub async fn lookup(&self, table: &str, local_id: &str) -> DbResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        Self::lookup_in(&mut conn, table, local_id).await
    }

    pub async fn lookup_in(
        conn: &mut SqliteConnection,
        table: &str,
        local_id: &str,
    ) -> DbResult<Option<String>> {
        let remote: Option<String> = sqlx::query_scalar(
            "SELECT remote_id FROM id_mappings WHERE table_name = ?1 AND local_id = ?2",
        )
        .bind(table)
        .bind(local_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(remote)
    }

    /// Local id for a server id, if mapped.
    pub async fn reverse_lookup(&self, table: &str, remote_id: &str) -> DbResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        Self::reverse_lookup_in(&mut conn, table, remote_id).await
    }

    pub async fn reverse_lookup_in(
        conn: &mut SqliteConnection,
        table: &str,
        remote_id: &str,
    ) -> DbResult<Option<String>> {
        // newest wins if a remote id was ever mapped twice
        let local: Option<String> = sqlx::query_scalar(
            r#"
            SELECT local_id FROM id_mappings
            WHERE table_name = ?1 AND remote_id = ?2
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(table)
        .bind(remote_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(local)
    }

    /// Records a mapping. A different existing remote id is overwritten
    /// (newest write wins) and logged.
    pub async fn record(&self, table: &str, local_id: &str, remote_id: &str) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::record_in(&mut conn, table, local_id, remote_id, Utc::now()).await
    }

    pub async fn record_in(
        conn: &mut SqliteConnection,
        table: &str,
        local_id: &str,
        remote_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        if let Some(previous) = Self::lookup_in(conn, table, local_id).await? {
            if previous == remote_id {
                return Ok(());
            }
            warn!(
                table = %table,
                local_id = %local_id,
                previous = %previous,
                remote_id = %remote_id,
                "Remapping local id to a different remote id"
            );
        }

        sqlx::query(
            r#"
            INSERT INTO id_mappings (table_name, local_id, remote_id, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (table_name, local_id) DO UPDATE SET
                remote_id = excluded.remote_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(table)
        .bind(local_id)
        .bind(remote_id)
        .bind(format_ts(now))
        .execute(&mut *conn)
        .await?;

        debug!(table = %table, local_id = %local_id, remote_id = %remote_id, "Mapping recorded");
        Ok(())
    }

    /// Drops a mapping. Returns false if none existed.
    pub async fn remove(&self, table: &str, local_id: &str) -> DbResult<bool> {
        let result =
            sqlx::query("DELETE FROM id_mappings WHERE table_name = ?1 AND local_id = ?2")
                .bind(table)
                .bind(local_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Number of mappings for a table (all tables when `None`).
    pub async fn count(&self, table: Option<&str>) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM id_mappings WHERE (?1 IS NULL OR table_name = ?1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// All mappings for a table.
    pub async fn list(&self, table: &str) -> DbResult<Vec<IdMapping>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT table_name, local_id, remote_id, updated_at
            FROM id_mappings WHERE table_name = ?1
            ORDER BY local_id
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(table_name, local_id, remote_id, updated_at)| IdMapping {
                table_name,
                local_id,
                remote_id,
                updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
            })
            .collect())
    }
}
