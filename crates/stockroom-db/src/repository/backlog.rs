//! # Inbound Backlog Repository
//!
//! Remote changes that could not be applied locally because one of their
//! foreign keys did not resolve yet (`pending_remote_changes`). They are
//! retried at the start of every pull, parents first, and removed once
//! applied. A newer version of the same remote row replaces the parked one.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::error::DbResult;
use stockroom_core::time::{format_ts, parse_ts};
use stockroom_core::{EntityKind, Record, RemoteChange};

/// A parked remote change.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub change: RemoteChange,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct BacklogRow {
    table_name: String,
    remote_id: String,
    change_type: String,
    data: String,
    server_timestamp: Option<String>,
    attempts: i64,
    last_error: Option<String>,
    received_at: String,
}

impl BacklogRow {
    fn into_entry(self) -> DbResult<BacklogEntry> {
        let data: Record = serde_json::from_str(&self.data)?;
        Ok(BacklogEntry {
            change: RemoteChange {
                table: self.table_name.parse::<EntityKind>()?,
                record_id: self.remote_id,
                change_type: self.change_type.parse()?,
                data,
                server_timestamp: self.server_timestamp.as_deref().and_then(parse_ts),
            },
            attempts: self.attempts,
            last_error: self.last_error,
            received_at: parse_ts(&self.received_at).unwrap_or_else(Utc::now),
        })
    }
}

/// Repository for the inbound backlog.
#[derive(Debug, Clone)]
pub struct RemoteBacklogRepository {
    pool: SqlitePool,
}

impl RemoteBacklogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RemoteBacklogRepository { pool }
    }

    /// Parks a change, or refreshes the parked copy of the same remote row.
    pub async fn save(&self, change: &RemoteChange, reason: &str) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::save_in(&mut conn, change, reason, Utc::now()).await
    }

    pub async fn save_in(
        conn: &mut SqliteConnection,
        change: &RemoteChange,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_remote_changes (
                table_name, remote_id, change_type, data, server_timestamp,
                attempts, last_error, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)
            ON CONFLICT (table_name, remote_id) DO UPDATE SET
                change_type = excluded.change_type,
                data = excluded.data,
                server_timestamp = excluded.server_timestamp,
                attempts = pending_remote_changes.attempts + 1,
                last_error = excluded.last_error
            "#,
        )
        .bind(change.table.table_name())
        .bind(&change.record_id)
        .bind(change.change_type.as_str())
        .bind(serde_json::to_string(&change.data)?)
        .bind(change.server_timestamp.map(format_ts))
        .bind(reason)
        .bind(format_ts(now))
        .execute(&mut *conn)
        .await?;

        debug!(
            table = %change.table,
            remote_id = %change.record_id,
            reason = %reason,
            "Remote change parked in backlog"
        );
        Ok(())
    }

    /// All parked changes, parents first, oldest first within a table.
    ///
    /// Rows that no longer decode are dropped with a warning.
    pub async fn list(&self) -> DbResult<Vec<BacklogEntry>> {
        let rows: Vec<BacklogRow> = sqlx::query_as(
            r#"
            SELECT table_name, remote_id, change_type, data, server_timestamp,
                   attempts, last_error, received_at
            FROM pending_remote_changes
            ORDER BY received_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let (table, remote_id) = (row.table_name.clone(), row.remote_id.clone());
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(table = %table, remote_id = %remote_id, error = %e, "Dropping unreadable backlog entry");
                    self.remove_raw(&table, &remote_id).await?;
                }
            }
        }
        entries.sort_by_key(|e| e.change.table.level());
        Ok(entries)
    }

    /// Removes a parked change once applied.
    pub async fn remove_in(
        conn: &mut SqliteConnection,
        table: EntityKind,
        remote_id: &str,
    ) -> DbResult<()> {
        sqlx::query("DELETE FROM pending_remote_changes WHERE table_name = ?1 AND remote_id = ?2")
            .bind(table.table_name())
            .bind(remote_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn remove_raw(&self, table: &str, remote_id: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM pending_remote_changes WHERE table_name = ?1 AND remote_id = ?2")
            .bind(table)
            .bind(remote_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of parked changes.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_remote_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
