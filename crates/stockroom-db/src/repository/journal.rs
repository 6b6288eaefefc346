//! # Change Journal Repository
//!
//! The durable queue of local changes that must reach the cloud
//! (`sync_queue`).
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Journal Write Path                                   │
//! │                                                                         │
//! │  LOCAL OPERATION (e.g. record a sale)                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. INSERT INTO sales (...) VALUES (...)                       │   │
//! │  │  2. enqueue_in(&mut tx, "sales", id, Create, snapshot)         │   │
//! │  │       ├── sync disabled?             → Skipped(SyncDisabled)   │   │
//! │  │       ├── same triple is syncing?    → Skipped(InFlight)       │   │
//! │  │       ├── same triple exists?        → Requeued (reset)        │   │
//! │  │       └── otherwise                  → Inserted                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← Both succeed or both fail                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Discipline
//! Every operation exists as an associated `*_in` function over a bare
//! `&mut SqliteConnection`. Called on a connection that is already inside a
//! transaction, the internal `begin()` becomes a savepoint, so journal writes
//! compose with entity writes atomically. The `&self` methods acquire a
//! pooled connection and delegate.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use stockroom_core::error::{classify_message, tag_message};
use stockroom_core::time::{format_ts, parse_ts};
use stockroom_core::{
    ChangeType, EnqueueOutcome, EntityKind, ErrorClass, JournalCounts, JournalEntry, SkipReason,
    SyncStatus, AUTO_RETRY_MAX_AGE_HOURS, STALE_SYNCING_SECS,
};

const SELECT_ENTRY: &str = r#"
    SELECT id, table_name, record_id, change_type, payload, sync_status,
           error_message, retry_count, created_at, synced_at, locked_at,
           last_attempt_at
    FROM sync_queue
"#;

/// Exponent cap for the retry backoff window (2^20 s is about 12 days).
const MAX_BACKOFF_EXPONENT: i64 = 20;

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct JournalRow {
    id: i64,
    table_name: String,
    record_id: String,
    change_type: String,
    payload: Option<String>,
    sync_status: String,
    error_message: Option<String>,
    retry_count: i64,
    created_at: String,
    synced_at: Option<String>,
    locked_at: Option<String>,
    last_attempt_at: Option<String>,
}

impl JournalRow {
    /// Strict decode: an unparseable payload is an error.
    fn into_entry(self) -> DbResult<JournalEntry> {
        self.decode(false)
    }

    /// Lossy decode for inspection: an unparseable payload is returned as
    /// its raw text.
    fn into_entry_lossy(self) -> DbResult<JournalEntry> {
        self.decode(true)
    }

    fn decode(self, lossy: bool) -> DbResult<JournalEntry> {
        let payload = match self.payload.as_deref() {
            None => None,
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(value) => Some(value),
                Err(_) if lossy => Some(Value::String(raw.to_string())),
                Err(e) => return Err(e.into()),
            },
        };
        let created_at = parse_ts(&self.created_at).ok_or_else(|| {
            DbError::Internal(format!(
                "sync_queue {} has unreadable created_at '{}'",
                self.id, self.created_at
            ))
        })?;

        Ok(JournalEntry {
            id: self.id,
            change_type: self.change_type.parse()?,
            sync_status: self.sync_status.parse()?,
            table_name: self.table_name,
            record_id: self.record_id,
            payload,
            error_message: self.error_message,
            retry_count: self.retry_count,
            created_at,
            synced_at: self.synced_at.as_deref().and_then(parse_ts),
            locked_at: self.locked_at.as_deref().and_then(parse_ts),
            last_attempt_at: self.last_attempt_at.as_deref().and_then(parse_ts),
        })
    }
}

#[derive(Debug, FromRow)]
struct RetryCandidate {
    id: i64,
    error_message: Option<String>,
    retry_count: i64,
    created_at: String,
    last_attempt_at: Option<String>,
}

/// Validates a table name against the allow-list and deny-list.
pub fn validate_table(table: &str) -> DbResult<EntityKind> {
    table
        .parse::<EntityKind>()
        .map_err(|e| DbError::InvalidTable(e.to_string()))
}

fn stale_cutoff(now: DateTime<Utc>) -> String {
    format_ts(now - Duration::seconds(STALE_SYNCING_SECS))
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the change journal.
#[derive(Debug, Clone)]
pub struct ChangeJournalRepository {
    pool: SqlitePool,
}

impl ChangeJournalRepository {
    /// Creates a new ChangeJournalRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ChangeJournalRepository { pool }
    }

    // -------------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------------

    /// Records a local change for later push.
    ///
    /// ## Arguments
    /// * `table` - Allow-listed table name
    /// * `record_id` - Local id of the changed row
    /// * `change_type` - create / update / delete / conflict
    /// * `payload` - Record snapshot (JSON object), if any
    pub async fn enqueue(
        &self,
        table: &str,
        record_id: &str,
        change_type: ChangeType,
        payload: Option<&Value>,
    ) -> DbResult<EnqueueOutcome> {
        let mut conn = self.pool.acquire().await?;
        Self::enqueue_in(&mut conn, table, record_id, change_type, payload, Utc::now()).await
    }

    /// [`enqueue`](Self::enqueue) on a caller-supplied connection.
    pub async fn enqueue_in(
        conn: &mut SqliteConnection,
        table: &str,
        record_id: &str,
        change_type: ChangeType,
        payload: Option<&Value>,
        now: DateTime<Utc>,
    ) -> DbResult<EnqueueOutcome> {
        let kind = validate_table(table)?;
        if record_id.trim().is_empty() {
            return Err(DbError::Core(stockroom_core::CoreError::invalid_payload(
                table,
                "record id is empty",
            )));
        }
        let payload_text = payload.map(serde_json::to_string).transpose()?;

        let mut tx = conn.begin().await?;

        let enabled: Option<i64> =
            sqlx::query_scalar("SELECT sync_enabled FROM sync_metadata WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await?;
        if enabled.unwrap_or(0) == 0 {
            debug!(table = %kind, record_id = %record_id, "Sync disabled, change not journaled");
            return Ok(EnqueueOutcome::Skipped(SkipReason::SyncDisabled));
        }

        let existing: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, sync_status FROM sync_queue
            WHERE table_name = ?1 AND record_id = ?2 AND change_type = ?3
            "#,
        )
        .bind(kind.table_name())
        .bind(record_id)
        .bind(change_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some((_, status)) if status == SyncStatus::Syncing.as_str() => {
                debug!(
                    table = %kind,
                    record_id = %record_id,
                    change_type = %change_type,
                    "Entry in flight, enqueue skipped"
                );
                EnqueueOutcome::Skipped(SkipReason::InFlight)
            }
            Some((id, _)) => {
                sqlx::query(
                    r#"
                    UPDATE sync_queue SET
                        payload = ?2,
                        sync_status = 'pending',
                        retry_count = 0,
                        error_message = NULL,
                        locked_at = NULL,
                        synced_at = NULL,
                        last_attempt_at = NULL
                    WHERE id = ?1
                    "#,
                )
                .bind(id)
                .bind(&payload_text)
                .execute(&mut *tx)
                .await?;
                EnqueueOutcome::Requeued(id)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO sync_queue (
                        table_name, record_id, change_type, payload,
                        sync_status, retry_count, created_at
                    ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)
                    "#,
                )
                .bind(kind.table_name())
                .bind(record_id)
                .bind(change_type.as_str())
                .bind(&payload_text)
                .bind(format_ts(now))
                .execute(&mut *tx)
                .await?;
                EnqueueOutcome::Inserted(result.last_insert_rowid())
            }
        };

        tx.commit().await?;

        debug!(
            table = %kind,
            record_id = %record_id,
            change_type = %change_type,
            outcome = ?outcome,
            "Change journaled"
        );
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Drain
    // -------------------------------------------------------------------------

    /// Returns up to `limit` pending entries, oldest first.
    ///
    /// Stuck `syncing` entries are recovered first. Entries whose payload is
    /// not valid JSON are permanently failed and left out.
    pub async fn dequeue_pending(&self, limit: u32) -> DbResult<Vec<JournalEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::dequeue_pending_in(&mut conn, limit, Utc::now()).await
    }

    pub async fn dequeue_pending_in(
        conn: &mut SqliteConnection,
        limit: u32,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<JournalEntry>> {
        Self::recover_stuck_items_in(conn, now).await?;

        let rows: Vec<JournalRow> = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE sync_status = 'pending' AND change_type != 'conflict' \
             ORDER BY created_at ASC, id ASC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(entry_id = id, error = %e, "Corrupted journal entry, failing permanently");
                    Self::mark_error_in(
                        conn,
                        id,
                        ErrorClass::Permanent,
                        &format!("corrupted payload: {e}"),
                        now,
                    )
                    .await?;
                }
            }
        }

        Ok(entries)
    }

    /// Resets `syncing` entries orphaned by a crashed run back to `pending`.
    ///
    /// ## Returns
    /// Number of recovered entries.
    pub async fn recover_stuck_items(&self) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        Self::recover_stuck_items_in(&mut conn, Utc::now()).await
    }

    pub async fn recover_stuck_items_in(
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let message = tag_message(
            ErrorClass::Retryable,
            "recovered from stale syncing state (previous run did not finish)",
        );
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                sync_status = 'pending',
                retry_count = retry_count + 1,
                error_message = ?2,
                locked_at = NULL
            WHERE sync_status = 'syncing'
              AND (locked_at IS NULL OR locked_at < ?1)
            "#,
        )
        .bind(stale_cutoff(now))
        .bind(message)
        .execute(&mut *conn)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(recovered, "Recovered stuck journal entries");
        }
        Ok(recovered)
    }

    // -------------------------------------------------------------------------
    // Status Transitions
    // -------------------------------------------------------------------------

    /// pending → syncing. Returns false if the entry was not pending.
    pub async fn mark_syncing(&self, id: i64) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_syncing_in(&mut conn, id, Utc::now()).await
    }

    pub async fn mark_syncing_in(
        conn: &mut SqliteConnection,
        id: i64,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let now = format_ts(now);
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                sync_status = 'syncing',
                locked_at = ?2,
                last_attempt_at = ?2
            WHERE id = ?1 AND sync_status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// → synced. Stamps `synced_at`, clears the lock and any error.
    pub async fn mark_synced(&self, id: i64) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_synced_in(&mut conn, id, Utc::now()).await
    }

    pub async fn mark_synced_in(
        conn: &mut SqliteConnection,
        id: i64,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                sync_status = 'synced',
                synced_at = ?2,
                locked_at = NULL,
                error_message = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(format_ts(now))
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("sync_queue", id.to_string()));
        }
        Ok(())
    }

    /// → error, with a `[RETRYABLE]`/`[PERMANENT]` tagged message.
    pub async fn mark_error(&self, id: i64, class: ErrorClass, message: &str) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_error_in(&mut conn, id, class, message, Utc::now()).await
    }

    pub async fn mark_error_in(
        conn: &mut SqliteConnection,
        id: i64,
        class: ErrorClass,
        message: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                sync_status = 'error',
                error_message = ?2,
                last_attempt_at = ?3,
                locked_at = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(tag_message(class, message))
        .bind(format_ts(now))
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("sync_queue", id.to_string()));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Retry
    // -------------------------------------------------------------------------

    /// Moves retryable failures whose backoff window has elapsed back to
    /// `pending`.
    ///
    /// ## Eligibility
    /// - `error` status, younger than 24h
    /// - tagged `[RETRYABLE]`
    /// - `retry_count < max_retries`
    /// - `2^retry_count` seconds elapsed since `last_attempt_at`
    pub async fn auto_retry_failed_items(&self, max_retries: u32) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        Self::auto_retry_failed_items_in(&mut conn, max_retries, Utc::now()).await
    }

    pub async fn auto_retry_failed_items_in(
        conn: &mut SqliteConnection,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        let oldest = format_ts(now - Duration::hours(AUTO_RETRY_MAX_AGE_HOURS));
        let candidates: Vec<RetryCandidate> = sqlx::query_as(
            r#"
            SELECT id, error_message, retry_count, created_at, last_attempt_at
            FROM sync_queue
            WHERE sync_status = 'error'
              AND change_type != 'conflict'
              AND created_at >= ?1
              AND retry_count < ?2
            "#,
        )
        .bind(oldest)
        .bind(i64::from(max_retries))
        .fetch_all(&mut *conn)
        .await?;

        let mut retried = 0;
        for candidate in candidates {
            let retryable = candidate
                .error_message
                .as_deref()
                .map(classify_message)
                .unwrap_or(ErrorClass::Retryable)
                == ErrorClass::Retryable;
            if !retryable {
                continue;
            }

            let anchor = candidate
                .last_attempt_at
                .as_deref()
                .and_then(parse_ts)
                .or_else(|| parse_ts(&candidate.created_at));
            let window = Duration::seconds(1_i64 << candidate.retry_count.clamp(0, MAX_BACKOFF_EXPONENT));
            if anchor.map(|at| now < at + window).unwrap_or(false) {
                continue;
            }

            let result = sqlx::query(
                r#"
                UPDATE sync_queue SET
                    sync_status = 'pending',
                    retry_count = retry_count + 1
                WHERE id = ?1 AND sync_status = 'error'
                "#,
            )
            .bind(candidate.id)
            .execute(&mut *conn)
            .await?;
            retried += result.rows_affected();
        }

        if retried > 0 {
            info!(retried, "Auto-retrying failed journal entries");
        }
        Ok(retried)
    }

    /// Manually resets failed entries (permanent ones included) to pending
    /// with a fresh retry budget.
    pub async fn reset_failed(&self, table: Option<EntityKind>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                sync_status = 'pending',
                retry_count = 0,
                error_message = NULL,
                last_attempt_at = NULL
            WHERE sync_status = 'error'
              AND change_type != 'conflict'
              AND (?1 IS NULL OR table_name = ?1)
            "#,
        )
        .bind(table.map(EntityKind::table_name))
        .execute(&self.pool)
        .await?;
        info!(reset = result.rows_affected(), "Reset failed journal entries");
        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Gets an entry by id.
    pub async fn get(&self, id: i64) -> DbResult<Option<JournalEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, id).await
    }

    pub async fn get_in(conn: &mut SqliteConnection, id: i64) -> DbResult<Option<JournalEntry>> {
        let row: Option<JournalRow> = sqlx::query_as(&format!("{SELECT_ENTRY} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(JournalRow::into_entry_lossy).transpose()
    }

    /// Gets the entry for a `(table, record, change_type)` triple.
    pub async fn find(
        &self,
        table: EntityKind,
        record_id: &str,
        change_type: ChangeType,
    ) -> DbResult<Option<JournalEntry>> {
        let row: Option<JournalRow> = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE table_name = ?1 AND record_id = ?2 AND change_type = ?3"
        ))
        .bind(table.table_name())
        .bind(record_id)
        .bind(change_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(JournalRow::into_entry_lossy).transpose()
    }

    /// True if a pending or syncing (non-conflict) entry exists for the record.
    pub async fn has_active_entry_in(
        conn: &mut SqliteConnection,
        table: EntityKind,
        record_id: &str,
    ) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM sync_queue
            WHERE table_name = ?1 AND record_id = ?2
              AND sync_status IN ('pending', 'syncing')
              AND change_type != 'conflict'
            LIMIT 1
            "#,
        )
        .bind(table.table_name())
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(found.is_some())
    }

    /// Class of the record's failed push, if any of its entries is in
    /// `error`. A permanent failure outranks a retryable one.
    pub async fn failure_class_in(
        conn: &mut SqliteConnection,
        table: EntityKind,
        record_id: &str,
    ) -> DbResult<Option<ErrorClass>> {
        let messages: Vec<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT error_message FROM sync_queue
            WHERE table_name = ?1 AND record_id = ?2
              AND sync_status = 'error'
              AND change_type != 'conflict'
            "#,
        )
        .bind(table.table_name())
        .bind(record_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut class = None;
        for message in messages {
            match classify_message(message.as_deref().unwrap_or_default()) {
                ErrorClass::Permanent => return Ok(Some(ErrorClass::Permanent)),
                ErrorClass::Retryable => class = Some(ErrorClass::Retryable),
            }
        }
        Ok(class)
    }

    /// True if a create or update for the record has not reached the server
    /// yet (pending, syncing or failed).
    pub async fn has_unsynced_write_in(
        conn: &mut SqliteConnection,
        table: EntityKind,
        record_id: &str,
    ) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM sync_queue
            WHERE table_name = ?1 AND record_id = ?2
              AND sync_status IN ('pending', 'syncing', 'error')
              AND change_type IN ('create', 'update')
            LIMIT 1
            "#,
        )
        .bind(table.table_name())
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(found.is_some())
    }

    /// True if any entry (in any state) exists for the record.
    pub async fn has_any_entry_in(
        conn: &mut SqliteConnection,
        table: EntityKind,
        record_id: &str,
    ) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM sync_queue WHERE table_name = ?1 AND record_id = ?2 LIMIT 1",
        )
        .bind(table.table_name())
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(found.is_some())
    }

    /// Drops pending (not in-flight) pushes for a record whose local row was
    /// just overwritten from the server. Conflict entries are kept.
    ///
    /// ## Returns
    /// Number of dropped entries.
    pub async fn discard_pending_in(
        conn: &mut SqliteConnection,
        table: EntityKind,
        record_id: &str,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE table_name = ?1 AND record_id = ?2
              AND sync_status IN ('pending', 'error')
              AND change_type != 'conflict'
            "#,
        )
        .bind(table.table_name())
        .bind(record_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Unresolved `conflict` entries, oldest first.
    pub async fn list_conflicts(&self) -> DbResult<Vec<JournalEntry>> {
        let rows: Vec<JournalRow> = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE change_type = 'conflict' ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JournalRow::into_entry_lossy).collect()
    }

    /// Counts by status, for health reporting.
    pub async fn counts(&self) -> DbResult<JournalCounts> {
        let now = Utc::now();
        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN sync_status = 'pending' AND change_type != 'conflict' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'syncing' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'synced' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'error' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'error' AND error_message LIKE '[PERMANENT]%' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN sync_status = 'syncing' AND (locked_at IS NULL OR locked_at < ?1) THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN change_type = 'conflict' AND sync_status = 'pending' THEN 1 ELSE 0 END), 0)
            FROM sync_queue
            "#,
        )
        .bind(stale_cutoff(now))
        .fetch_one(&self.pool)
        .await?;

        Ok(JournalCounts {
            pending: row.0,
            syncing: row.1,
            synced: row.2,
            errors: row.3,
            permanent_errors: row.4,
            stuck: row.5,
            conflicts: row.6,
        })
    }

    /// Removes an entry. Returns false if it did not exist.
    pub async fn delete_entry(&self, id: i64) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::delete_entry_in(&mut conn, id).await
    }

    pub async fn delete_entry_in(conn: &mut SqliteConnection, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Deletes synced entries older than `days_old` days.
    ///
    /// ## Returns
    /// Number of deleted entries.
    pub async fn cleanup_synced(&self, days_old: u32) -> DbResult<u64> {
        let cutoff = format_ts(Utc::now() - Duration::days(i64::from(days_old)));
        let result = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE sync_status = 'synced'
              AND synced_at IS NOT NULL
              AND synced_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(deleted = result.rows_affected(), days_old, "Cleaned up synced journal entries");
        }
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.metadata().set_enabled(true).await.unwrap();
        db
    }

    async fn force(db: &Database, sql: &str, id: i64, value: &str) {
        sqlx::query(sql)
            .bind(id)
            .bind(value)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_inserts_then_requeues() {
        let db = setup().await;
        let journal = db.journal();

        let first = journal
            .enqueue("customers", "C1", ChangeType::Create, Some(&json!({"id": "C1", "name": "Ana"})))
            .await
            .unwrap();
        let id = match first {
            EnqueueOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {other:?}"),
        };

        journal
            .mark_error(id, ErrorClass::Retryable, "timeout")
            .await
            .unwrap();

        let second = journal
            .enqueue("customers", "C1", ChangeType::Create, Some(&json!({"id": "C1", "name": "Ana B"})))
            .await
            .unwrap();
        assert_eq!(second, EnqueueOutcome::Requeued(id));

        let entry = journal.get(id).await.unwrap().unwrap();
        assert_eq!(entry.sync_status, SyncStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.error_message.is_none());
        assert_eq!(entry.payload.unwrap()["name"], json!("Ana B"));
    }

    #[tokio::test]
    async fn test_enqueue_skips_in_flight_entry() {
        let db = setup().await;
        let journal = db.journal();

        let id = journal
            .enqueue("customers", "C1", ChangeType::Update, Some(&json!({"name": "A"})))
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        assert!(journal.mark_syncing(id).await.unwrap());

        let outcome = journal
            .enqueue("customers", "C1", ChangeType::Update, Some(&json!({"name": "B"})))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Skipped(SkipReason::InFlight));

        let entry = journal.get(id).await.unwrap().unwrap();
        assert_eq!(entry.payload.unwrap()["name"], json!("A"));
    }

    #[tokio::test]
    async fn test_enqueue_skipped_when_disabled() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let outcome = db
            .journal()
            .enqueue("customers", "C1", ChangeType::Create, None)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Skipped(SkipReason::SyncDisabled));
        assert_eq!(db.journal().counts().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_denied_and_unknown_tables() {
        let db = setup().await;
        for table in ["sync_queue", "app_settings", "widgets"] {
            let err = db
                .journal()
                .enqueue(table, "1", ChangeType::Create, None)
                .await
                .unwrap_err();
            assert!(matches!(err, DbError::InvalidTable(_)), "{table}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_enqueue_inside_outer_transaction_rolls_back_with_it() {
        let db = setup().await;
        {
            let mut tx = db.begin().await.unwrap();
            ChangeJournalRepository::enqueue_in(
                &mut tx,
                "customers",
                "C1",
                ChangeType::Create,
                None,
                Utc::now(),
            )
            .await
            .unwrap();
            tx.rollback().await.unwrap();
        }
        assert_eq!(db.journal().counts().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_creation_and_fails_corrupted_payloads() {
        let db = setup().await;
        let journal = db.journal();
        let a = journal
            .enqueue("customers", "C1", ChangeType::Create, Some(&json!({"id": "C1"})))
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        let b = journal
            .enqueue("customers", "C2", ChangeType::Create, Some(&json!({"id": "C2"})))
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        force(&db, "UPDATE sync_queue SET payload = ?2 WHERE id = ?1", b, "{not json").await;

        let entries = journal.dequeue_pending(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, a);

        let broken = journal.get(b).await.unwrap().unwrap();
        assert_eq!(broken.sync_status, SyncStatus::Error);
        assert_eq!(broken.payload, Some(json!("{not json")));
        assert!(broken.error_message.unwrap().starts_with("[PERMANENT]"));
        let counts = journal.counts().await.unwrap();
        assert_eq!(counts.errors, 1);
        assert_eq!(counts.permanent_errors, 1);
    }

    #[tokio::test]
    async fn test_stuck_entry_recovered_on_dequeue() {
        let db = setup().await;
        let journal = db.journal();
        let id = journal
            .enqueue("customers", "C1", ChangeType::Create, Some(&json!({"id": "C1"})))
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        assert!(journal.mark_syncing(id).await.unwrap());
        let stale = format_ts(Utc::now() - Duration::minutes(6));
        force(&db, "UPDATE sync_queue SET locked_at = ?2 WHERE id = ?1", id, &stale).await;
        assert_eq!(journal.counts().await.unwrap().stuck, 1);

        let entries = journal.dequeue_pending(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].retry_count, 1);
        assert!(entries[0]
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("[RETRYABLE]"));
    }

    #[tokio::test]
    async fn test_fresh_syncing_entry_is_not_recovered() {
        let db = setup().await;
        let journal = db.journal();
        let id = journal
            .enqueue("customers", "C1", ChangeType::Create, None)
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        journal.mark_syncing(id).await.unwrap();
        assert_eq!(journal.recover_stuck_items().await.unwrap(), 0);
        assert!(journal.dequeue_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_synced_clears_lock() {
        let db = setup().await;
        let journal = db.journal();
        let id = journal
            .enqueue("customers", "C1", ChangeType::Create, None)
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        journal.mark_syncing(id).await.unwrap();
        journal.mark_synced(id).await.unwrap();

        let entry = journal.get(id).await.unwrap().unwrap();
        assert_eq!(entry.sync_status, SyncStatus::Synced);
        assert!(entry.synced_at.is_some());
        assert!(entry.locked_at.is_none());
        assert!(matches!(
            journal.mark_synced(9999).await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_class_and_unsynced_writes() {
        let db = setup().await;
        let journal = db.journal();
        let create = journal
            .enqueue("customers", "C1", ChangeType::Create, None)
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        let delete = journal
            .enqueue("customers", "C1", ChangeType::Delete, None)
            .await
            .unwrap()
            .entry_id()
            .unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let c = EntityKind::Customer;
        assert_eq!(ChangeJournalRepository::failure_class_in(&mut conn, c, "C1").await.unwrap(), None);
        assert!(ChangeJournalRepository::has_unsynced_write_in(&mut conn, c, "C1").await.unwrap());

        ChangeJournalRepository::mark_error_in(&mut conn, delete, ErrorClass::Retryable, "503", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            ChangeJournalRepository::failure_class_in(&mut conn, c, "C1").await.unwrap(),
            Some(ErrorClass::Retryable)
        );

        ChangeJournalRepository::mark_error_in(&mut conn, create, ErrorClass::Permanent, "422", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            ChangeJournalRepository::failure_class_in(&mut conn, c, "C1").await.unwrap(),
            Some(ErrorClass::Permanent)
        );
        assert!(ChangeJournalRepository::has_unsynced_write_in(&mut conn, c, "C1").await.unwrap());

        ChangeJournalRepository::mark_synced_in(&mut conn, create, Utc::now())
            .await
            .unwrap();
        // the failed delete alone is not an unsynced write
        assert!(!ChangeJournalRepository::has_unsynced_write_in(&mut conn, c, "C1").await.unwrap());
        assert!(!ChangeJournalRepository::has_unsynced_write_in(&mut conn, c, "C2").await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_retry_respects_tag_budget_and_backoff() {
        let db = setup().await;
        let journal = db.journal();
        let mut ids = Vec::new();
        for record in ["R1", "R2", "R3", "R4"] {
            ids.push(
                journal
                    .enqueue("customers", record, ChangeType::Create, None)
                    .await
                    .unwrap()
                    .entry_id()
                    .unwrap(),
            );
        }
        let past = Utc::now() - Duration::minutes(10);
        let mut conn = db.pool().acquire().await.unwrap();
        // retryable, window elapsed
        ChangeJournalRepository::mark_error_in(&mut conn, ids[0], ErrorClass::Retryable, "503", past)
            .await
            .unwrap();
        // permanent
        ChangeJournalRepository::mark_error_in(&mut conn, ids[1], ErrorClass::Permanent, "422", past)
            .await
            .unwrap();
        // retryable but budget exhausted
        ChangeJournalRepository::mark_error_in(&mut conn, ids[2], ErrorClass::Retryable, "503", past)
            .await
            .unwrap();
        sqlx::query("UPDATE sync_queue SET retry_count = 5 WHERE id = ?1")
            .bind(ids[2])
            .execute(&mut *conn)
            .await
            .unwrap();
        // retryable, attempted just now with retry_count 4 (16s window)
        ChangeJournalRepository::mark_error_in(&mut conn, ids[3], ErrorClass::Retryable, "503", Utc::now())
            .await
            .unwrap();
        sqlx::query("UPDATE sync_queue SET retry_count = 4 WHERE id = ?1")
            .bind(ids[3])
            .execute(&mut *conn)
            .await
            .unwrap();
        drop(conn);

        assert_eq!(journal.auto_retry_failed_items(5).await.unwrap(), 1);

        let retried = journal.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(retried.sync_status, SyncStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        for id in &ids[1..] {
            assert_eq!(journal.get(*id).await.unwrap().unwrap().sync_status, SyncStatus::Error);
        }

        assert_eq!(journal.reset_failed(None).await.unwrap(), 3);
        assert_eq!(journal.counts().await.unwrap().errors, 0);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_synced_entries() {
        let db = setup().await;
        let journal = db.journal();
        let id = journal
            .enqueue("customers", "C1", ChangeType::Create, None)
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        journal.mark_synced(id).await.unwrap();
        assert_eq!(journal.cleanup_synced(7).await.unwrap(), 0);

        let old = format_ts(Utc::now() - Duration::days(8));
        force(&db, "UPDATE sync_queue SET synced_at = ?2 WHERE id = ?1", id, &old).await;
        assert_eq!(journal.cleanup_synced(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_discard_pending_keeps_in_flight_and_conflicts() {
        let db = setup().await;
        let journal = db.journal();
        let update = journal
            .enqueue("customers", "C1", ChangeType::Update, None)
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        let create = journal
            .enqueue("customers", "C1", ChangeType::Create, None)
            .await
            .unwrap()
            .entry_id()
            .unwrap();
        journal
            .enqueue("customers", "C1", ChangeType::Conflict, Some(&json!({})))
            .await
            .unwrap();
        assert!(journal.mark_syncing(create).await.unwrap());

        let mut conn = db.pool().acquire().await.unwrap();
        let dropped = ChangeJournalRepository::discard_pending_in(&mut conn, EntityKind::Customer, "C1")
            .await
            .unwrap();
        drop(conn);

        assert_eq!(dropped, 1);
        assert!(journal.get(update).await.unwrap().is_none());
        assert!(journal.get(create).await.unwrap().is_some());
        assert_eq!(journal.list_conflicts().await.unwrap().len(), 1);
    }
}
