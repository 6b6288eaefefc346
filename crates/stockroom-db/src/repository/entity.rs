//! # Entity Adapters
//!
//! Typed access to the thirteen synced tables.
//!
//! ## Dispatch
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EntityRegistry                                   │
//! │                                                                         │
//! │   EntityKind::Customer ──► TableAdapter(customers)                     │
//! │   EntityKind::User     ──► UserAdapter (placeholder password hash)     │
//! │   EntityKind::Sale     ──► TableAdapter(sales)                         │
//! │   ...                                                                   │
//! │                                                                         │
//! │   Every adapter implements EntityAdapter:                               │
//! │     get_by_id · exists · create · update · soft_delete · list_ids ·    │
//! │     upsert_from_remote                                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! SQL is generated from the static column lists in
//! [`stockroom_core::tables`]; only declared columns are ever read or
//! written, and column names never come from input.
//!
//! ## Local Writes
//! [`EntityRepository`] is the write path for application code: the row
//! write and its journal entry commit in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::journal::ChangeJournalRepository;
use stockroom_core::ids::value_as_id;
use stockroom_core::time::{format_ts, parse_ts};
use stockroom_core::{
    ChangeType, CoreError, EnqueueOutcome, EntityKind, Record, TableSpec, CREATED_AT, DELETED_AT,
    UPDATED_AT,
};

const TIMESTAMP_COLUMNS: [&str; 3] = [CREATED_AT, UPDATED_AT, DELETED_AT];

// =============================================================================
// SQL Helpers
// =============================================================================

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// `json_object('id', id, 'name', name, ...)` over the declared columns.
fn json_object_expr(spec: &TableSpec) -> String {
    let pairs: Vec<String> = spec
        .columns
        .iter()
        .map(|column| format!("'{column}', {column}"))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

/// Declared columns present in `record`, in declaration order.
fn present_columns<'a>(spec: &'a TableSpec, record: &Record) -> Vec<&'a str> {
    spec.columns
        .iter()
        .copied()
        .filter(|column| record.contains_key(*column))
        .collect()
}

fn record_id(spec: &TableSpec, record: &Record) -> DbResult<String> {
    record
        .get("id")
        .and_then(value_as_id)
        .ok_or_else(|| CoreError::invalid_payload(spec.name, "record has no id").into())
}

/// Rewrites timestamp columns to the canonical storage form.
fn normalize_timestamps(record: &mut Record) {
    for column in TIMESTAMP_COLUMNS {
        if let Some(Value::String(raw)) = record.get(column) {
            if let Some(ts) = parse_ts(raw) {
                record.insert(column.to_string(), Value::String(format_ts(ts)));
            }
        }
    }
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// Per-table storage operations used by the sync engine.
///
/// All methods run on a caller-supplied connection so they can be composed
/// into a single transaction with journal and mapping writes.
#[async_trait]
pub trait EntityAdapter: Send + Sync {
    /// Static description of the table.
    fn spec(&self) -> &'static TableSpec;

    /// Reads a row as a record in local shape.
    async fn get_by_id(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Record>>;

    async fn exists(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<bool>;

    /// Inserts a row. The record must carry an `id`.
    async fn create(&self, conn: &mut SqliteConnection, record: &Record) -> DbResult<()>;

    /// Updates declared columns present in `record`. Returns false if no
    /// row matched.
    async fn update(&self, conn: &mut SqliteConnection, id: &str, record: &Record)
        -> DbResult<bool>;

    /// Sets `deleted_at` (and `updated_at` where the table has one).
    /// Already-deleted rows keep their original `deleted_at`.
    async fn soft_delete(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        at: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Ids of every row, soft-deleted ones included.
    async fn list_ids(&self, conn: &mut SqliteConnection) -> DbResult<Vec<String>>;

    /// Id of the row whose natural key equals `value`. Always `None` for
    /// tables without a natural key.
    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        value: &str,
    ) -> DbResult<Option<String>>;

    /// Writes a remote row (already translated to local ids): update when
    /// the row exists, insert otherwise.
    async fn upsert_from_remote(&self, conn: &mut SqliteConnection, record: &Record)
        -> DbResult<()>;
}

// =============================================================================
// Generic Table Adapter
// =============================================================================

/// Adapter driven entirely by a [`TableSpec`].
#[derive(Debug, Clone, Copy)]
pub struct TableAdapter {
    spec: &'static TableSpec,
}

impl TableAdapter {
    pub fn new(kind: EntityKind) -> Self {
        TableAdapter { spec: kind.spec() }
    }
}

#[async_trait]
impl EntityAdapter for TableAdapter {
    fn spec(&self) -> &'static TableSpec {
        self.spec
    }

    async fn get_by_id(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            json_object_expr(self.spec),
            self.spec.name
        );
        let raw: Option<String> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        raw.map(|text| serde_json::from_str::<Record>(&text).map_err(DbError::from))
            .transpose()
    }

    async fn exists(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1", self.spec.name);
        let found: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(found.is_some())
    }

    async fn create(&self, conn: &mut SqliteConnection, record: &Record) -> DbResult<()> {
        let id = record_id(self.spec, record)?;
        let columns = present_columns(self.spec, record);
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.spec.name,
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = bind_value(query, &record[*column]);
        }
        query.execute(&mut *conn).await?;

        debug!(table = %self.spec.name, id = %id, "Row inserted");
        Ok(())
    }

    async fn update(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        record: &Record,
    ) -> DbResult<bool> {
        let columns: Vec<&str> = present_columns(self.spec, record)
            .into_iter()
            .filter(|column| *column != "id")
            .collect();
        if columns.is_empty() {
            return self.exists(conn, id).await;
        }

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            self.spec.name,
            assignments.join(", "),
            columns.len() + 1
        );

        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = bind_value(query, &record[*column]);
        }
        let result = query.bind(id).execute(&mut *conn).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn soft_delete(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let sql = if self.spec.has_updated_at {
            format!(
                "UPDATE {} SET deleted_at = COALESCE(deleted_at, ?1), updated_at = ?1 WHERE id = ?2",
                self.spec.name
            )
        } else {
            format!(
                "UPDATE {} SET deleted_at = COALESCE(deleted_at, ?1) WHERE id = ?2",
                self.spec.name
            )
        };
        let result = sqlx::query(&sql)
            .bind(format_ts(at))
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_ids(&self, conn: &mut SqliteConnection) -> DbResult<Vec<String>> {
        let sql = format!("SELECT id FROM {} ORDER BY id", self.spec.name);
        let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&mut *conn).await?;
        Ok(ids)
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        value: &str,
    ) -> DbResult<Option<String>> {
        let Some(column) = self.spec.natural_key else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT id FROM {} WHERE {column} = ?1 ORDER BY deleted_at IS NOT NULL, id LIMIT 1",
            self.spec.name
        );
        let id: Option<String> = sqlx::query_scalar(&sql)
            .bind(value)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(id)
    }

    async fn upsert_from_remote(
        &self,
        conn: &mut SqliteConnection,
        record: &Record,
    ) -> DbResult<()> {
        let id = record_id(self.spec, record)?;
        let mut record = record.clone();
        normalize_timestamps(&mut record);

        if self.exists(conn, &id).await? {
            self.update(conn, &id, &record).await?;
        } else {
            self.create(conn, &record).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Users
// =============================================================================

/// Users never carry a real password hash off-device, but the local column
/// is NOT NULL. A pulled user without one gets a deterministic value that
/// can never verify, and an existing local hash is never overwritten by a
/// missing remote one.
#[derive(Debug, Clone, Copy)]
pub struct UserAdapter {
    inner: TableAdapter,
}

const PASSWORD_HASH: &str = "password_hash";

impl UserAdapter {
    pub fn new() -> Self {
        UserAdapter {
            inner: TableAdapter::new(EntityKind::User),
        }
    }

    /// The placeholder stored for a user whose hash never reached this device.
    pub fn placeholder_hash(id: &str) -> String {
        format!("!sync-placeholder!{id}")
    }

    fn has_hash(record: &Record) -> bool {
        matches!(record.get(PASSWORD_HASH), Some(Value::String(s)) if !s.is_empty())
    }
}

impl Default for UserAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityAdapter for UserAdapter {
    fn spec(&self) -> &'static TableSpec {
        self.inner.spec()
    }

    async fn get_by_id(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Record>> {
        self.inner.get_by_id(conn, id).await
    }

    async fn exists(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<bool> {
        self.inner.exists(conn, id).await
    }

    async fn create(&self, conn: &mut SqliteConnection, record: &Record) -> DbResult<()> {
        if Self::has_hash(record) {
            return self.inner.create(conn, record).await;
        }
        let id = record_id(self.spec(), record)?;
        let mut record = record.clone();
        record.insert(
            PASSWORD_HASH.to_string(),
            Value::String(Self::placeholder_hash(&id)),
        );
        info!(id = %id, "User has no password hash, storing placeholder");
        self.inner.create(conn, &record).await
    }

    async fn update(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        record: &Record,
    ) -> DbResult<bool> {
        if Self::has_hash(record) || !record.contains_key(PASSWORD_HASH) {
            return self.inner.update(conn, id, record).await;
        }
        let mut record = record.clone();
        record.remove(PASSWORD_HASH);
        self.inner.update(conn, id, &record).await
    }

    async fn soft_delete(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        self.inner.soft_delete(conn, id, at).await
    }

    async fn list_ids(&self, conn: &mut SqliteConnection) -> DbResult<Vec<String>> {
        self.inner.list_ids(conn).await
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        value: &str,
    ) -> DbResult<Option<String>> {
        self.inner.find_by_natural_key(conn, value).await
    }

    async fn upsert_from_remote(
        &self,
        conn: &mut SqliteConnection,
        record: &Record,
    ) -> DbResult<()> {
        let id = record_id(self.spec(), record)?;
        let mut record = record.clone();
        normalize_timestamps(&mut record);

        if self.exists(conn, &id).await? {
            self.update(conn, &id, &record).await?;
        } else {
            self.create(conn, &record).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Adapters keyed by entity kind.
#[derive(Clone)]
pub struct EntityRegistry {
    adapters: HashMap<EntityKind, Arc<dyn EntityAdapter>>,
}

impl EntityRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        EntityRegistry {
            adapters: HashMap::new(),
        }
    }

    /// The standard registry: one adapter per synced table.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for kind in EntityKind::ALL {
            match kind {
                EntityKind::User => registry.register(Arc::new(UserAdapter::new())),
                _ => registry.register(Arc::new(TableAdapter::new(kind))),
            }
        }
        registry
    }

    /// Registers (or replaces) the adapter for its table.
    pub fn register(&mut self, adapter: Arc<dyn EntityAdapter>) {
        self.adapters.insert(adapter.spec().kind, adapter);
    }

    pub fn get(&self, kind: EntityKind) -> DbResult<&dyn EntityAdapter> {
        self.adapters
            .get(&kind)
            .map(|adapter| &**adapter)
            .ok_or_else(|| DbError::InvalidTable(format!("no adapter registered for {kind}")))
    }
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().collect();
        kinds.sort();
        f.debug_struct("EntityRegistry").field("kinds", &kinds).finish()
    }
}

// =============================================================================
// Local Write Path
// =============================================================================

/// Application-side writes: every mutation is journaled in the same
/// transaction as the row write.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
    registry: Arc<EntityRegistry>,
}

impl EntityRepository {
    pub fn new(pool: SqlitePool, registry: Arc<EntityRegistry>) -> Self {
        EntityRepository { pool, registry }
    }

    /// Reads a row in local shape.
    pub async fn get(&self, kind: EntityKind, id: &str) -> DbResult<Option<Record>> {
        let mut conn = self.pool.acquire().await?;
        self.registry.get(kind)?.get_by_id(&mut conn, id).await
    }

    /// Inserts a row and journals a `create`.
    pub async fn create(&self, kind: EntityKind, mut record: Record) -> DbResult<EnqueueOutcome> {
        let adapter = self.registry.get(kind)?;
        let now = Utc::now();
        let id = record_id(adapter.spec(), &record)?;
        record
            .entry(CREATED_AT.to_string())
            .or_insert_with(|| Value::String(format_ts(now)));
        if adapter.spec().has_updated_at {
            record
                .entry(UPDATED_AT.to_string())
                .or_insert_with(|| Value::String(format_ts(now)));
        }

        let mut tx = self.pool.begin().await?;
        adapter.create(&mut tx, &record).await?;
        let snapshot = adapter.get_by_id(&mut tx, &id).await?.map(Value::Object);
        let outcome = ChangeJournalRepository::enqueue_in(
            &mut tx,
            kind.table_name(),
            &id,
            ChangeType::Create,
            snapshot.as_ref(),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Updates a row, stamps `updated_at`, and journals an `update`.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        mut changes: Record,
    ) -> DbResult<EnqueueOutcome> {
        let adapter = self.registry.get(kind)?;
        let now = Utc::now();
        changes.remove("id");
        if adapter.spec().has_updated_at {
            changes.insert(UPDATED_AT.to_string(), Value::String(format_ts(now)));
        }

        let mut tx = self.pool.begin().await?;
        if !adapter.update(&mut tx, id, &changes).await? {
            return Err(DbError::not_found(kind.table_name(), id));
        }
        let snapshot = adapter.get_by_id(&mut tx, id).await?.map(Value::Object);
        let outcome = ChangeJournalRepository::enqueue_in(
            &mut tx,
            kind.table_name(),
            id,
            ChangeType::Update,
            snapshot.as_ref(),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Soft-deletes a row and journals a `delete`.
    pub async fn soft_delete(&self, kind: EntityKind, id: &str) -> DbResult<EnqueueOutcome> {
        let adapter = self.registry.get(kind)?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        if !adapter.soft_delete(&mut tx, id, now).await? {
            return Err(DbError::not_found(kind.table_name(), id));
        }
        let snapshot = adapter.get_by_id(&mut tx, id).await?.map(Value::Object);
        let outcome = ChangeJournalRepository::enqueue_in(
            &mut tx,
            kind.table_name(),
            id,
            ChangeType::Delete,
            snapshot.as_ref(),
            now,
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
