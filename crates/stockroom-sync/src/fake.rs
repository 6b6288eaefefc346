//! In-memory [`CloudBackend`] for engine tests.
//!
//! Rows are kept in local field shape, keyed by server id, and behave like
//! the PostgREST upsert: match by remote id, then by natural key, else
//! insert with a freshly minted UUID. Change times are kept at microsecond
//! precision, like a Postgres `timestamptz`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use stockroom_core::ids::{is_remote_id, value_as_id};
use stockroom_core::time::{format_ts, parse_json_ts};
use stockroom_core::{ChangeType, EntityKind, Record, RemoteChange, TableSpec, DELETED_AT};

use crate::error::{SyncError, SyncResult};
use crate::transport::{CloudBackend, UpsertOperation, UpsertOutcome};

fn server_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone)]
struct FakeRow {
    data: Record,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FakeState {
    tables: HashMap<EntityKind, BTreeMap<String, FakeRow>>,
    upserts: Vec<(EntityKind, String, UpsertOperation)>,
    failures: HashMap<EntityKind, u16>,
    /// Write the row, then report a timeout.
    ambiguous: HashMap<EntityKind, u32>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Puts a row on the server, as if another device had pushed it.
    pub(crate) fn seed(&self, kind: EntityKind, remote_id: &str, mut data: Record) {
        data.insert("id".to_string(), Value::String(remote_id.to_string()));
        let now = server_now();
        self.with_state(|state| {
            state.tables.entry(kind).or_default().insert(
                remote_id.to_string(),
                FakeRow {
                    data,
                    created_at: now,
                    modified_at: now,
                },
            );
        });
    }

    /// Edits a server row in place and bumps its change time.
    pub(crate) fn edit(&self, kind: EntityKind, remote_id: &str, changes: Record) {
        self.with_state(|state| {
            if let Some(row) = state
                .tables
                .get_mut(&kind)
                .and_then(|rows| rows.get_mut(remote_id))
            {
                row.data.extend(changes);
                row.modified_at = server_now() + Duration::milliseconds(1);
            }
        });
    }

    pub(crate) fn rows(&self, kind: EntityKind) -> Vec<Record> {
        self.with_state(|state| {
            state
                .tables
                .get(&kind)
                .map(|rows| rows.values().map(|r| r.data.clone()).collect())
                .unwrap_or_default()
        })
    }

    pub(crate) fn upserts(&self) -> Vec<(EntityKind, String, UpsertOperation)> {
        self.with_state(|state| state.upserts.clone())
    }

    /// Every upsert against `kind` fails with `status` until cleared.
    pub(crate) fn fail_table(&self, kind: EntityKind, status: Option<u16>) {
        self.with_state(|state| match status {
            Some(status) => {
                state.failures.insert(kind, status);
            }
            None => {
                state.failures.remove(&kind);
            }
        });
    }

    /// The next `times` upserts against `kind` land but report a timeout.
    pub(crate) fn lose_acks(&self, kind: EntityKind, times: u32) {
        self.with_state(|state| {
            state.ambiguous.insert(kind, times);
        });
    }
}

fn find_match(
    rows: &BTreeMap<String, FakeRow>,
    spec: &TableSpec,
    record_id: &str,
    data: &Record,
) -> Option<String> {
    if is_remote_id(record_id) {
        return rows.contains_key(record_id).then(|| record_id.to_string());
    }
    let column = spec.natural_key?;
    let value = data.get(column).and_then(value_as_id)?;
    rows.iter()
        .find(|(_, row)| row.data.get(column).and_then(value_as_id).as_deref() == Some(&value))
        .map(|(id, _)| id.clone())
}

#[async_trait]
impl CloudBackend for FakeBackend {
    async fn upsert(
        &self,
        spec: &'static TableSpec,
        record_id: &str,
        data: &Record,
    ) -> SyncResult<UpsertOutcome> {
        self.with_state(|state| {
            if let Some(status) = state.failures.get(&spec.kind) {
                return Err(SyncError::http(*status, None, "injected failure"));
            }

            let now = server_now();
            let rows = state.tables.entry(spec.kind).or_default();
            let (remote_id, operation) = match find_match(rows, spec, record_id, data) {
                Some(id) => (id, UpsertOperation::Updated),
                None if is_remote_id(record_id) => (record_id.to_string(), UpsertOperation::Inserted),
                None => (Uuid::new_v4().to_string(), UpsertOperation::Inserted),
            };

            let mut stored = data.clone();
            stored.insert("id".to_string(), Value::String(remote_id.clone()));
            let created_at = rows.get(&remote_id).map(|r| r.created_at).unwrap_or(now);
            rows.insert(
                remote_id.clone(),
                FakeRow {
                    data: stored,
                    created_at,
                    modified_at: now,
                },
            );
            state
                .upserts
                .push((spec.kind, remote_id.clone(), operation));

            if let Some(left) = state.ambiguous.get_mut(&spec.kind) {
                if *left > 0 {
                    *left -= 1;
                    return Err(SyncError::Timeout("ack lost".into()));
                }
            }
            Ok(UpsertOutcome {
                remote_id,
                operation,
            })
        })
    }

    async fn soft_delete(
        &self,
        spec: &'static TableSpec,
        remote_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        self.with_state(|state| {
            if let Some(row) = state
                .tables
                .get_mut(&spec.kind)
                .and_then(|rows| rows.get_mut(remote_id))
            {
                row.data
                    .insert(DELETED_AT.to_string(), Value::String(format_ts(at)));
                row.modified_at = server_now();
            }
        });
        Ok(())
    }

    async fn get_changes(&self, since: Option<DateTime<Utc>>) -> SyncResult<Vec<RemoteChange>> {
        let mut changes = self.with_state(|state| {
            let mut changes = Vec::new();
            for (kind, rows) in &state.tables {
                for (id, row) in rows {
                    if since.map(|s| row.modified_at <= s).unwrap_or(false) {
                        continue;
                    }
                    let deleted = parse_json_ts(row.data.get(DELETED_AT)).is_some();
                    let change_type = if deleted {
                        ChangeType::Delete
                    } else if since.map(|s| row.created_at <= s).unwrap_or(false) {
                        ChangeType::Update
                    } else {
                        ChangeType::Create
                    };
                    changes.push(RemoteChange {
                        table: *kind,
                        record_id: id.clone(),
                        change_type,
                        data: row.data.clone(),
                        server_timestamp: Some(row.modified_at),
                    });
                }
            }
            changes
        });
        changes.sort_by(|a, b| {
            a.table
                .level()
                .cmp(&b.table.level())
                .then(a.server_timestamp.cmp(&b.server_timestamp))
        });
        Ok(changes)
    }
}
