//! # Foreign-Key Translator
//!
//! Rewrites foreign-key columns between local ids and server ids.
//!
//! ## Outbound (push)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sales { id: "S1", customer_id: "C1", user_id: "U1" }                  │
//! │                                                                         │
//! │  for each declared foreign key:                                         │
//! │    null / absent            ──► leave                                   │
//! │    already UUID shaped      ──► leave                                   │
//! │    mapped in id_mappings    ──► rewrite to remote id                    │
//! │    parent failed for good   ──► FAILED (permanent)                      │
//! │    parent row exists locally──► enqueue parent create, WAIT (retry)     │
//! │    parent row missing       ──► optional + opt-in? null it : MISSING    │
//! │                                                                         │
//! │  MISSING / FAILED beat WAIT beats READY                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Inbound (pull)
//! A UUID-shaped key is reverse-mapped to the local id. With no mapping it is
//! kept only when a local row already has that id (UUID-keyed local rows);
//! otherwise the change waits for its parent.
//!
//! Both directions are idempotent: a translated record translates to itself.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{debug, warn};

use stockroom_core::ids::{is_remote_id, value_as_id};
use stockroom_core::{ChangeType, EntityKind, ErrorClass, Record, TableSpec};
use stockroom_db::{ChangeJournalRepository, EntityRegistry, IdMappingRepository};

use crate::error::{SyncError, SyncResult};

/// Result of translating a record for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Every foreign key is in remote form.
    Ready(Record),
    /// A parent exists locally but has not been pushed yet.
    WaitingForParent {
        field: &'static str,
        parent: EntityKind,
        parent_id: String,
    },
    /// A required parent does not exist locally.
    MissingParent {
        field: &'static str,
        parent: EntityKind,
        parent_id: String,
    },
    /// The parent's push failed permanently; the user has to fix it first.
    ParentFailed {
        field: &'static str,
        parent: EntityKind,
        parent_id: String,
    },
}

impl Outbound {
    /// Converts the non-ready outcomes into their error form.
    pub fn into_ready(self) -> SyncResult<Record> {
        match self {
            Outbound::Ready(record) => Ok(record),
            Outbound::WaitingForParent {
                field,
                parent,
                parent_id,
            } => Err(SyncError::WaitingForParent {
                field: field.to_string(),
                parent: parent.to_string(),
                parent_id,
            }),
            Outbound::MissingParent {
                field,
                parent,
                parent_id,
            } => Err(SyncError::MissingParent {
                field: field.to_string(),
                parent: parent.to_string(),
                parent_id,
            }),
            Outbound::ParentFailed {
                field,
                parent,
                parent_id,
            } => Err(SyncError::ParentFailed {
                field: field.to_string(),
                parent: parent.to_string(),
                parent_id,
            }),
        }
    }
}

/// Result of translating a server row for the local store.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ready(Record),
    /// The referenced parent has not arrived locally yet.
    WaitingForParent {
        field: &'static str,
        parent: EntityKind,
        remote_id: String,
    },
}

/// Translates foreign keys using `id_mappings` and the local tables.
#[derive(Debug, Clone)]
pub struct ForeignKeyTranslator {
    registry: Arc<EntityRegistry>,
    null_unresolved_optional: bool,
}

impl ForeignKeyTranslator {
    pub fn new(registry: Arc<EntityRegistry>, null_unresolved_optional: bool) -> Self {
        ForeignKeyTranslator {
            registry,
            null_unresolved_optional,
        }
    }

    /// Rewrites local foreign keys to server ids.
    ///
    /// Unmapped parents that exist locally get a `create` journal entry (with
    /// a fresh snapshot) when they have none that is active or failed, so the
    /// next run pushes them ahead of this record. A parent whose push failed
    /// permanently is left alone and fails this record too.
    ///
    /// ## Arguments
    /// * `conn` - Connection used for mapping lookups and parent enqueues
    /// * `spec` - Table the record belongs to
    /// * `record` - Local record snapshot
    /// * `now` - Timestamp for auto-enqueued parents
    pub async fn translate_outbound_in(
        &self,
        conn: &mut SqliteConnection,
        spec: &'static TableSpec,
        record: &Record,
        now: DateTime<Utc>,
    ) -> SyncResult<Outbound> {
        let mut out = record.clone();
        let mut waiting: Option<Outbound> = None;

        for fk in spec.foreign_keys {
            let Some(local_id) = record.get(fk.field).and_then(value_as_id) else {
                continue;
            };
            if is_remote_id(&local_id) {
                continue;
            }

            let parent_table = fk.parent.table_name();
            if let Some(remote_id) =
                IdMappingRepository::lookup_in(conn, parent_table, &local_id).await?
            {
                out.insert(fk.field.to_string(), Value::String(remote_id));
                continue;
            }

            let adapter = self.registry.get(fk.parent)?;
            match adapter.get_by_id(conn, &local_id).await? {
                Some(snapshot) => {
                    match ChangeJournalRepository::failure_class_in(conn, fk.parent, &local_id)
                        .await?
                    {
                        Some(ErrorClass::Permanent) => {
                            return Ok(Outbound::ParentFailed {
                                field: fk.field,
                                parent: fk.parent,
                                parent_id: local_id,
                            });
                        }
                        // the parent retries on its own budget
                        Some(ErrorClass::Retryable) => {}
                        None => {
                            if !ChangeJournalRepository::has_active_entry_in(
                                conn, fk.parent, &local_id,
                            )
                            .await?
                            {
                                let snapshot = Value::Object(snapshot);
                                ChangeJournalRepository::enqueue_in(
                                    conn,
                                    parent_table,
                                    &local_id,
                                    ChangeType::Create,
                                    Some(&snapshot),
                                    now,
                                )
                                .await?;
                                debug!(
                                    table = %spec.kind,
                                    parent = %fk.parent,
                                    parent_id = %local_id,
                                    "Unmapped parent queued for push"
                                );
                            }
                        }
                    }
                    if waiting.is_none() {
                        waiting = Some(Outbound::WaitingForParent {
                            field: fk.field,
                            parent: fk.parent,
                            parent_id: local_id,
                        });
                    }
                }
                None if !fk.required && self.null_unresolved_optional => {
                    warn!(
                        table = %spec.kind,
                        field = fk.field,
                        parent_id = %local_id,
                        "Optional parent missing locally, sending null"
                    );
                    out.insert(fk.field.to_string(), Value::Null);
                }
                None => {
                    return Ok(Outbound::MissingParent {
                        field: fk.field,
                        parent: fk.parent,
                        parent_id: local_id,
                    });
                }
            }
        }

        Ok(waiting.unwrap_or(Outbound::Ready(out)))
    }

    /// Rewrites server foreign keys to local ids.
    pub async fn translate_inbound_in(
        &self,
        conn: &mut SqliteConnection,
        spec: &'static TableSpec,
        record: &Record,
    ) -> SyncResult<Inbound> {
        let mut out = record.clone();

        for fk in spec.foreign_keys {
            let Some(remote_id) = record.get(fk.field).and_then(value_as_id) else {
                continue;
            };
            if !is_remote_id(&remote_id) {
                continue;
            }

            if let Some(local_id) =
                IdMappingRepository::reverse_lookup_in(conn, fk.parent.table_name(), &remote_id)
                    .await?
            {
                out.insert(fk.field.to_string(), Value::String(local_id));
                continue;
            }

            if self.registry.get(fk.parent)?.exists(conn, &remote_id).await? {
                continue;
            }

            return Ok(Inbound::WaitingForParent {
                field: fk.field,
                parent: fk.parent,
                remote_id,
            });
        }

        Ok(Inbound::Ready(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockroom_db::{Database, DbConfig};

    const REMOTE_C1: &str = "11111111-1111-1111-1111-111111111111";
    const REMOTE_U1: &str = "22222222-2222-2222-2222-222222222222";

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.metadata().set_enabled(true).await.unwrap();
        db
    }

    fn sale(customer: Value, user: Value) -> Record {
        record(json!({
            "id": "S1",
            "receipt_number": "R-1",
            "customer_id": customer,
            "user_id": user,
            "total_cents": 500
        }))
    }

    #[tokio::test]
    async fn test_outbound_rewrites_mapped_keys_and_is_idempotent() {
        let db = setup().await;
        db.mappings().record("customers", "C1", REMOTE_C1).await.unwrap();
        db.mappings().record("users", "U1", REMOTE_U1).await.unwrap();
        let translator = ForeignKeyTranslator::new(db.registry(), false);
        let spec = EntityKind::Sale.spec();

        let mut conn = db.pool().acquire().await.unwrap();
        let first = translator
            .translate_outbound_in(&mut conn, spec, &sale(json!("C1"), json!("U1")), Utc::now())
            .await
            .unwrap();
        let Outbound::Ready(translated) = first else {
            panic!("expected ready, got {first:?}");
        };
        assert_eq!(translated["customer_id"], json!(REMOTE_C1));
        assert_eq!(translated["user_id"], json!(REMOTE_U1));

        let again = translator
            .translate_outbound_in(&mut conn, spec, &translated, Utc::now())
            .await
            .unwrap();
        assert_eq!(again, Outbound::Ready(translated));
    }

    #[tokio::test]
    async fn test_outbound_enqueues_unmapped_local_parent() {
        let db = setup().await;
        db.mappings().record("users", "U1", REMOTE_U1).await.unwrap();
        db.entities()
            .create(EntityKind::Customer, record(json!({"id": "C1", "name": "Ana"})))
            .await
            .unwrap();
        // the customer create is journaled already; clear it to see the
        // translator queue it
        let existing = db
            .journal()
            .find(EntityKind::Customer, "C1", ChangeType::Create)
            .await
            .unwrap()
            .unwrap();
        db.journal().delete_entry(existing.id).await.unwrap();

        let translator = ForeignKeyTranslator::new(db.registry(), false);
        let mut conn = db.pool().acquire().await.unwrap();
        let outcome = translator
            .translate_outbound_in(
                &mut conn,
                EntityKind::Sale.spec(),
                &sale(json!("C1"), json!("U1")),
                Utc::now(),
            )
            .await
            .unwrap();
        drop(conn);

        assert_eq!(
            outcome,
            Outbound::WaitingForParent {
                field: "customer_id",
                parent: EntityKind::Customer,
                parent_id: "C1".to_string(),
            }
        );
        let queued = db
            .journal()
            .find(EntityKind::Customer, "C1", ChangeType::Create)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.payload_record().unwrap()["name"], json!("Ana"));
        assert!(outcome.into_ready().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_outbound_leaves_failed_parent_entry_alone() {
        let db = setup().await;
        db.mappings().record("users", "U1", REMOTE_U1).await.unwrap();
        db.entities()
            .create(EntityKind::Customer, record(json!({"id": "C1", "name": "Ana"})))
            .await
            .unwrap();
        let parent = db
            .journal()
            .find(EntityKind::Customer, "C1", ChangeType::Create)
            .await
            .unwrap()
            .unwrap();
        let translator = ForeignKeyTranslator::new(db.registry(), false);
        let spec = EntityKind::Sale.spec();
        let input = sale(json!("C1"), json!("U1"));

        db.journal()
            .mark_error(parent.id, ErrorClass::Retryable, "HTTP 503")
            .await
            .unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let outcome = translator
            .translate_outbound_in(&mut conn, spec, &input, Utc::now())
            .await
            .unwrap();
        drop(conn);
        assert!(matches!(outcome, Outbound::WaitingForParent { .. }));
        let entry = db.journal().get(parent.id).await.unwrap().unwrap();
        assert_eq!(entry.sync_status, stockroom_core::SyncStatus::Error);

        db.journal()
            .mark_error(parent.id, ErrorClass::Permanent, "HTTP 422")
            .await
            .unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let outcome = translator
            .translate_outbound_in(&mut conn, spec, &input, Utc::now())
            .await
            .unwrap();
        drop(conn);
        assert_eq!(
            outcome,
            Outbound::ParentFailed {
                field: "customer_id",
                parent: EntityKind::Customer,
                parent_id: "C1".to_string(),
            }
        );
        let entry = db.journal().get(parent.id).await.unwrap().unwrap();
        assert_eq!(entry.sync_status, stockroom_core::SyncStatus::Error);
        assert!(entry.error_message.unwrap().starts_with("[PERMANENT]"));

        let err = outcome.into_ready().unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("customers:C1"));
    }

    #[tokio::test]
    async fn test_outbound_missing_required_parent_is_permanent() {
        let db = setup().await;
        let translator = ForeignKeyTranslator::new(db.registry(), true);
        let mut conn = db.pool().acquire().await.unwrap();

        let outcome = translator
            .translate_outbound_in(
                &mut conn,
                EntityKind::Sale.spec(),
                &sale(json!(null), json!("U9")),
                Utc::now(),
            )
            .await
            .unwrap();
        let Outbound::MissingParent { field, parent, .. } = &outcome else {
            panic!("expected missing parent, got {outcome:?}");
        };
        assert_eq!(*field, "user_id");
        assert_eq!(*parent, EntityKind::User);
        assert!(!outcome.into_ready().unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_outbound_optional_parent_nulled_only_when_enabled() {
        let db = setup().await;
        db.mappings().record("users", "U1", REMOTE_U1).await.unwrap();
        let input = sale(json!("C404"), json!("U1"));
        let spec = EntityKind::Sale.spec();
        let mut conn = db.pool().acquire().await.unwrap();

        let strict = ForeignKeyTranslator::new(db.registry(), false);
        let outcome = strict
            .translate_outbound_in(&mut conn, spec, &input, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, Outbound::MissingParent { field: "customer_id", .. }));

        let lenient = ForeignKeyTranslator::new(db.registry(), true);
        let outcome = lenient
            .translate_outbound_in(&mut conn, spec, &input, Utc::now())
            .await
            .unwrap();
        let Outbound::Ready(translated) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert_eq!(translated["customer_id"], Value::Null);
        assert_eq!(translated["user_id"], json!(REMOTE_U1));
    }

    #[tokio::test]
    async fn test_inbound_reverse_maps_and_waits_for_unknown_parent() {
        let db = setup().await;
        db.mappings().record("customers", "C1", REMOTE_C1).await.unwrap();
        let translator = ForeignKeyTranslator::new(db.registry(), false);
        let spec = EntityKind::Sale.spec();
        let mut conn = db.pool().acquire().await.unwrap();

        let outcome = translator
            .translate_inbound_in(&mut conn, spec, &sale(json!(REMOTE_C1), json!(REMOTE_U1)))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Inbound::WaitingForParent {
                field: "user_id",
                parent: EntityKind::User,
                remote_id: REMOTE_U1.to_string(),
            }
        );
        drop(conn);

        // a UUID-keyed local user makes the key acceptable as-is
        db.entities()
            .create(
                EntityKind::User,
                record(json!({"id": REMOTE_U1, "username": "ana", "role": "cashier"})),
            )
            .await
            .unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let outcome = translator
            .translate_inbound_in(&mut conn, spec, &sale(json!(REMOTE_C1), json!(REMOTE_U1)))
            .await
            .unwrap();
        let Inbound::Ready(translated) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert_eq!(translated["customer_id"], json!("C1"));
        assert_eq!(translated["user_id"], json!(REMOTE_U1));

        // local-shaped keys pass through untouched
        let again = translator
            .translate_inbound_in(&mut conn, spec, &translated)
            .await
            .unwrap();
        assert_eq!(again, Inbound::Ready(translated));
    }
}
