//! # Sync Engine
//!
//! Orchestrates a full sync run: first-contact reconciliation, push of the
//! change journal, then pull of remote changes.
//!
//! ## Run Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            sync_all()                                   │
//! │                                                                         │
//! │  enabled? ──no──► SyncDisabled                                          │
//! │  SyncLock::acquire() ──busy──► AlreadyInProgress                        │
//! │                                                                         │
//! │  1. last_sync_at unset?  ──► perform initial sync                       │
//! │  2. auto-retry failed entries whose backoff elapsed                     │
//! │  3. backfill root rows that were never journaled                        │
//! │  4. push pending entries, parents first                                 │
//! │        mark_syncing ─► translate FKs ─► upsert ─┬─► phase 2 (one tx):   │
//! │                                                 │    mapping + synced   │
//! │                                                 └─► mark_error(class)   │
//! │  5. last_sync_at = run start      (only if something was pushed)       │
//! │  6. pull from the pre-push checkpoint                                   │
//! │                                                                         │
//! │  SyncLock::release(token)  (always)                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pull
//! Each remote change is applied in its own local transaction:
//! ```text
//!   resolve local id (reverse mapping ─► same id ─► natural key ─► remote id)
//!          │
//!          ▼
//!   conflict::resolve() ──► Adopt / ApplyRemote ──► translate FKs ──► write
//!                       ──► KeepLocal / Ignore  ──► nothing
//!                       ──► DeferToManual       ──► `conflict` journal entry
//!
//!   FK not resolvable yet ──► rolled back, parked in pending_remote_changes
//! ```

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use stockroom_core::conflict::{effective_change_type, resolve, ConflictChoice, ConflictInput, Resolution};
use stockroom_core::ids::{is_remote_id, value_as_id};
use stockroom_core::tables::{root_tables, sync_order};
use stockroom_core::time::parse_json_ts;
use stockroom_core::{
    ChangeType, ConflictStrategy, CoreError, EnqueueOutcome, EntityKind, ErrorClass,
    InitialSyncReport, JournalEntry, PullReport, RemoteChange, SettingsUpdate, SyncHealth,
    SyncMetadata, SyncReport, DELETED_AT,
};
use stockroom_db::{
    ChangeJournalRepository, Database, DbError, EntityRegistry, IdMappingRepository,
    RemoteBacklogRepository,
};

use crate::config::EngineSettings;
use crate::error::{SyncError, SyncResult};
use crate::lock::{LockToken, SyncLock};
use crate::transport::CloudBackend;
use crate::translator::{ForeignKeyTranslator, Inbound};

// =============================================================================
// Apply Outcomes
// =============================================================================

/// What happened to one remote change locally.
#[derive(Debug, Clone, PartialEq)]
enum ApplyOutcome {
    Written,
    Ignored,
    KeptLocal,
    Conflict,
    /// Rolled back: a foreign key does not resolve locally yet.
    Deferred {
        field: &'static str,
        parent: EntityKind,
        remote_id: String,
    },
}

impl ApplyOutcome {
    fn deferral_reason(&self) -> Option<String> {
        match self {
            ApplyOutcome::Deferred {
                field,
                parent,
                remote_id,
            } => Some(format!("waiting for {parent}:{remote_id} ({field})")),
            _ => None,
        }
    }
}

/// Inputs shared by every change applied in one pull.
#[derive(Debug, Clone, Copy)]
struct ApplyContext {
    strategy: ConflictStrategy,
    last_sync_at: Option<DateTime<Utc>>,
    /// First contact: only insert rows we do not have.
    adopt_only: bool,
}

/// Result of pushing one journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    Pushed,
    Deferred,
    Failed,
    Orphaned,
    Skipped,
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Bidirectional sync between the local store and the cloud backend.
pub struct SyncEngine {
    db: Database,
    backend: Arc<dyn CloudBackend>,
    settings: EngineSettings,
    lock: SyncLock,
    registry: Arc<EntityRegistry>,
    translator: ForeignKeyTranslator,
}

impl SyncEngine {
    /// Creates an engine over `db` and `backend`.
    pub fn new(db: Database, backend: Arc<dyn CloudBackend>, settings: EngineSettings) -> Self {
        let registry = db.registry();
        let lock = SyncLock::new(db.metadata(), settings.lock_lease);
        let translator =
            ForeignKeyTranslator::new(Arc::clone(&registry), settings.null_unresolved_optional_fks);
        SyncEngine {
            db,
            backend,
            settings,
            lock,
            registry,
            translator,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// True while a run holds the lock in this process.
    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    async fn lock_enabled(&self) -> SyncResult<(SyncMetadata, LockToken)> {
        let metadata = self.db.metadata().get().await?;
        if !metadata.sync_enabled {
            return Err(SyncError::SyncDisabled);
        }
        let token = self
            .lock
            .acquire()
            .await?
            .ok_or(SyncError::AlreadyInProgress)?;
        Ok((metadata, token))
    }

    async fn unlock(&self, token: LockToken) {
        if let Err(e) = self.lock.release(token).await {
            warn!(error = %e, "Failed to release sync lock");
        }
    }

    // -------------------------------------------------------------------------
    // Full Run
    // -------------------------------------------------------------------------

    /// Runs a full sync: initial sync if needed, push, then pull.
    ///
    /// ## Returns
    /// * `Ok(SyncReport)` - Run finished; per-item failures are in the report
    /// * `Err(SyncDisabled)` - Sync is switched off
    /// * `Err(AlreadyInProgress)` - Another run holds the lock
    /// * `Err(_)` - The run aborted (local store or pull failure)
    pub async fn sync_all(&self) -> SyncResult<SyncReport> {
        let (metadata, token) = self.lock_enabled().await?;
        let result = self.run(metadata).await;
        self.unlock(token).await;

        match &result {
            Ok(report) => info!(
                pushed = report.pushed,
                failed = report.failed,
                deferred = report.deferred,
                orphaned = report.orphaned,
                pulled = report.pull.as_ref().map(|p| p.applied).unwrap_or(0),
                "Sync run finished"
            ),
            Err(e) => error!(error = %e, "Sync run failed"),
        }
        result
    }

    async fn run(&self, metadata: SyncMetadata) -> SyncResult<SyncReport> {
        let started = Utc::now();
        let mut report = SyncReport::default();

        let mut checkpoint = metadata.last_sync_at;
        if checkpoint.is_none() {
            report.initial = Some(self.initial_sync_locked().await?);
            checkpoint = self.db.metadata().get().await?.last_sync_at;
        }

        report.retried = to_u32(
            self.db
                .journal()
                .auto_retry_failed_items(self.settings.max_retries)
                .await?,
        );
        report.backfilled = self.backfill_roots().await?;

        self.push_pending(&mut report).await?;
        if report.pushed > 0 {
            self.db.metadata().set_last_sync_at(started).await?;
        }

        report.pull = Some(self.pull_locked(checkpoint).await?);
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Initial Sync
    // -------------------------------------------------------------------------

    /// First-contact reconciliation.
    ///
    /// Downloads every remote row we do not have, journals every local row
    /// the server does not have, then sets the checkpoint.
    pub async fn perform_initial_sync(&self) -> SyncResult<InitialSyncReport> {
        let (_, token) = self.lock_enabled().await?;
        let result = self.initial_sync_locked().await;
        self.unlock(token).await;
        result
    }

    async fn initial_sync_locked(&self) -> SyncResult<InitialSyncReport> {
        let started = Utc::now();
        let metadata = self.db.metadata().get().await?;
        let changes = self.backend.get_changes(None).await?;
        info!(remote_rows = changes.len(), "Initial sync started");

        let mut report = InitialSyncReport {
            remote_rows: to_u32(changes.len() as u64),
            ..Default::default()
        };
        let ctx = ApplyContext {
            strategy: metadata.conflict_strategy,
            last_sync_at: None,
            adopt_only: true,
        };

        let mut known: HashSet<(EntityKind, String)> = HashSet::new();
        for change in &changes {
            match self.apply_change(change, &ctx).await {
                Ok((local_id, outcome)) => {
                    known.insert((change.table, local_id));
                    if let Some(reason) = outcome.deferral_reason() {
                        self.db.backlog().save(change, &reason).await?;
                        report.deferred += 1;
                    } else if outcome == ApplyOutcome::Written {
                        report.downloaded += 1;
                    }
                }
                Err(e) => {
                    warn!(table = %change.table, remote_id = %change.record_id, error = %e, "Remote row not adopted");
                    known.insert((change.table, change.record_id.clone()));
                    self.db.backlog().save(change, &e.to_string()).await?;
                    report.deferred += 1;
                }
            }
        }

        report.enqueued = self.enqueue_local_only(&known).await?;
        self.db.metadata().set_last_sync_at(started).await?;

        info!(
            downloaded = report.downloaded,
            enqueued = report.enqueued,
            deferred = report.deferred,
            "Initial sync finished"
        );
        Ok(report)
    }

    /// Journals live local rows the server did not return.
    async fn enqueue_local_only(&self, known: &HashSet<(EntityKind, String)>) -> SyncResult<u32> {
        let now = Utc::now();
        let mut conn = self.db.pool().acquire().await?;
        let mut enqueued = 0;

        for kind in sync_order() {
            let adapter = self.registry.get(kind)?;
            for id in adapter.list_ids(&mut conn).await? {
                if known.contains(&(kind, id.clone())) {
                    continue;
                }
                let Some(row) = adapter.get_by_id(&mut conn, &id).await? else {
                    continue;
                };
                if is_deleted(&row)
                    || IdMappingRepository::lookup_in(&mut conn, kind.table_name(), &id)
                        .await?
                        .is_some()
                    || ChangeJournalRepository::has_active_entry_in(&mut conn, kind, &id).await?
                {
                    continue;
                }
                let outcome = ChangeJournalRepository::enqueue_in(
                    &mut conn,
                    kind.table_name(),
                    &id,
                    ChangeType::Create,
                    Some(&Value::Object(row)),
                    now,
                )
                .await?;
                if !outcome.is_skipped() {
                    enqueued += 1;
                }
            }
        }
        Ok(enqueued)
    }

    /// Journals root-table rows that were never pushed nor journaled.
    async fn backfill_roots(&self) -> SyncResult<u32> {
        let now = Utc::now();
        let mut conn = self.db.pool().acquire().await?;
        let mut backfilled = 0;

        for kind in root_tables() {
            let adapter = self.registry.get(kind)?;
            for id in adapter.list_ids(&mut conn).await? {
                if is_remote_id(&id)
                    || IdMappingRepository::lookup_in(&mut conn, kind.table_name(), &id)
                        .await?
                        .is_some()
                    || ChangeJournalRepository::has_any_entry_in(&mut conn, kind, &id).await?
                {
                    continue;
                }
                let Some(row) = adapter.get_by_id(&mut conn, &id).await? else {
                    continue;
                };
                if is_deleted(&row) {
                    continue;
                }
                let outcome = ChangeJournalRepository::enqueue_in(
                    &mut conn,
                    kind.table_name(),
                    &id,
                    ChangeType::Create,
                    Some(&Value::Object(row)),
                    now,
                )
                .await?;
                if !outcome.is_skipped() {
                    debug!(table = %kind, record_id = %id, "Root row backfilled into journal");
                    backfilled += 1;
                }
            }
        }
        Ok(backfilled)
    }

    // -------------------------------------------------------------------------
    // Push
    // -------------------------------------------------------------------------

    async fn push_pending(&self, report: &mut SyncReport) -> SyncResult<()> {
        let mut entries = self
            .db
            .journal()
            .dequeue_pending(self.settings.batch_size)
            .await?;
        if entries.is_empty() {
            return Ok(());
        }
        // parents first; created_at order is kept within a level
        entries.sort_by_key(|entry| {
            entry
                .table_name
                .parse::<EntityKind>()
                .map(EntityKind::level)
                .unwrap_or(u8::MAX)
        });
        debug!(count = entries.len(), "Pushing journal entries");

        for (index, entry) in entries.iter().enumerate() {
            if index > 0 && !self.settings.item_delay.is_zero() {
                tokio::time::sleep(self.settings.item_delay).await;
            }
            match self.push_entry(entry).await? {
                PushOutcome::Pushed => report.pushed += 1,
                PushOutcome::Deferred => report.deferred += 1,
                PushOutcome::Failed => report.failed += 1,
                PushOutcome::Orphaned => report.orphaned += 1,
                PushOutcome::Skipped => {}
            }
        }
        Ok(())
    }

    async fn push_entry(&self, entry: &JournalEntry) -> SyncResult<PushOutcome> {
        let journal = self.db.journal();
        if !journal.mark_syncing(entry.id).await? {
            debug!(entry_id = entry.id, "Entry no longer pending, skipped");
            return Ok(PushOutcome::Skipped);
        }

        let remote_id = match self.push_remote(entry).await {
            Ok(remote_id) => remote_id,
            Err(e) => {
                let class = e.class();
                warn!(
                    entry_id = entry.id,
                    table = %entry.table_name,
                    record_id = %entry.record_id,
                    class = ?class,
                    error = %e,
                    "Push failed"
                );
                journal.mark_error(entry.id, class, &e.to_string()).await?;
                return Ok(match e {
                    SyncError::WaitingForParent { .. } | SyncError::WaitingForCreate { .. } => {
                        PushOutcome::Deferred
                    }
                    _ => PushOutcome::Failed,
                });
            }
        };

        // phase 2: the remote write is acknowledged; record it locally
        match self.finish_push(entry, remote_id.as_deref()).await {
            Ok(()) => {
                debug!(
                    entry_id = entry.id,
                    table = %entry.table_name,
                    record_id = %entry.record_id,
                    remote_id = ?remote_id,
                    "Entry pushed"
                );
                Ok(PushOutcome::Pushed)
            }
            Err(e) => {
                error!(
                    entry_id = entry.id,
                    table = %entry.table_name,
                    record_id = %entry.record_id,
                    remote_id = ?remote_id,
                    error = %e,
                    "orphaned remote write"
                );
                if let Err(mark) = journal
                    .mark_error(
                        entry.id,
                        ErrorClass::Permanent,
                        &format!("remote write not recorded locally: {e}"),
                    )
                    .await
                {
                    warn!(entry_id = entry.id, error = %mark, "Could not flag orphaned entry");
                }
                Ok(PushOutcome::Orphaned)
            }
        }
    }

    async fn finish_push(&self, entry: &JournalEntry, remote_id: Option<&str>) -> SyncResult<()> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        if let Some(remote_id) = remote_id.filter(|id| *id != entry.record_id) {
            IdMappingRepository::record_in(&mut tx, &entry.table_name, &entry.record_id, remote_id, now)
                .await?;
        }
        ChangeJournalRepository::mark_synced_in(&mut tx, entry.id, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Performs the remote side of one entry.
    ///
    /// ## Returns
    /// The server id the record now has, or `None` when nothing was sent
    /// (delete of a record the server never saw and never will). A delete
    /// whose create is still queued or failed waits for it.
    async fn push_remote(&self, entry: &JournalEntry) -> SyncResult<Option<String>> {
        let kind: EntityKind = entry.table_name.parse()?;
        let spec = kind.spec();
        let now = Utc::now();
        let target = self
            .db
            .mappings()
            .lookup(kind.table_name(), &entry.record_id)
            .await?
            .unwrap_or_else(|| entry.record_id.clone());

        match entry.change_type {
            ChangeType::Delete => {
                if !is_remote_id(&target) {
                    let mut conn = self.db.pool().acquire().await?;
                    let unsynced = ChangeJournalRepository::has_unsynced_write_in(
                        &mut conn,
                        kind,
                        &entry.record_id,
                    )
                    .await?;
                    if unsynced {
                        return Err(SyncError::WaitingForCreate {
                            table: kind.to_string(),
                            record_id: entry.record_id.clone(),
                        });
                    }
                    debug!(table = %kind, record_id = %entry.record_id, "Never pushed, delete is local only");
                    return Ok(None);
                }
                let at = entry
                    .payload_record()
                    .and_then(|r| parse_json_ts(r.get(DELETED_AT)))
                    .unwrap_or(now);
                self.backend.soft_delete(spec, &target, at).await?;
                Ok(Some(target))
            }
            ChangeType::Create | ChangeType::Update => {
                let mut conn = self.db.pool().acquire().await?;
                let snapshot = match entry.payload_record() {
                    Some(record) => record.clone(),
                    None => self
                        .registry
                        .get(kind)?
                        .get_by_id(&mut conn, &entry.record_id)
                        .await?
                        .ok_or_else(|| {
                            CoreError::invalid_payload(kind.table_name(), "no snapshot and no local row")
                        })?,
                };
                let data = self
                    .translator
                    .translate_outbound_in(&mut conn, spec, &snapshot, now)
                    .await?
                    .into_ready()?;
                drop(conn);

                let outcome = self.backend.upsert(spec, &target, &data).await?;
                Ok(Some(outcome.remote_id))
            }
            ChangeType::Conflict => Err(SyncError::Internal(format!(
                "conflict entry {} reached the push queue",
                entry.id
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Pull
    // -------------------------------------------------------------------------

    /// Pulls and applies remote changes.
    ///
    /// Starts from the later of `since` and the stored checkpoint, and moves
    /// the checkpoint to the pull start time even when nothing changed.
    pub async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> SyncResult<PullReport> {
        let (metadata, token) = self.lock_enabled().await?;
        let effective = match (since, metadata.last_sync_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let result = self.pull_locked(effective).await;
        self.unlock(token).await;
        result
    }

    async fn pull_locked(&self, since: Option<DateTime<Utc>>) -> SyncResult<PullReport> {
        let started = Utc::now();
        let metadata = self.db.metadata().get().await?;
        let ctx = ApplyContext {
            strategy: metadata.conflict_strategy,
            last_sync_at: metadata.last_sync_at,
            adopt_only: false,
        };
        let mut report = PullReport::default();

        self.retry_backlog(&ctx, &mut report).await?;

        let changes = self.backend.get_changes(since).await?;
        report.fetched = to_u32(changes.len() as u64);
        for change in &changes {
            self.apply_and_count(change, &ctx, &mut report).await?;
        }

        self.db.metadata().set_last_sync_at(started).await?;
        debug!(
            fetched = report.fetched,
            applied = report.applied,
            conflicts = report.conflicts,
            deferred = report.deferred,
            "Pull finished"
        );
        Ok(report)
    }

    async fn retry_backlog(&self, ctx: &ApplyContext, report: &mut PullReport) -> SyncResult<()> {
        let backlog = self.db.backlog();
        for parked in backlog.list().await? {
            let change = &parked.change;
            match self.apply_change(change, ctx).await {
                Ok((_, outcome)) => match outcome.deferral_reason() {
                    Some(reason) => backlog.save(change, &reason).await?,
                    None => report.backlog_applied += 1,
                },
                Err(e) => {
                    warn!(table = %change.table, remote_id = %change.record_id, error = %e, "Backlog change failed again");
                    backlog.save(change, &e.to_string()).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_and_count(
        &self,
        change: &RemoteChange,
        ctx: &ApplyContext,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        match self.apply_change(change, ctx).await {
            Ok((_, outcome)) => match outcome {
                ApplyOutcome::Written => report.applied += 1,
                ApplyOutcome::Ignored => report.ignored += 1,
                ApplyOutcome::KeptLocal => report.kept_local += 1,
                ApplyOutcome::Conflict => report.conflicts += 1,
                ApplyOutcome::Deferred { .. } => {
                    let reason = outcome.deferral_reason().unwrap_or_default();
                    self.db.backlog().save(change, &reason).await?;
                    report.deferred += 1;
                }
            },
            Err(e) => {
                warn!(table = %change.table, remote_id = %change.record_id, error = %e, "Remote change not applied");
                self.db.backlog().save(change, &e.to_string()).await?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Applies one remote change in its own transaction.
    ///
    /// A deferred change is rolled back; the caller parks it. Any applied
    /// change clears a parked copy of the same row.
    async fn apply_change(
        &self,
        change: &RemoteChange,
        ctx: &ApplyContext,
    ) -> SyncResult<(String, ApplyOutcome)> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let (local_id, outcome) = self.apply_in(&mut tx, change, ctx, now).await?;
        if matches!(outcome, ApplyOutcome::Deferred { .. }) {
            tx.rollback().await?;
            return Ok((local_id, outcome));
        }
        RemoteBacklogRepository::remove_in(&mut tx, change.table, &change.record_id).await?;
        tx.commit().await?;
        Ok((local_id, outcome))
    }

    async fn apply_in(
        &self,
        conn: &mut SqliteConnection,
        change: &RemoteChange,
        ctx: &ApplyContext,
        now: DateTime<Utc>,
    ) -> SyncResult<(String, ApplyOutcome)> {
        let kind = change.table;
        let spec = kind.spec();
        let adapter = self.registry.get(kind)?;
        let local_id = self.resolve_local_id(conn, change, now).await?;
        let local = adapter.get_by_id(conn, &local_id).await?;

        if ctx.adopt_only && local.is_some() {
            return Ok((local_id, ApplyOutcome::Ignored));
        }

        let input = ConflictInput {
            change_type: change.change_type,
            remote_marks_deleted: change.marks_deleted(),
            local_exists: local.is_some(),
            local_updated_at: local
                .as_ref()
                .and_then(|row| parse_json_ts(row.get(spec.change_timestamp_column()))),
            last_sync_at: ctx.last_sync_at,
            has_active_entry: ChangeJournalRepository::has_active_entry_in(conn, kind, &local_id)
                .await?,
            strategy: ctx.strategy,
        };

        let resolution = resolve(&input);
        match resolution {
            Resolution::Ignore => Ok((local_id, ApplyOutcome::Ignored)),
            Resolution::KeepLocal => {
                debug!(table = %kind, record_id = %local_id, "Local version kept");
                Ok((local_id, ApplyOutcome::KeptLocal))
            }
            Resolution::DeferToManual => {
                let payload = json!({
                    "local": local,
                    "remote": change.data,
                    "remote_id": change.record_id,
                    "change_type": change.change_type,
                });
                ChangeJournalRepository::enqueue_in(
                    conn,
                    kind.table_name(),
                    &local_id,
                    ChangeType::Conflict,
                    Some(&payload),
                    now,
                )
                .await?;
                info!(table = %kind, record_id = %local_id, "Conflict parked for manual resolution");
                Ok((local_id, ApplyOutcome::Conflict))
            }
            Resolution::Adopt | Resolution::ApplyRemote => {
                if effective_change_type(change.change_type, input.remote_marks_deleted)
                    == ChangeType::Delete
                {
                    let at = parse_json_ts(change.data.get(DELETED_AT)).unwrap_or(now);
                    adapter.soft_delete(conn, &local_id, at).await?;
                } else {
                    match self
                        .translator
                        .translate_inbound_in(conn, spec, &change.data)
                        .await?
                    {
                        Inbound::WaitingForParent {
                            field,
                            parent,
                            remote_id,
                        } => {
                            debug!(
                                table = %kind,
                                remote_id = %change.record_id,
                                parent = %parent,
                                parent_id = %remote_id,
                                "Remote change waiting for parent"
                            );
                            return Ok((
                                local_id,
                                ApplyOutcome::Deferred {
                                    field,
                                    parent,
                                    remote_id,
                                },
                            ));
                        }
                        Inbound::Ready(mut data) => {
                            data.insert("id".to_string(), Value::String(local_id.clone()));
                            adapter.upsert_from_remote(conn, &data).await?;
                        }
                    }
                }

                if resolution == Resolution::ApplyRemote {
                    let dropped =
                        ChangeJournalRepository::discard_pending_in(conn, kind, &local_id).await?;
                    if dropped > 0 {
                        debug!(table = %kind, record_id = %local_id, dropped, "Superseded local changes dropped");
                    }
                }
                Ok((local_id, ApplyOutcome::Written))
            }
        }
    }

    /// Finds the local row a remote change refers to.
    ///
    /// Order: reverse mapping, a local row with the same id, a local row with
    /// the same natural key (mapping recorded), else the remote id itself.
    async fn resolve_local_id(
        &self,
        conn: &mut SqliteConnection,
        change: &RemoteChange,
        now: DateTime<Utc>,
    ) -> SyncResult<String> {
        let table = change.table.table_name();
        if let Some(local_id) =
            IdMappingRepository::reverse_lookup_in(conn, table, &change.record_id).await?
        {
            return Ok(local_id);
        }

        let adapter = self.registry.get(change.table)?;
        if adapter.exists(conn, &change.record_id).await? {
            return Ok(change.record_id.clone());
        }

        let spec = change.table.spec();
        if let Some(value) = spec
            .natural_key
            .and_then(|column| change.data.get(column))
            .and_then(value_as_id)
        {
            if let Some(local_id) = adapter.find_by_natural_key(conn, &value).await? {
                IdMappingRepository::record_in(conn, table, &local_id, &change.record_id, now)
                    .await?;
                debug!(table = %change.table, local_id = %local_id, remote_id = %change.record_id, "Matched by natural key");
                return Ok(local_id);
            }
        }

        Ok(change.record_id.clone())
    }

    // -------------------------------------------------------------------------
    // Conflicts, Settings, Health
    // -------------------------------------------------------------------------

    /// Settles a parked conflict.
    ///
    /// `KeepLocal` re-journals the current local row as an update;
    /// `TakeRemote` writes the parked remote version over it. Either way the
    /// conflict entry is removed in the same transaction.
    pub async fn resolve_conflict(&self, entry_id: i64, choice: ConflictChoice) -> SyncResult<()> {
        let entry = self
            .db
            .journal()
            .get(entry_id)
            .await?
            .filter(|e| e.change_type == ChangeType::Conflict)
            .ok_or_else(|| DbError::not_found("conflict", entry_id.to_string()))?;
        let kind: EntityKind = entry.table_name.parse()?;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        match choice {
            ConflictChoice::KeepLocal => {
                if let Some(row) = self.registry.get(kind)?.get_by_id(&mut tx, &entry.record_id).await? {
                    ChangeJournalRepository::enqueue_in(
                        &mut tx,
                        kind.table_name(),
                        &entry.record_id,
                        ChangeType::Update,
                        Some(&Value::Object(row)),
                        now,
                    )
                    .await?;
                }
            }
            ConflictChoice::TakeRemote => {
                let payload = entry.payload_record().cloned().unwrap_or_default();
                let data = payload
                    .get("remote")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::invalid_payload(kind.table_name(), "conflict without remote version")
                    })?;
                let change = RemoteChange {
                    table: kind,
                    record_id: payload
                        .get("remote_id")
                        .and_then(value_as_id)
                        .unwrap_or_else(|| entry.record_id.clone()),
                    change_type: payload
                        .get("change_type")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or(ChangeType::Update),
                    data,
                    server_timestamp: None,
                };
                let ctx = ApplyContext {
                    strategy: ConflictStrategy::ServerWins,
                    last_sync_at: None,
                    adopt_only: false,
                };
                let (_, outcome) = self.apply_in(&mut tx, &change, &ctx, now).await?;
                if let ApplyOutcome::Deferred {
                    field,
                    parent,
                    remote_id,
                } = outcome
                {
                    return Err(SyncError::WaitingForParent {
                        field: field.to_string(),
                        parent: parent.to_string(),
                        parent_id: remote_id,
                    });
                }
            }
        }

        ChangeJournalRepository::delete_entry_in(&mut tx, entry_id).await?;
        tx.commit().await?;
        info!(entry_id, table = %kind, record_id = %entry.record_id, choice = ?choice, "Conflict resolved");
        Ok(())
    }

    /// Journals a local change made outside [`stockroom_db::EntityRepository`].
    pub async fn record_local_change(
        &self,
        kind: EntityKind,
        record_id: &str,
        change_type: ChangeType,
        payload: Option<&Value>,
    ) -> SyncResult<EnqueueOutcome> {
        Ok(self
            .db
            .journal()
            .enqueue(kind.table_name(), record_id, change_type, payload)
            .await?)
    }

    /// Applies a settings update and hands the new provider to the backend.
    pub async fn update_settings(&self, update: &SettingsUpdate) -> SyncResult<SyncMetadata> {
        let metadata = self.db.metadata().apply_settings(update).await?;
        self.backend.configure(&metadata.provider);
        Ok(metadata)
    }

    /// Current health snapshot.
    pub async fn health(&self) -> SyncResult<SyncHealth> {
        let counts = self.db.journal().counts().await?;
        let backlog = self.db.backlog().count().await?;
        let metadata = self.db.metadata().get().await?;
        Ok(SyncHealth::derive(&counts, backlog, metadata.last_sync_at, Utc::now()))
    }
}

fn is_deleted(row: &stockroom_core::Record) -> bool {
    row.get(DELETED_AT).map(|v| !v.is_null()).unwrap_or(false)
}

fn to_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
