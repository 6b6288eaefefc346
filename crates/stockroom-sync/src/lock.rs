//! # Sync Lock
//!
//! Two-level mutual exclusion for sync runs.
//!
//! ## Lock Levels
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncLock::acquire()                            │
//! │                                                                         │
//! │  1. In-process flag (AtomicBool compare-exchange)                       │
//! │     └── already set? ──► busy (same process, run in flight)             │
//! │                                                                         │
//! │  2. Persisted lease (sync_metadata.lock_expires_at)                     │
//! │     └── live lease with > 1s left? ──► busy (other process)            │
//! │     └── absent / expired / < 1s left ──► write now + lease             │
//! │                                                                         │
//! │  3. Lease timeout task                                                  │
//! │     └── release() never called within the lease? drop the flag so     │
//! │         the next caller can steal the expired lease                     │
//! │                                                                         │
//! │  Unlocked ──acquire──► Locked(token) ──release(token)──► Unlocked       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`LockToken`] names one holding. Releasing with a token whose lease was
//! taken over by a later holder changes nothing.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use stockroom_core::LOCK_STEAL_WINDOW_MS;
use stockroom_db::SyncMetadataRepository;

use crate::error::{SyncError, SyncResult};

/// Proof of one successful [`SyncLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    generation: u64,
    expires_at: DateTime<Utc>,
}

impl LockToken {
    /// When the persisted lease runs out.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Run lock shared by everything that syncs against one database.
#[derive(Debug)]
pub struct SyncLock {
    metadata: SyncMetadataRepository,
    held: Arc<AtomicBool>,
    /// Bumped on every acquire; the current holding's number.
    generation: Arc<AtomicU64>,
    lease: Duration,
    timeout: Mutex<Option<JoinHandle<()>>>,
}

impl SyncLock {
    pub fn new(metadata: SyncMetadataRepository, lease: Duration) -> Self {
        SyncLock {
            metadata,
            held: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            lease,
            timeout: Mutex::new(None),
        }
    }

    /// Tries to take the lock.
    ///
    /// ## Returns
    /// * `Ok(Some(token))` - Lock held; pass the token to
    ///   [`release`](Self::release) when done
    /// * `Ok(None)` - Another run holds it
    pub async fn acquire(&self) -> SyncResult<Option<LockToken>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync lock busy in this process");
            return Ok(None);
        }

        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|e| SyncError::InvalidConfig(format!("lease out of range: {e}")))?;
        let steal_window = chrono::Duration::milliseconds(LOCK_STEAL_WINDOW_MS);

        let expires_at = match self
            .metadata
            .try_acquire_lease(Utc::now(), lease, steal_window)
            .await
        {
            Ok(Some(expires_at)) => expires_at,
            Ok(None) => {
                self.held.store(false, Ordering::Release);
                debug!("Sync lease held elsewhere");
                return Ok(None);
            }
            Err(e) => {
                self.held.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let held = Arc::clone(&self.held);
        let current = Arc::clone(&self.generation);
        let lease = self.lease;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(lease).await;
            if current.load(Ordering::Acquire) == generation && held.swap(false, Ordering::AcqRel) {
                warn!(lease_secs = lease.as_secs(), "Sync lease elapsed without release");
            }
        });
        if let Some(previous) = self.swap_timeout(Some(handle)) {
            previous.abort();
        }

        debug!(generation, "Sync lock acquired");
        Ok(Some(LockToken {
            generation,
            expires_at,
        }))
    }

    /// Ends the holding named by `token`: clears the persisted lease, the
    /// in-process flag and the timeout task.
    ///
    /// A token outlived by its lease whose lock has since been taken again
    /// releases nothing.
    pub async fn release(&self, token: LockToken) -> SyncResult<()> {
        let current = self.generation.load(Ordering::Acquire) == token.generation;
        if current {
            if let Some(handle) = self.swap_timeout(None) {
                handle.abort();
            }
        }
        let result = self.metadata.release_lease(token.expires_at).await;
        if current {
            self.held.store(false, Ordering::Release);
            debug!(generation = token.generation, "Sync lock released");
        } else {
            warn!(generation = token.generation, "Stale sync lock release ignored");
        }
        result.map(|_| ()).map_err(SyncError::from)
    }

    /// True while this process holds the lock.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn swap_timeout(&self, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        match self.timeout.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, handle),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockroom_core::time::format_ts;
    use stockroom_db::{Database, DbConfig};

    async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    async fn set_persisted_lease(db: &Database, expires_in: chrono::Duration) {
        db.metadata().get().await.unwrap();
        sqlx::query("UPDATE sync_metadata SET lock_expires_at = ?1 WHERE id = 1")
            .bind(format_ts(Utc::now() + expires_in))
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_in_process() {
        let db = setup().await;
        let lock = SyncLock::new(db.metadata(), Duration::from_secs(300));

        let token = lock.acquire().await.unwrap().unwrap();
        assert!(lock.is_held());
        assert!(lock.acquire().await.unwrap().is_none());

        lock.release(token).await.unwrap();
        assert!(!lock.is_held());
        assert!(db.metadata().lease_expires_at().await.unwrap().is_none());
        assert!(lock.acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_live_lease_from_other_process_blocks() {
        let db = setup().await;
        set_persisted_lease(&db, chrono::Duration::minutes(4)).await;

        let lock = SyncLock::new(db.metadata(), Duration::from_secs(300));
        assert!(lock.acquire().await.unwrap().is_none());
        // a failed acquire leaves nothing behind in this process
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_expired_or_nearly_expired_lease_is_stolen() {
        let db = setup().await;
        let lock = SyncLock::new(db.metadata(), Duration::from_secs(300));

        set_persisted_lease(&db, chrono::Duration::milliseconds(400)).await;
        let token = lock.acquire().await.unwrap().unwrap();
        lock.release(token).await.unwrap();

        set_persisted_lease(&db, chrono::Duration::minutes(-1)).await;
        let token = lock.acquire().await.unwrap().unwrap();
        lock.release(token).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_timeout_drops_flag() {
        let db = setup().await;
        let lock = SyncLock::new(db.metadata(), Duration::from_millis(50));

        assert!(lock.acquire().await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;

        // never released: flag dropped and the expired lease can be stolen
        assert!(!lock.is_held());
        let token = lock.acquire().await.unwrap().unwrap();
        lock.release(token).await.unwrap();
    }

    #[tokio::test]
    async fn test_overdue_holder_cannot_release_successor() {
        let db = setup().await;
        let lock = SyncLock::new(db.metadata(), Duration::from_millis(50));

        let first = lock.acquire().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = lock.acquire().await.unwrap().unwrap();
        assert_ne!(first, second);

        // the first holder finishes late
        lock.release(first).await.unwrap();
        assert!(lock.is_held());
        assert_eq!(
            db.metadata().lease_expires_at().await.unwrap(),
            Some(second.expires_at())
        );
        assert!(lock.acquire().await.unwrap().is_none());

        lock.release(second).await.unwrap();
        assert!(!lock.is_held());
        assert!(db.metadata().lease_expires_at().await.unwrap().is_none());
    }
}
