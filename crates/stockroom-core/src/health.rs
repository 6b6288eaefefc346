//! # Sync Health
//!
//! Derives an operational health level from journal counts and the age of
//! the last successful sync. Surfacing only; nothing here remediates.
//!
//! | Level    | Any of                                                        |
//! |----------|---------------------------------------------------------------|
//! | critical | error rate ≥ 50%, ≥ 5 stuck entries, last sync > 24h with work |
//! | warning  | error rate ≥ 10%, any stuck entry, any conflict, last sync > 1h |
//! | healthy  | otherwise                                                     |

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::JournalCounts;

const CRITICAL_ERROR_RATE: f64 = 0.5;
const WARNING_ERROR_RATE: f64 = 0.1;
const CRITICAL_STUCK: i64 = 5;
const CRITICAL_STALE_HOURS: i64 = 24;
const WARNING_STALE_HOURS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Status snapshot exposed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncHealth {
    pub pending: i64,
    pub syncing: i64,
    pub errors: i64,
    pub permanent_errors: i64,
    pub stuck: i64,
    pub conflicts: i64,
    /// Inbound changes waiting for a parent.
    pub backlog: i64,
    #[ts(as = "Option<String>")]
    pub last_sync_at: Option<DateTime<Utc>>,
    /// errors / (synced + errors), 0 when nothing was attempted.
    pub error_rate: f64,
    pub level: HealthLevel,
}

impl SyncHealth {
    pub fn derive(
        counts: &JournalCounts,
        backlog: i64,
        last_sync_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let attempted = counts.synced + counts.errors;
        let error_rate = if attempted == 0 {
            0.0
        } else {
            counts.errors as f64 / attempted as f64
        };

        let has_work = counts.pending + counts.errors + backlog > 0;
        let age = last_sync_at.map(|ts| now - ts);
        let older_than = |hours: i64| age.map(|a| a > Duration::hours(hours));

        let level = if error_rate >= CRITICAL_ERROR_RATE
            || counts.stuck >= CRITICAL_STUCK
            || (has_work && older_than(CRITICAL_STALE_HOURS).unwrap_or(false))
        {
            HealthLevel::Critical
        } else if error_rate >= WARNING_ERROR_RATE
            || counts.stuck > 0
            || counts.conflicts > 0
            || older_than(WARNING_STALE_HOURS).unwrap_or(false)
        {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        SyncHealth {
            pending: counts.pending,
            syncing: counts.syncing,
            errors: counts.errors,
            permanent_errors: counts.permanent_errors,
            stuck: counts.stuck,
            conflicts: counts.conflicts,
            backlog,
            last_sync_at,
            error_rate,
            level,
        }
    }
}
