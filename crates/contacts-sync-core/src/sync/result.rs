//! Pass outcomes

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{ConflictPayload, LocalId, RemoteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

/// A conflict detected during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictItem {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    #[serde(flatten)]
    pub payload: ConflictPayload,
}

/// Counters and timing for one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub mode: SyncMode,
    pub total_processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub errors: usize,
    /// The local side could not be listed; only unlinked remote records were imported
    pub degraded: bool,
    pub conflicts: Vec<ConflictItem>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SyncResult {
    pub(crate) const fn start(mode: SyncMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            total_processed: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            deleted: 0,
            errors: 0,
            degraded: false,
            conflicts: Vec::new(),
            started_at,
            completed_at: started_at,
            duration_ms: 0,
        }
    }

    pub(crate) fn finish(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = completed_at;
        self.duration_ms = u64::try_from((completed_at - self.started_at).num_milliseconds())
            .unwrap_or_default();
        self
    }
}

/// Outcome of pushing one local record to the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SingleSyncOutcome {
    Created { remote_id: RemoteId },
    Updated { remote_id: RemoteId },
    /// The record has no payload worth mirroring
    Skipped,
}

/// Outcome of removing one record from the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub remote_deleted: bool,
    pub link_removed: bool,
}
