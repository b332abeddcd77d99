//! Sync cycle state and reporting types.

use crate::error::SyncError;
use std::time::{Duration, Instant};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is fetching remote pages.
    Downloading,
    /// Engine is applying the downloaded batch in one local transaction.
    Applying,
    /// Engine is querying local rows changed since the watermark.
    Collecting,
    /// Engine is uploading local changes.
    Uploading,
    /// Engine is persisting the new watermark.
    Committing,
    /// The last cycle failed; the next trigger restarts from `Downloading`.
    Failed,
    /// Engine is waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Downloading
                | SyncState::Applying
                | SyncState::Collecting
                | SyncState::Uploading
                | SyncState::Committing
        )
    }

    /// Returns true if a new trigger may start a cycle.
    ///
    /// `RetryWait` is owned by the retry loop that entered it and only that
    /// loop resumes from it.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Failed)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that committed their watermark.
    pub cycles_completed: u64,
    /// Cycles that failed or ended with upload failures.
    pub cycles_failed: u64,
    /// Total number of entities downloaded.
    pub entities_downloaded: u64,
    /// Total number of entities uploaded and written back.
    pub entities_uploaded: u64,
    /// Total number of per-entity upload failures.
    pub upload_failures: u64,
    /// Total number of downloads kept back by the conflict policy.
    pub conflicts: u64,
    /// Total number of retries.
    pub retries: u64,
    /// Last time a cycle committed.
    pub last_sync_time: Option<Instant>,
    /// Last committed watermark.
    pub last_watermark: Option<i64>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Where an upload failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    /// The create or update request failed.
    Remote,
    /// The remote accepted the entity but the local write-back failed.
    WriteBack,
}

/// One entity that could not be uploaded.
#[derive(Debug)]
pub struct UploadFailure<E> {
    /// The entity, with any remote state the remote assigned.
    pub entity: E,
    /// Where the failure happened.
    pub stage: UploadStage,
    /// Id the remote assigned to a newly created object whose write-back
    /// then failed. The next cycle creates the entity again unless the
    /// caller records this id locally.
    pub assigned_remote_id: Option<String>,
    /// The error.
    pub error: SyncError,
}

/// A downloaded object the conflict policy kept from overwriting a local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConflict {
    /// Remote id of the object.
    pub remote_id: String,
    /// Local modification time of the row that was kept.
    pub local_modified_at: i64,
    /// Remote modification time of the object that was skipped.
    pub remote_modified_at: i64,
}

/// Result of a sync cycle.
#[derive(Debug)]
pub struct SyncCycleResult<E> {
    /// Objects received from the remote.
    pub downloaded: usize,
    /// Downloaded objects written to the local store.
    pub applied: usize,
    /// Downloads kept back by the conflict policy.
    pub conflicts: Vec<DownloadConflict>,
    /// Entities uploaded and written back, with their new remote state.
    pub uploaded: Vec<E>,
    /// Entities whose upload failed.
    pub failures: Vec<UploadFailure<E>>,
    /// Entities never sent because an earlier upload failed under
    /// [`crate::UploadPolicy::AbortOnFirstError`].
    pub skipped: Vec<E>,
    /// The watermark committed by this cycle, if any.
    pub watermark: Option<i64>,
    /// Whether every phase succeeded and the watermark was committed.
    pub success: bool,
    /// Whether [`crate::SyncEngine::cancel`] stopped the cycle after its
    /// uploads had been accounted for. The watermark is then not committed.
    pub cancelled: bool,
    /// Duration of the sync cycle.
    pub duration: Duration,
}

impl<E> SyncCycleResult<E> {
    pub(crate) fn new() -> Self {
        Self {
            downloaded: 0,
            applied: 0,
            conflicts: Vec::new(),
            uploaded: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            watermark: None,
            success: false,
            cancelled: false,
            duration: Duration::ZERO,
        }
    }
}
