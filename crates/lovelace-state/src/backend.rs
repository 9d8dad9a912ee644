//! Checkpoint store trait definition.
//!
//! [`CheckpointStore`] defines the storage contract for cursor checkpoints,
//! per-key run leases, run history, and dead-letter queue records. Model
//! types live in [`lovelace_types`].

use std::cmp::Ordering;
use std::time::Duration;

use lovelace_types::checkpoint::{Checkpoint, CommitOutcome};
use lovelace_types::cursor::Cursor;
use lovelace_types::dlq::DlqRecord;
use lovelace_types::state::{JobId, RunRecord, RunStats, RunStatus, SourceId};

use crate::error::{self, StateError};

/// Storage contract for pipeline checkpoints.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CheckpointStore>`.
/// Calls block; async callers should go through `spawn_blocking`.
pub trait CheckpointStore: Send + Sync {
    /// Read the committed checkpoint for a (job, source) pair.
    ///
    /// Returns `Ok(None)` when nothing has been committed yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure or an undecodable cursor.
    fn load(&self, job: &JobId, source: &SourceId) -> error::Result<Option<Checkpoint>>;

    /// Durably advance the checkpoint for a (job, source) pair.
    ///
    /// Committing the stored cursor again is a no-op; committing an older
    /// cursor is ignored. Both are reported through [`CommitOutcome`].
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LeaseNotHeld`] if `holder` does not own the
    /// key's lease, [`StateError::CursorKindMismatch`] if the stored cursor
    /// is of another kind, or a backend error on storage failure.
    fn commit(
        &self,
        job: &JobId,
        source: &SourceId,
        cursor: &Cursor,
        holder: &str,
    ) -> error::Result<CommitOutcome>;

    /// Try to take the run lease for a key. Succeeds when the key is free,
    /// its lease has expired, or `holder` already owns it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn acquire_lease(
        &self,
        job: &JobId,
        source: &SourceId,
        holder: &str,
        ttl: Duration,
    ) -> error::Result<bool>;

    /// Extend a held lease. Returns `false` if `holder` lost it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn renew_lease(
        &self,
        job: &JobId,
        source: &SourceId,
        holder: &str,
        ttl: Duration,
    ) -> error::Result<bool>;

    /// Drop a held lease. Releasing a lease owned by someone else is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn release_lease(&self, job: &JobId, source: &SourceId, holder: &str) -> error::Result<()>;

    /// Begin a new run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn start_run(&self, job: &JobId, source: &SourceId) -> error::Result<i64>;

    /// Finalize a run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats)
        -> error::Result<()>;

    /// Read one run-history row.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn get_run(&self, run_id: i64) -> error::Result<Option<RunRecord>>;

    /// Persist dead-letter queue records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn insert_dlq_records(
        &self,
        job: &JobId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64>;

    /// Dead-letter records written by one run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn list_dlq_records(&self, job: &JobId, run_id: i64) -> error::Result<Vec<DlqRecord>>;
}

/// Decide what a commit does given the currently stored cursor.
///
/// Shared by every backend so the monotonicity rule lives in one place.
///
/// # Errors
///
/// Returns [`StateError::CursorKindMismatch`] when kinds differ.
pub fn commit_outcome(stored: Option<&Cursor>, offered: &Cursor) -> error::Result<CommitOutcome> {
    let Some(stored) = stored else {
        return Ok(CommitOutcome::Advanced);
    };
    let ordering = offered
        .compare(stored)
        .map_err(|_| StateError::CursorKindMismatch {
            stored: stored.kind(),
            offered: offered.kind(),
        })?;
    Ok(match ordering {
        Ordering::Greater => CommitOutcome::Advanced,
        Ordering::Equal => CommitOutcome::Unchanged,
        Ordering::Less => CommitOutcome::Regressed,
    })
}

/// Lease expiry in epoch milliseconds.
pub(crate) fn expiry_millis(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
