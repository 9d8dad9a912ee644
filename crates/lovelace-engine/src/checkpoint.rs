//! Async access to the blocking checkpoint store for one (job, source) key.

use std::sync::Arc;
use std::time::Duration;

use lovelace_state::{CheckpointStore, StateError};
use lovelace_types::checkpoint::{Checkpoint, CommitOutcome};
use lovelace_types::cursor::Cursor;
use lovelace_types::dlq::DlqRecord;
use lovelace_types::state::{JobId, RunStats, RunStatus, SourceId};

use crate::errors::PipelineError;

/// Store calls taking longer than this fail the run.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);

async fn blocking<T, F>(task: &'static str, timeout: Duration, f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, StateError> + Send + 'static,
    T: Send + 'static,
{
    let joined = tokio::time::timeout(timeout, tokio::task::spawn_blocking(f))
        .await
        .map_err(|_| {
            PipelineError::Persistence(StateError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{task} did not complete within {}ms", timeout.as_millis()),
            )))
        })?;
    joined
        .map_err(|e| PipelineError::task_panicked(task, &e))?
        .map_err(PipelineError::from)
}

/// One run's view of the store: the key it works on and the lease holder
/// it writes as.
#[derive(Clone)]
pub struct CheckpointHandle {
    store: Arc<dyn CheckpointStore>,
    job: JobId,
    source: SourceId,
    holder: String,
    call_timeout: Duration,
}

impl CheckpointHandle {
    #[must_use]
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        job: JobId,
        source: SourceId,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            job,
            source,
            holder: holder.into(),
            call_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    #[must_use]
    pub fn job(&self) -> &JobId {
        &self.job
    }

    #[must_use]
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Persistence`] if the store cannot be read.
    pub async fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        let this = self.clone();
        blocking("load_checkpoint", self.call_timeout, move || {
            this.store.load(&this.job, &this.source)
        })
        .await
    }

    /// Commit `cursor` as this run's lease holder.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Persistence`] if the write fails, the lease
    /// was lost, or the cursor kind does not match the stored one.
    pub async fn commit(&self, cursor: Cursor) -> Result<CommitOutcome, PipelineError> {
        let this = self.clone();
        let offered = cursor.clone();
        let outcome = blocking("commit_checkpoint", self.call_timeout, move || {
            this.store
                .commit(&this.job, &this.source, &offered, &this.holder)
        })
        .await?;
        match outcome {
            CommitOutcome::Regressed => tracing::warn!(
                job = self.job.as_str(),
                source = self.source.as_str(),
                cursor = %cursor,
                "Ignored checkpoint older than the stored one"
            ),
            _ => tracing::info!(
                job = self.job.as_str(),
                source = self.source.as_str(),
                cursor = %cursor,
                outcome = outcome.as_str(),
                "Checkpoint committed"
            ),
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Persistence`] on storage failure.
    pub async fn acquire_lease(&self, ttl: Duration) -> Result<bool, PipelineError> {
        let this = self.clone();
        blocking("acquire_lease", self.call_timeout, move || {
            this.store
                .acquire_lease(&this.job, &this.source, &this.holder, ttl)
        })
        .await
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Persistence`] on storage failure.
    pub async fn renew_lease(&self, ttl: Duration) -> Result<bool, PipelineError> {
        let this = self.clone();
        blocking("renew_lease", self.call_timeout, move || {
            this.store
                .renew_lease(&this.job, &this.source, &this.holder, ttl)
        })
        .await
    }

    /// Best-effort release; failures are logged, the lease expires anyway.
    pub async fn release_lease(&self) {
        let this = self.clone();
        let result = blocking("release_lease", self.call_timeout, move || {
            this.store.release_lease(&this.job, &this.source, &this.holder)
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(
                job = self.job.as_str(),
                source = self.source.as_str(),
                error = %e,
                "Failed to release lease"
            );
        }
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Persistence`] on storage failure.
    pub async fn start_run(&self) -> Result<i64, PipelineError> {
        let this = self.clone();
        blocking("start_run", self.call_timeout, move || {
            this.store.start_run(&this.job, &this.source)
        })
        .await
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::Persistence`] on storage failure.
    pub async fn complete_run(
        &self,
        run_id: i64,
        status: RunStatus,
        stats: RunStats,
    ) -> Result<(), PipelineError> {
        let store = Arc::clone(&self.store);
        blocking("complete_run", self.call_timeout, move || {
            store.complete_run(run_id, status, &stats)
        })
        .await
    }

    /// Persist dead-letter entries; failures are logged and swallowed.
    pub async fn persist_dlq(&self, run_id: i64, records: Vec<DlqRecord>) {
        if records.is_empty() {
            return;
        }
        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            crate::dlq::persist_dlq_records(this.store.as_ref(), &this.job, run_id, &records);
        })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "persist_dlq_records task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lovelace_state::SqliteCheckpointStore;

    fn handle(holder: &str, store: Arc<dyn CheckpointStore>) -> CheckpointHandle {
        CheckpointHandle::new(store, JobId::new("reviews"), SourceId::new("metacritic"), holder)
    }

    #[tokio::test]
    async fn commit_requires_the_lease() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let owner = handle("run-a", Arc::clone(&store));
        let other = handle("run-b", Arc::clone(&store));

        assert!(owner.acquire_lease(Duration::from_secs(60)).await.unwrap());
        assert!(!other.acquire_lease(Duration::from_secs(60)).await.unwrap());

        assert_eq!(
            owner.commit(Cursor::Offset(20)).await.unwrap(),
            CommitOutcome::Advanced
        );
        assert!(matches!(
            other.commit(Cursor::Offset(30)).await,
            Err(PipelineError::Persistence(StateError::LeaseNotHeld { .. }))
        ));
        assert_eq!(
            owner.commit(Cursor::Offset(10)).await.unwrap(),
            CommitOutcome::Regressed
        );
        assert_eq!(
            owner.load().await.unwrap().unwrap().cursor,
            Cursor::Offset(20)
        );

        owner.release_lease().await;
        assert!(other.acquire_lease(Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn run_history_round_trip() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::in_memory().unwrap());
        let h = handle("run-a", Arc::clone(&store));
        let run_id = h.start_run().await.unwrap();
        let stats = RunStats {
            records_extracted: 3,
            records_delivered: 3,
            ..RunStats::default()
        };
        h.complete_run(run_id, RunStatus::Committed, stats).await.unwrap();
        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Committed);
        assert_eq!(run.stats.records_delivered, 3);
    }
}
