//! `PostgreSQL`-backed implementation of [`CheckpointStore`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. The `postgres` crate manages its own internal tokio
//! runtime, so it must be opened and driven from a blocking thread.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lovelace_types::checkpoint::{Checkpoint, CommitOutcome};
use lovelace_types::cursor::{Cursor, CursorKind};
use lovelace_types::dlq::{DlqKind, DlqRecord};
use lovelace_types::record::format_timestamp;
use lovelace_types::state::{JobId, RunRecord, RunStats, RunStatus, SourceId};
use postgres::{Client, NoTls};

use crate::backend::{commit_outcome, expiry_millis, CheckpointStore};
use crate::error::{self, StateError};

/// Idempotent DDL for state tables (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    job_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    cursor_kind TEXT NOT NULL,
    cursor_value TEXT NOT NULL,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (job_id, source_id)
);

CREATE TABLE IF NOT EXISTS run_leases (
    job_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    holder TEXT NOT NULL,
    expires_at_ms BIGINT NOT NULL,
    PRIMARY KEY (job_id, source_id)
);

CREATE TABLE IF NOT EXISTS runs (
    id BIGSERIAL PRIMARY KEY,
    job_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (now()::text),
    finished_at TEXT,
    records_extracted BIGINT DEFAULT 0,
    records_delivered BIGINT DEFAULT 0,
    records_rejected BIGINT DEFAULT 0,
    subunits_skipped BIGINT DEFAULT 0,
    error_kind TEXT,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS dlq_records (
    id BIGSERIAL PRIMARY KEY,
    job_id TEXT NOT NULL,
    run_id BIGINT NOT NULL REFERENCES runs(id),
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    error_message TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (now()::text)
);

CREATE INDEX IF NOT EXISTS idx_dlq_job_run ON dlq_records (job_id, run_id);
";

/// `PostgreSQL`-backed checkpoint storage.
///
/// Create with [`PostgresCheckpointStore::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=lovelace user=postgres"`).
pub struct PostgresCheckpointStore {
    client: Mutex<Client>,
}

impl PostgresCheckpointStore {
    /// Connect to a `PostgreSQL` database and initialize state tables.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls)
            .map_err(|e| StateError::backend_context("open: connect", e))?;
        client
            .batch_execute(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("open: create tables", e))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn parse_time(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).map_or(DateTime::UNIX_EPOCH, |dt| dt.with_timezone(&Utc))
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn load(&self, job: &JobId, source: &SourceId) -> error::Result<Option<Checkpoint>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT cursor_kind, cursor_value, committed_at \
                 FROM checkpoints WHERE job_id = $1 AND source_id = $2",
                &[&job.as_str(), &source.as_str()],
            )
            .map_err(|e| StateError::backend_context("load", e))?;

        match rows.first() {
            Some(row) => {
                let kind: String = row.get(0);
                let value: String = row.get(1);
                let committed_at: String = row.get(2);
                Ok(Some(Checkpoint {
                    job_id: job.clone(),
                    source_id: source.clone(),
                    cursor: Cursor::decode(CursorKind::parse(&kind)?, &value)?,
                    committed_at: Self::parse_time(&committed_at),
                }))
            }
            None => Ok(None),
        }
    }

    fn commit(
        &self,
        job: &JobId,
        source: &SourceId,
        cursor: &Cursor,
        holder: &str,
    ) -> error::Result<CommitOutcome> {
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::backend_context("commit: begin tx", e))?;

        // Row lock on the lease serializes commits for this key.
        let lease = tx
            .query_opt(
                "SELECT holder FROM run_leases WHERE job_id = $1 AND source_id = $2 FOR UPDATE",
                &[&job.as_str(), &source.as_str()],
            )
            .map_err(|e| StateError::backend_context("commit: read lease", e))?;
        let lease_holder: Option<String> = lease.map(|row| row.get(0));
        if lease_holder.as_deref() != Some(holder) {
            return Err(StateError::LeaseNotHeld {
                job: job.to_string(),
                source_id: source.to_string(),
                holder: holder.to_string(),
            });
        }

        let stored = tx
            .query_opt(
                "SELECT cursor_kind, cursor_value FROM checkpoints \
                 WHERE job_id = $1 AND source_id = $2 FOR UPDATE",
                &[&job.as_str(), &source.as_str()],
            )
            .map_err(|e| StateError::backend_context("commit: read checkpoint", e))?;
        let stored = match stored {
            Some(row) => {
                let kind: String = row.get(0);
                let value: String = row.get(1);
                Some(Cursor::decode(CursorKind::parse(&kind)?, &value)?)
            }
            None => None,
        };

        let outcome = commit_outcome(stored.as_ref(), cursor)?;
        if outcome == CommitOutcome::Advanced {
            let encoded = cursor.encode();
            let committed_at = format_timestamp(&Utc::now());
            tx.execute(
                "INSERT INTO checkpoints (job_id, source_id, cursor_kind, cursor_value, committed_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (job_id, source_id) \
                 DO UPDATE SET cursor_kind = $3, cursor_value = $4, committed_at = $5",
                &[
                    &job.as_str(),
                    &source.as_str(),
                    &cursor.kind().as_str(),
                    &encoded,
                    &committed_at,
                ],
            )
            .map_err(|e| StateError::backend_context("commit: write checkpoint", e))?;
        }
        tx.commit()
            .map_err(|e| StateError::backend_context("commit: commit tx", e))?;
        Ok(outcome)
    }

    fn acquire_lease(
        &self,
        job: &JobId,
        source: &SourceId,
        holder: &str,
        ttl: Duration,
    ) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let now = Utc::now().timestamp_millis();
        let rows = client
            .execute(
                "INSERT INTO run_leases (job_id, source_id, holder, expires_at_ms) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (job_id, source_id) DO UPDATE \
                 SET holder = EXCLUDED.holder, expires_at_ms = EXCLUDED.expires_at_ms \
                 WHERE run_leases.holder = EXCLUDED.holder OR run_leases.expires_at_ms <= $5",
                &[
                    &job.as_str(),
                    &source.as_str(),
                    &holder,
                    &expiry_millis(now, ttl),
                    &now,
                ],
            )
            .map_err(|e| StateError::backend_context("acquire_lease", e))?;
        Ok(rows > 0)
    }

    fn renew_lease(
        &self,
        job: &JobId,
        source: &SourceId,
        holder: &str,
        ttl: Duration,
    ) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let expires = expiry_millis(Utc::now().timestamp_millis(), ttl);
        let rows = client
            .execute(
                "UPDATE run_leases SET expires_at_ms = $1 \
                 WHERE job_id = $2 AND source_id = $3 AND holder = $4",
                &[&expires, &job.as_str(), &source.as_str(), &holder],
            )
            .map_err(|e| StateError::backend_context("renew_lease", e))?;
        Ok(rows > 0)
    }

    fn release_lease(&self, job: &JobId, source: &SourceId, holder: &str) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "DELETE FROM run_leases WHERE job_id = $1 AND source_id = $2 AND holder = $3",
                &[&job.as_str(), &source.as_str(), &holder],
            )
            .map_err(|e| StateError::backend_context("release_lease", e))?;
        Ok(())
    }

    fn start_run(&self, job: &JobId, source: &SourceId) -> error::Result<i64> {
        let mut client = self.lock_client()?;
        let row = client
            .query_one(
                "INSERT INTO runs (job_id, source_id, status) \
                 VALUES ($1, $2, $3) RETURNING id",
                &[&job.as_str(), &source.as_str(), &RunStatus::Running.as_str()],
            )
            .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(row.get(0))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "UPDATE runs SET status = $1, finished_at = now()::text, \
                 records_extracted = $2, records_delivered = $3, records_rejected = $4, \
                 subunits_skipped = $5, error_kind = $6, error_message = $7 \
                 WHERE id = $8",
                &[
                    &status.as_str(),
                    &(stats.records_extracted as i64),
                    &(stats.records_delivered as i64),
                    &(stats.records_rejected as i64),
                    &(stats.subunits_skipped as i64),
                    &stats.error_kind,
                    &stats.error_message,
                    &run_id,
                ],
            )
            .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    #[allow(clippy::cast_sign_loss)]
    fn get_run(&self, run_id: i64) -> error::Result<Option<RunRecord>> {
        let mut client = self.lock_client()?;
        let row = client
            .query_opt(
                "SELECT job_id, source_id, status, records_extracted, records_delivered, \
                 records_rejected, subunits_skipped, error_kind, error_message \
                 FROM runs WHERE id = $1",
                &[&run_id],
            )
            .map_err(|e| StateError::backend_context("get_run", e))?;
        Ok(row.map(|row| {
            let status: String = row.get(2);
            RunRecord {
                run_id,
                job_id: JobId::new(row.get::<_, String>(0)),
                source_id: SourceId::new(row.get::<_, String>(1)),
                status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                stats: RunStats {
                    records_extracted: row.get::<_, i64>(3) as u64,
                    records_delivered: row.get::<_, i64>(4) as u64,
                    records_rejected: row.get::<_, i64>(5) as u64,
                    subunits_skipped: row.get::<_, i64>(6) as u64,
                    error_kind: row.get(7),
                    error_message: row.get(8),
                },
            }
        }))
    }

    fn insert_dlq_records(
        &self,
        job: &JobId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::backend_context("insert_dlq_records: begin tx", e))?;
        let stmt = tx
            .prepare(
                "INSERT INTO dlq_records \
                 (job_id, run_id, kind, subject, payload_json, error_kind, error_message, failed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .map_err(|e| StateError::backend_context("insert_dlq_records: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            let failed_at = format_timestamp(&record.failed_at);
            tx.execute(
                &stmt,
                &[
                    &job.as_str(),
                    &run_id,
                    &record.kind.as_str(),
                    &record.subject.as_str(),
                    &record.payload_json.as_str(),
                    &record.error_kind.as_str(),
                    &record.error_message.as_str(),
                    &failed_at.as_str(),
                ],
            )
            .map_err(|e| StateError::backend_context("insert_dlq_records: execute", e))?;
            count += 1;
        }
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_dlq_records: commit", e))?;

        Ok(count)
    }

    fn list_dlq_records(&self, job: &JobId, run_id: i64) -> error::Result<Vec<DlqRecord>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT kind, subject, payload_json, error_kind, error_message, failed_at \
                 FROM dlq_records WHERE job_id = $1 AND run_id = $2 ORDER BY id",
                &[&job.as_str(), &run_id],
            )
            .map_err(|e| StateError::backend_context("list_dlq_records", e))?;
        Ok(rows
            .iter()
            .map(|row| {
                let kind: String = row.get(0);
                let failed_at: String = row.get(5);
                DlqRecord {
                    kind: if kind == DlqKind::SkippedSubUnit.as_str() {
                        DlqKind::SkippedSubUnit
                    } else {
                        DlqKind::RejectedRecord
                    },
                    subject: row.get(1),
                    payload_json: row.get(2),
                    error_kind: row.get(3),
                    error_message: row.get(4),
                    failed_at: Self::parse_time(&failed_at),
                }
            })
            .collect())
    }
}
