//! `SQLite`-backed implementation of [`CheckpointStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Commits and lease
//! changes run inside `IMMEDIATE` transactions so the read-compare-write
//! sequence cannot interleave with another process on the same file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lovelace_types::checkpoint::{Checkpoint, CommitOutcome};
use lovelace_types::cursor::{Cursor, CursorKind};
use lovelace_types::dlq::{DlqKind, DlqRecord};
use lovelace_types::record::format_timestamp;
use lovelace_types::state::{JobId, RunRecord, RunStats, RunStatus, SourceId};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::backend::{commit_outcome, expiry_millis, CheckpointStore};
use crate::error::{self, StateError};

/// Idempotent DDL for state tables.
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
    expires_at_ms INTEGER NOT NULL,
    PRIMARY KEY (job_id, source_id)
);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_extracted INTEGER DEFAULT 0,
    records_delivered INTEGER DEFAULT 0,
    records_rejected INTEGER DEFAULT 0,
    subunits_skipped INTEGER DEFAULT 0,
    error_kind TEXT,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS dlq_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    error_message TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_dlq_job_run ON dlq_records (job_id, run_id);
";

/// `SQLite`-backed checkpoint storage.
///
/// Create with [`SqliteCheckpointStore::open`] for file-backed persistence
/// or [`SqliteCheckpointStore::in_memory`] for tests.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("open: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn parse_time(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).map_or(DateTime::UNIX_EPOCH, |dt| dt.with_timezone(&Utc))
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, job: &JobId, source: &SourceId) -> error::Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT cursor_kind, cursor_value, committed_at \
                 FROM checkpoints WHERE job_id = ?1 AND source_id = ?2",
                rusqlite::params![job.as_str(), source.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StateError::backend_context("load", e))?;

        let Some((kind, value, committed_at)) = row else {
            return Ok(None);
        };
        let cursor = Cursor::decode(CursorKind::parse(&kind)?, &value)?;
        Ok(Some(Checkpoint {
            job_id: job.clone(),
            source_id: source.clone(),
            cursor,
            committed_at: Self::parse_time(&committed_at),
        }))
    }

    fn commit(
        &self,
        job: &JobId,
        source: &SourceId,
        cursor: &Cursor,
        holder: &str,
    ) -> error::Result<CommitOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StateError::backend_context("commit: begin tx", e))?;

        let lease_holder: Option<String> = tx
            .query_row(
                "SELECT holder FROM run_leases WHERE job_id = ?1 AND source_id = ?2",
                rusqlite::params![job.as_str(), source.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("commit: read lease", e))?;
        if lease_holder.as_deref() != Some(holder) {
            return Err(StateError::LeaseNotHeld {
                job: job.to_string(),
                source_id: source.to_string(),
                holder: holder.to_string(),
            });
        }

        let stored: Option<(String, String)> = tx
            .query_row(
                "SELECT cursor_kind, cursor_value FROM checkpoints \
                 WHERE job_id = ?1 AND source_id = ?2",
                rusqlite::params![job.as_str(), source.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StateError::backend_context("commit: read checkpoint", e))?;
        let stored = stored
            .map(|(kind, value)| Cursor::decode(CursorKind::parse(&kind)?, &value))
            .transpose()?;

        let outcome = commit_outcome(stored.as_ref(), cursor)?;
        if outcome == CommitOutcome::Advanced {
            tx.execute(
                "INSERT INTO checkpoints (job_id, source_id, cursor_kind, cursor_value, committed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(job_id, source_id) \
                 DO UPDATE SET cursor_kind = ?3, cursor_value = ?4, committed_at = ?5",
                rusqlite::params![
                    job.as_str(),
                    source.as_str(),
                    cursor.kind().as_str(),
                    cursor.encode(),
                    format_timestamp(&Utc::now()),
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
        let mut conn = self.lock_conn()?;
        let now = Utc::now().timestamp_millis();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StateError::backend_context("acquire_lease: begin tx", e))?;
        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT holder, expires_at_ms FROM run_leases WHERE job_id = ?1 AND source_id = ?2",
                rusqlite::params![job.as_str(), source.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StateError::backend_context("acquire_lease: read", e))?;

        let free = match &current {
            None => true,
            Some((owner, expires_at)) => owner == holder || *expires_at <= now,
        };
        if free {
            tx.execute(
                "INSERT INTO run_leases (job_id, source_id, holder, expires_at_ms) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(job_id, source_id) DO UPDATE SET holder = ?3, expires_at_ms = ?4",
                rusqlite::params![job.as_str(), source.as_str(), holder, expiry_millis(now, ttl)],
            )
            .map_err(|e| StateError::backend_context("acquire_lease: write", e))?;
        }
        tx.commit()
            .map_err(|e| StateError::backend_context("acquire_lease: commit tx", e))?;
        Ok(free)
    }

    fn renew_lease(
        &self,
        job: &JobId,
        source: &SourceId,
        holder: &str,
        ttl: Duration,
    ) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let expires = expiry_millis(Utc::now().timestamp_millis(), ttl);
        let rows = conn
            .execute(
                "UPDATE run_leases SET expires_at_ms = ?1 \
                 WHERE job_id = ?2 AND source_id = ?3 AND holder = ?4",
                rusqlite::params![expires, job.as_str(), source.as_str(), holder],
            )
            .map_err(|e| StateError::backend_context("renew_lease", e))?;
        Ok(rows > 0)
    }

    fn release_lease(&self, job: &JobId, source: &SourceId, holder: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM run_leases WHERE job_id = ?1 AND source_id = ?2 AND holder = ?3",
            rusqlite::params![job.as_str(), source.as_str(), holder],
        )
        .map_err(|e| StateError::backend_context("release_lease", e))?;
        Ok(())
    }

    fn start_run(&self, job: &JobId, source: &SourceId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO runs (job_id, source_id, status) VALUES (?1, ?2, ?3)",
            rusqlite::params![job.as_str(), source.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE runs SET status = ?1, finished_at = datetime('now'), \
             records_extracted = ?2, records_delivered = ?3, records_rejected = ?4, \
             subunits_skipped = ?5, error_kind = ?6, error_message = ?7 \
             WHERE id = ?8",
            rusqlite::params![
                status.as_str(),
                stats.records_extracted as i64,
                stats.records_delivered as i64,
                stats.records_rejected as i64,
                stats.subunits_skipped as i64,
                stats.error_kind,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    #[allow(clippy::cast_sign_loss)]
    fn get_run(&self, run_id: i64) -> error::Result<Option<RunRecord>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT job_id, source_id, status, records_extracted, records_delivered, \
             records_rejected, subunits_skipped, error_kind, error_message \
             FROM runs WHERE id = ?1",
            [run_id],
            |row| {
                let status: String = row.get(2)?;
                Ok(RunRecord {
                    run_id,
                    job_id: JobId::new(row.get::<_, String>(0)?),
                    source_id: SourceId::new(row.get::<_, String>(1)?),
                    status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                    stats: RunStats {
                        records_extracted: row.get::<_, i64>(3)? as u64,
                        records_delivered: row.get::<_, i64>(4)? as u64,
                        records_rejected: row.get::<_, i64>(5)? as u64,
                        subunits_skipped: row.get::<_, i64>(6)? as u64,
                        error_kind: row.get(7)?,
                        error_message: row.get(8)?,
                    },
                })
            },
        )
        .optional()
        .map_err(|e| StateError::backend_context("get_run", e))
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

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_dlq_records: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO dlq_records \
                 (job_id, run_id, kind, subject, payload_json, error_kind, error_message, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(|e| StateError::backend_context("insert_dlq_records: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                job.as_str(),
                run_id,
                record.kind.as_str(),
                record.subject,
                record.payload_json,
                record.error_kind,
                record.error_message,
                format_timestamp(&record.failed_at),
            ])
            .map_err(|e| StateError::backend_context("insert_dlq_records: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_dlq_records: commit", e))?;

        Ok(count)
    }

    fn list_dlq_records(&self, job: &JobId, run_id: i64) -> error::Result<Vec<DlqRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT kind, subject, payload_json, error_kind, error_message, failed_at \
                 FROM dlq_records WHERE job_id = ?1 AND run_id = ?2 ORDER BY id",
            )
            .map_err(|e| StateError::backend_context("list_dlq_records: prepare", e))?;
        let rows = stmt
            .query_map(rusqlite::params![job.as_str(), run_id], |row| {
                let kind: String = row.get(0)?;
                let failed_at: String = row.get(5)?;
                Ok(DlqRecord {
                    kind: if kind == DlqKind::SkippedSubUnit.as_str() {
                        DlqKind::SkippedSubUnit
                    } else {
                        DlqKind::RejectedRecord
                    },
                    subject: row.get(1)?,
                    payload_json: row.get(2)?,
                    error_kind: row.get(3)?,
                    error_message: row.get(4)?,
                    failed_at: Self::parse_time(&failed_at),
                })
            })
            .map_err(|e| StateError::backend_context("list_dlq_records: query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("list_dlq_records: row", e))
    }
}
