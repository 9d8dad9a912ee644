//! Committed extraction progress.
//!
//! A [`Checkpoint`] is written only after every record up to its cursor has
//! been delivered downstream, and only ever moves forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::state::{JobId, SourceId};

/// Durable `(job, source) -> cursor` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub cursor: Cursor,
    pub committed_at: DateTime<Utc>,
}

/// What a `commit` call did to the stored cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    /// Stored cursor moved forward (or was created).
    Advanced,
    /// Same cursor as stored; nothing written.
    Unchanged,
    /// Older than the stored cursor; ignored.
    Regressed,
}

impl CommitOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advanced => "advanced",
            Self::Unchanged => "unchanged",
            Self::Regressed => "regressed",
        }
    }
}

impl std::fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
