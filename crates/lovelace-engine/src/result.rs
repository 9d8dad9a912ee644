//! Run and check result types.

use std::fmt;

use lovelace_types::cursor::Cursor;
use serde::Serialize;

use crate::errors::ErrorKind;
use crate::source::SkippedSubUnit;

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Extracting,
    Draining,
    Committed,
    Failed,
}

impl RunState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Extracting => "EXTRACTING",
            Self::Draining => "DRAINING",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate record counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    /// Raw records pulled from the source.
    pub extracted: u64,
    /// Records acknowledged by the destination.
    pub delivered: u64,
    /// Records the normalizer rejected.
    pub rejected: u64,
    /// Records at or before the resume cursor, dropped.
    pub duplicates: u64,
    /// Batches acknowledged by the destination.
    pub batches: u64,
}

/// What a run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job_id: String,
    pub source_id: String,
    /// Run-history id; `0` if the run never got that far.
    pub run_id: i64,
    pub state: RunState,
    pub resumed_from: Option<Cursor>,
    pub committed_cursor: Option<Cursor>,
    pub counts: RunCounts,
    pub skipped: Vec<SkippedSubUnit>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub duration_secs: f64,
}

impl RunReport {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.state == RunState::Committed
    }
}

/// Result of `check`: every component that could be built or reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    pub config_ok: bool,
    pub state_ok: bool,
    pub source_ok: bool,
    pub destination_ok: bool,
    pub problems: Vec<String>,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.config_ok && self.state_ok && self.source_ok && self.destination_ok
    }
}
