//! Dead-letter queue types.
//!
//! [`DlqRecord`] captures a record the normalizer rejected, or a sub-unit
//! the source adapter had to skip, for later inspection and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What ended up in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqKind {
    /// Raw payload failed normalization.
    RejectedRecord,
    /// A whole sub-unit (channel, partition, target) was skipped.
    SkippedSubUnit,
}

impl DlqKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RejectedRecord => "rejected_record",
            Self::SkippedSubUnit => "skipped_sub_unit",
        }
    }
}

/// One dead-letter entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub kind: DlqKind,
    /// Record id when known, otherwise the sub-unit label.
    pub subject: String,
    /// JSON-serialized raw payload; empty for skipped sub-units.
    pub payload_json: String,
    /// Stable classification (`schema`, `rate_limit`, ...).
    pub error_kind: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}
