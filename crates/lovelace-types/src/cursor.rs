//! Cursor types for incremental extraction position tracking.
//!
//! A cursor marks the last-delivered position in an upstream source so the
//! next run can ask the source adapter for strictly newer records. Cursors
//! of the same kind are totally ordered; comparing two different kinds is
//! an error rather than an arbitrary answer.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Kind discriminator of a [`Cursor`], persisted next to its encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    /// Numeric offset (page offset, sequence number, snowflake).
    Offset,
    /// UTC timestamp.
    Timestamp,
    /// Opaque continuation token, ordered lexicographically.
    Token,
}

impl CursorKind {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offset => "offset",
            Self::Timestamp => "timestamp",
            Self::Token => "token",
        }
    }

    /// Parse the storage representation produced by [`CursorKind::as_str`].
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::UnknownKind`] for any other string.
    pub fn parse(raw: &str) -> Result<Self, CursorError> {
        match raw {
            "offset" => Ok(Self::Offset),
            "timestamp" => Ok(Self::Timestamp),
            "token" => Ok(Self::Token),
            other => Err(CursorError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for CursorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding or comparing cursors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("cannot compare {left} cursor with {right} cursor")]
    KindMismatch { left: CursorKind, right: CursorKind },

    #[error("invalid {kind} cursor value '{value}': {reason}")]
    Invalid {
        kind: CursorKind,
        value: String,
        reason: String,
    },

    #[error("unknown cursor kind '{0}'")]
    UnknownKind(String),
}

/// Typed extraction position.
///
/// Serializes as `{"type": "offset", "value": 42}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    Offset(i64),
    Timestamp(DateTime<Utc>),
    Token(String),
}

impl Cursor {
    #[must_use]
    pub fn kind(&self) -> CursorKind {
        match self {
            Self::Offset(_) => CursorKind::Offset,
            Self::Timestamp(_) => CursorKind::Timestamp,
            Self::Token(_) => CursorKind::Token,
        }
    }

    /// Encode the value for storage. Timestamps use RFC 3339 with as many
    /// fractional digits as the value needs, down to nanoseconds, so the
    /// encoding round-trips exactly.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Offset(v) => v.to_string(),
            Self::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            Self::Token(t) => t.clone(),
        }
    }

    /// Decode a stored `(kind, value)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::Invalid`] if `value` does not parse as `kind`.
    pub fn decode(kind: CursorKind, value: &str) -> Result<Self, CursorError> {
        let invalid = |reason: String| CursorError::Invalid {
            kind,
            value: value.to_string(),
            reason,
        };
        match kind {
            CursorKind::Offset => value
                .parse::<i64>()
                .map(Self::Offset)
                .map_err(|e| invalid(e.to_string())),
            CursorKind::Timestamp => DateTime::parse_from_rfc3339(value)
                .map(|dt| Self::Timestamp(dt.with_timezone(&Utc)))
                .map_err(|e| invalid(e.to_string())),
            CursorKind::Token => Ok(Self::Token(value.to_string())),
        }
    }

    /// Total order between two cursors of the same kind.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::KindMismatch`] when kinds differ.
    pub fn compare(&self, other: &Self) -> Result<Ordering, CursorError> {
        match (self, other) {
            (Self::Offset(a), Self::Offset(b)) => Ok(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Ok(a.cmp(b)),
            (Self::Token(a), Self::Token(b)) => Ok(a.cmp(b)),
            _ => Err(CursorError::KindMismatch {
                left: self.kind(),
                right: other.kind(),
            }),
        }
    }

    /// `true` when `self` is strictly past `bound` (or there is no bound).
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::KindMismatch`] when kinds differ.
    pub fn is_after(&self, bound: Option<&Self>) -> Result<bool, CursorError> {
        match bound {
            None => Ok(true),
            Some(b) => Ok(self.compare(b)? == Ordering::Greater),
        }
    }

    /// Timestamp cursor from epoch milliseconds.
    #[must_use]
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self::Timestamp)
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other).ok()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.encode())
    }
}
