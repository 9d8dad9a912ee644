//! Structured error model for upstream and downstream calls.
//!
//! [`ConnectorError`] carries classification and retry metadata so the
//! engine can tell a throttled request from a revoked token. Construct via
//! the category-specific factory methods. [`SchemaError`] is raised by the
//! record normalizer and always names the offending field.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a connector error.
///
/// Determines default retry behavior and operator-facing categorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid job or collaborator configuration.
    Config,
    /// Authentication failure.
    Auth,
    /// Insufficient permissions.
    Permission,
    /// Rate limit exceeded (retryable).
    RateLimit,
    /// Call exceeded its deadline (retryable).
    Timeout,
    /// Transient network error (retryable).
    TransientNetwork,
    /// Transient database error (retryable).
    TransientDb,
    /// Requested resource does not exist.
    NotFound,
    /// Invalid or corrupt data.
    Data,
    /// Internal error.
    Internal,
}

impl ErrorCategory {
    /// `true` for categories that make every sub-unit fail the same way.
    #[must_use]
    pub fn is_run_scoped(self) -> bool {
        matches!(self, Self::Auth | Self::Config)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::TransientNetwork => "transient_network",
            Self::TransientDb => "transient_db",
            Self::NotFound => "not_found",
            Self::Data => "data",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffClass {
    /// Millisecond-scale retry.
    Fast,
    /// Second-scale retry.
    Normal,
    /// Minute-scale retry.
    Slow,
}

/// Structured error from an upstream or downstream call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct ConnectorError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub backoff_class: BackoffClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ConnectorError {
    fn new(
        category: ErrorCategory,
        retryable: bool,
        backoff_class: BackoffClass,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            backoff_class,
            details: None,
        }
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, false, BackoffClass::Normal, code, message)
    }

    /// Authentication error (not retryable).
    #[must_use]
    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, false, BackoffClass::Normal, code, message)
    }

    /// Permission error (not retryable).
    #[must_use]
    pub fn permission(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permission, false, BackoffClass::Normal, code, message)
    }

    /// Rate limit error (retryable, slow backoff).
    #[must_use]
    pub fn rate_limit(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, true, BackoffClass::Slow, code, message);
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// Deadline exceeded (retryable, normal backoff).
    #[must_use]
    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, true, BackoffClass::Normal, code, message)
    }

    /// Transient network error (retryable, normal backoff).
    #[must_use]
    pub fn transient_network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientNetwork, true, BackoffClass::Normal, code, message)
    }

    /// Transient database error (retryable, normal backoff).
    #[must_use]
    pub fn transient_db(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientDb, true, BackoffClass::Normal, code, message)
    }

    /// Missing resource (not retryable).
    #[must_use]
    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, false, BackoffClass::Normal, code, message)
    }

    /// Data validation error (not retryable).
    #[must_use]
    pub fn data(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Data, false, BackoffClass::Normal, code, message)
    }

    /// Internal error (not retryable).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, false, BackoffClass::Normal, code, message)
    }

    /// Attach structured diagnostic details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the default backoff class.
    #[must_use]
    pub fn with_backoff(mut self, class: BackoffClass) -> Self {
        self.backoff_class = class;
        self
    }
}

/// A raw payload could not be turned into a [`crate::record::Record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("schema error on field '{field}': {reason}")]
pub struct SchemaError {
    pub field: String,
    pub reason: String,
}

impl SchemaError {
    #[must_use]
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "required field is missing or null")
    }
}
