//! HTTP status and transport error classification shared by the bundled
//! REST collaborators.

use std::time::Duration;

use lovelace_types::error::ConnectorError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;

/// Longest body excerpt carried in an error message.
const BODY_EXCERPT_CHARS: usize = 256;

/// Build the shared client used by every bundled collaborator.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialized.
pub fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("lovelace/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))
}

/// Map a non-success status onto a classified [`ConnectorError`].
#[must_use]
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ConnectorError {
    let code = format!("HTTP_{}", status.as_u16());
    let message = format!("{status}: {}", excerpt(body));
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            ConnectorError::rate_limit(code, message, retry_after_ms(headers, body))
        }
        StatusCode::UNAUTHORIZED => ConnectorError::auth(code, message),
        StatusCode::FORBIDDEN => ConnectorError::permission(code, message),
        StatusCode::NOT_FOUND => ConnectorError::not_found(code, message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ConnectorError::timeout(code, message)
        }
        s if s.is_server_error() => ConnectorError::transient_network(code, message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ConnectorError::data(code, message)
        }
        _ => ConnectorError::internal(code, message),
    }
}

/// Map a transport-level failure.
#[must_use]
pub fn classify_transport(err: &reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::timeout("HTTP_TIMEOUT", err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ConnectorError::transient_network("HTTP_TRANSPORT", err.to_string())
    } else if err.is_decode() {
        ConnectorError::data("HTTP_DECODE", err.to_string())
    } else if err.is_builder() {
        ConnectorError::config("HTTP_REQUEST_INVALID", err.to_string())
    } else {
        ConnectorError::transient_network("HTTP_ERROR", err.to_string())
    }
}

/// Send a request and return its JSON body, classifying every failure.
///
/// # Errors
///
/// Returns a classified error for transport failures, non-2xx statuses and
/// bodies that are not valid JSON.
pub async fn send_json(request: reqwest::RequestBuilder) -> Result<Value, ConnectorError> {
    let text = send_text(request).await?;
    serde_json::from_str(&text).map_err(|e| {
        ConnectorError::data(
            "INVALID_JSON",
            format!("response is not valid JSON ({e}): {}", excerpt(&text)),
        )
    })
}

/// Send a request and return its body as text, classifying every failure.
///
/// # Errors
///
/// Returns a classified error for transport failures and non-2xx statuses.
pub async fn send_text(request: reqwest::RequestBuilder) -> Result<String, ConnectorError> {
    let response = request.send().await.map_err(|e| classify_transport(&e))?;
    let status = response.status();
    let headers = response.headers().clone();
    let text = response.text().await.map_err(|e| classify_transport(&e))?;
    if status.is_success() {
        Ok(text)
    } else {
        Err(classify_status(status, &headers, &text))
    }
}

/// `Retry-After` header in seconds, or a Discord-style `retry_after` body
/// field in (fractional) seconds.
fn retry_after_ms(headers: &HeaderMap, body: &str) -> Option<u64> {
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok());
    let from_body = || {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("retry_after").and_then(Value::as_f64))
    };
    let secs = from_header.or_else(from_body)?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some((secs * 1000.0).ceil() as u64)
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
        format!("{cut}...")
    }
}
