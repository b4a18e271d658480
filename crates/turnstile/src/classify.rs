//! Maps terminal gate errors to a wire-level response contract.
//!
//! Every denial carries an HTTP status, a machine-readable code, a human
//! message with the retry-after interpolated, and the standard
//! `X-RateLimit-*` / `Retry-After` headers. Bodies are rendered as JSON or
//! plain text depending on what the client negotiates.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::error::GateError;

/// A fully classified denial, ready for the surrounding request pipeline
/// to serialize onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenialResponse {
    /// HTTP status code (429, 503, or 403).
    pub status: u16,
    /// Machine-readable error category.
    pub error: &'static str,
    /// Stable upper-snake code for programmatic clients.
    pub code: &'static str,
    /// Human-readable message with the retry-after interpolated.
    pub message: String,
    /// Seconds the client should wait before retrying.
    pub retry_after_secs: u64,
    /// When the denial was issued.
    pub timestamp: DateTime<Utc>,
    /// Response headers, including `Retry-After` and `X-RateLimit-*`.
    pub headers: Vec<(String, String)>,
}

impl DenialResponse {
    /// Renders the JSON body.
    #[must_use]
    pub fn to_json(&self) -> String {
        json!({
            "error": self.error,
            "message": self.message,
            "code": self.code,
            "retry_after": self.retry_after_secs,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        })
        .to_string()
    }

    /// Renders the equivalent `text/plain` body.
    #[must_use]
    pub fn to_plain_text(&self) -> String {
        format!("{} ({}). Retry after {} seconds.", self.message, self.code, self.retry_after_secs)
    }

    /// Looks up a header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Stateless translation from [`GateError`] to [`DenialResponse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseClassifier;

impl ResponseClassifier {
    /// Creates a classifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classifies a terminal denial.
    ///
    /// [`GateError::Store`] never reaches this point in practice (the gate
    /// fails open); if it does, it is treated as an overload response so the
    /// client backs off.
    #[must_use]
    pub fn classify(&self, error: &GateError) -> DenialResponse {
        let now = Utc::now();

        match error {
            GateError::LimitExceeded { limit, retry_after_secs, .. } => Self::build(
                429,
                "rate_limit_exceeded",
                "RATE_LIMIT_EXCEEDED",
                format!("Too many requests. Try again in {retry_after_secs} seconds."),
                *retry_after_secs,
                Some(*limit),
                now,
            ),
            GateError::SystemOverload { limit, retry_after_secs, .. } => Self::build(
                503,
                "system_overload",
                "SYSTEM_OVERLOAD",
                format!(
                    "The service is under heavy load. Try again in {retry_after_secs} seconds."
                ),
                *retry_after_secs,
                Some(*limit),
                now,
            ),
            GateError::SuspiciousActivity { .. } => Self::build(
                429,
                "suspicious_activity",
                "SUSPICIOUS_ACTIVITY",
                "The request was flagged and not processed.".to_string(),
                60,
                None,
                now,
            ),
            GateError::Blocked { retry_after_secs, .. } => Self::build(
                403,
                "blocked",
                "SUBJECT_BLOCKED",
                format!(
                    "Access temporarily blocked. Try again in {retry_after_secs} seconds."
                ),
                *retry_after_secs,
                None,
                now,
            ),
            GateError::BandwidthExceeded { quota, retry_after_secs, .. } => Self::build(
                429,
                "bandwidth_exceeded",
                "BANDWIDTH_EXCEEDED",
                format!(
                    "Hourly download quota exhausted. Try again in {retry_after_secs} seconds."
                ),
                *retry_after_secs,
                Some(*quota),
                now,
            ),
            GateError::Store(_) => Self::build(
                503,
                "system_overload",
                "SYSTEM_OVERLOAD",
                "The service is temporarily unavailable. Try again in 30 seconds.".to_string(),
                30,
                None,
                now,
            ),
        }
    }

    fn build(
        status: u16,
        error: &'static str,
        code: &'static str,
        message: String,
        retry_after_secs: u64,
        limit: Option<u64>,
        now: DateTime<Utc>,
    ) -> DenialResponse {
        // Every denial leaves the client with zero remaining budget and a
        // reset horizon; the limit itself is only known for counter scopes.
        let reset_epoch = now.timestamp().unsigned_abs().saturating_add(retry_after_secs);
        let mut headers = vec![("Retry-After".to_string(), retry_after_secs.to_string())];
        if let Some(limit) = limit {
            headers.push(("X-RateLimit-Limit".to_string(), limit.to_string()));
        }
        headers.push(("X-RateLimit-Remaining".to_string(), "0".to_string()));
        headers.push(("X-RateLimit-Reset".to_string(), reset_epoch.to_string()));

        DenialResponse {
            status,
            error,
            code,
            message,
            retry_after_secs,
            timestamp: now,
            headers,
        }
    }
}
