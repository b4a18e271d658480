//! Error taxonomy for the admission gate.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::{Scope, StoreError};

/// Terminal decisions and internal failures of the gate.
///
/// Every user-visible variant is terminal for the request it denies; the
/// gate never retries internally. [`GateError::Store`] is internal only:
/// callers recover locally by failing open and it is never surfaced as a
/// denial.
#[derive(Debug, Error)]
pub enum GateError {
    /// A rate limit scope denied the request (HTTP 429).
    #[error("rate limit exceeded for {subject} in {scope} scope: {count}/{limit}, retry in {retry_after_secs}s")]
    LimitExceeded {
        /// Subject that hit the limit.
        subject: String,
        /// Scope that denied the request.
        scope: Scope,
        /// Endpoint or category the counter tracks.
        window_id: String,
        /// Effective limit for the window.
        limit: u64,
        /// Observed count.
        count: u64,
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// The endpoint-wide counter tripped (HTTP 503).
    #[error("system overload on {endpoint}: {count}/{limit}, retry in {retry_after_secs}s")]
    SystemOverload {
        /// Overloaded endpoint.
        endpoint: String,
        /// System-wide limit.
        limit: u64,
        /// Observed count.
        count: u64,
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// The abuse detector flagged the request (HTTP 429, escalates).
    #[error("suspicious activity from {subject}: {signature} in {location}")]
    SuspiciousActivity {
        /// Subject that sent the request.
        subject: String,
        /// Signature family or heuristic that matched.
        signature: String,
        /// Where the match was found.
        location: String,
        /// Truncated excerpt of the matched value.
        fragment: String,
    },

    /// The subject is blocked (HTTP 403).
    #[error("{subject} is blocked until {expires_at}: {reason}")]
    Blocked {
        /// Blocked subject.
        subject: String,
        /// Reason recorded when the block was created.
        reason: String,
        /// When the block expires.
        expires_at: DateTime<Utc>,
        /// Seconds until the block expires.
        retry_after_secs: u64,
    },

    /// Hourly bandwidth quota exhausted (HTTP 429).
    #[error("bandwidth quota exceeded for {subject}: {used}/{quota} bytes this hour")]
    BandwidthExceeded {
        /// Subject over quota.
        subject: String,
        /// Bytes used in the current hour.
        used: u64,
        /// Effective quota.
        quota: u64,
        /// Seconds until the ledger window resets.
        retry_after_secs: u64,
    },

    /// Counter store failure. Recovered via fail-open, never user-visible.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GateError {
    /// Whether this error is a terminal, user-visible denial.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        !matches!(self, Self::Store(_))
    }

    /// Whether this violation feeds the escalation manager's rolling count
    /// (suspicious activity and critical-scope limit hits do; ordinary limit
    /// hits do not).
    #[must_use]
    pub const fn escalates(&self) -> bool {
        match self {
            Self::SuspiciousActivity { .. } => true,
            Self::LimitExceeded { scope, .. } => matches!(scope, Scope::Critical),
            _ => false,
        }
    }
}

/// Result type for gate operations.
pub type GateResult<T> = Result<T, GateError>;
