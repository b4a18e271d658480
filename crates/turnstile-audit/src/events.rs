//! Audit event types emitted by the admission gate.
//!
//! Every event carries the subject, source IP (when known), the endpoint or
//! action category involved, and a timestamp, matching what incident review
//! needs to reconstruct a denial.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Severity level for audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational event (e.g., allowed request bookkeeping).
    Info = 0,
    /// Low severity (e.g., single rate limit hit).
    Low = 1,
    /// Medium severity (e.g., bandwidth quota exhausted).
    Medium = 2,
    /// High severity (e.g., suspicious input, subject blocked).
    High = 3,
    /// Critical severity (e.g., counter store outage, enforcement degraded).
    Critical = 4,
}

impl Severity {
    /// Returns the string representation of this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rate limit violation details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    /// The limit that was exceeded (e.g., "endpoint:/api/assets").
    pub limit_name: String,
    /// Observed count in the window.
    pub current_count: u64,
    /// Maximum allowed in the window.
    pub max_allowed: u64,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Subject being limited (`user:<id>` or `ip:<addr>`).
    pub subject: String,
}

/// Suspicious input detection details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousInput {
    /// Signature family that matched (e.g., "sql_injection").
    pub signature: String,
    /// Where the match was found (path, header name, or input key).
    pub location: String,
    /// The matched fragment, truncated for the log.
    pub fragment: String,
    /// Subject that sent the request.
    pub subject: String,
}

/// Block creation details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockApplied {
    /// Subject that was blocked.
    pub subject: String,
    /// Human-readable reason.
    pub reason: String,
    /// Violations accumulated in the rolling window.
    pub violation_count: u64,
    /// When the block expires.
    pub expires_at: DateTime<Utc>,
}

/// Bandwidth quota overrun details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthOverrun {
    /// Subject over quota.
    pub subject: String,
    /// Bytes used in the current hour.
    pub bytes_used: u64,
    /// Effective hourly quota.
    pub quota: u64,
}

/// Security audit event emitted by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A rate limit scope denied a request.
    RateLimit {
        /// Unique event identifier.
        event_id: Uuid,
        /// When the event occurred.
        timestamp: DateTime<Utc>,
        /// Severity level.
        severity: Severity,
        /// Source IP, when known.
        ip: Option<String>,
        /// Endpoint or action category involved.
        endpoint: String,
        /// Violation details.
        violation: RateLimitViolation,
    },

    /// The abuse detector flagged a request.
    SuspiciousActivity {
        /// Unique event identifier.
        event_id: Uuid,
        /// When the event occurred.
        timestamp: DateTime<Utc>,
        /// Severity level.
        severity: Severity,
        /// Source IP, when known.
        ip: Option<String>,
        /// Endpoint or action category involved.
        endpoint: String,
        /// Match details.
        details: SuspiciousInput,
    },

    /// The escalation manager blocked a subject.
    SubjectBlocked {
        /// Unique event identifier.
        event_id: Uuid,
        /// When the event occurred.
        timestamp: DateTime<Utc>,
        /// Severity level.
        severity: Severity,
        /// Source IP, when known.
        ip: Option<String>,
        /// Block details.
        block: BlockApplied,
    },

    /// A download subject exhausted its hourly bandwidth quota.
    BandwidthExceeded {
        /// Unique event identifier.
        event_id: Uuid,
        /// When the event occurred.
        timestamp: DateTime<Utc>,
        /// Severity level.
        severity: Severity,
        /// Source IP, when known.
        ip: Option<String>,
        /// Endpoint or action category involved.
        endpoint: String,
        /// Overrun details.
        overrun: BandwidthOverrun,
    },

    /// The counter store was unavailable and enforcement failed open.
    StoreOutage {
        /// Unique event identifier.
        event_id: Uuid,
        /// When the event occurred.
        timestamp: DateTime<Utc>,
        /// Severity level.
        severity: Severity,
        /// The operation that failed (e.g., "peek", "try_increment").
        operation: String,
        /// Scope that was skipped.
        scope: String,
    },
}

impl AuditEvent {
    /// Creates a rate limit violation event.
    #[must_use]
    pub fn rate_limit_exceeded(
        limit_name: impl Into<String>,
        current: u64,
        max: u64,
        window_secs: u64,
        subject: impl Into<String>,
    ) -> Self {
        let limit_name = limit_name.into();
        Self::RateLimit {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: Severity::Low,
            ip: None,
            endpoint: limit_name.clone(),
            violation: RateLimitViolation {
                limit_name,
                current_count: current,
                max_allowed: max,
                window_seconds: window_secs,
                subject: subject.into(),
            },
        }
    }

    /// Creates a suspicious activity event.
    #[must_use]
    pub fn suspicious_activity(
        signature: impl Into<String>,
        location: impl Into<String>,
        fragment: impl Into<String>,
        subject: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::SuspiciousActivity {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: Severity::High,
            ip: None,
            endpoint: endpoint.into(),
            details: SuspiciousInput {
                signature: signature.into(),
                location: location.into(),
                fragment: fragment.into(),
                subject: subject.into(),
            },
        }
    }

    /// Creates a subject blocked event.
    #[must_use]
    pub fn subject_blocked(
        subject: impl Into<String>,
        reason: impl Into<String>,
        violation_count: u64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self::SubjectBlocked {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: Severity::High,
            ip: None,
            block: BlockApplied {
                subject: subject.into(),
                reason: reason.into(),
                violation_count,
                expires_at,
            },
        }
    }

    /// Creates a bandwidth overrun event.
    #[must_use]
    pub fn bandwidth_exceeded(
        subject: impl Into<String>,
        bytes_used: u64,
        quota: u64,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::BandwidthExceeded {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: Severity::Medium,
            ip: None,
            endpoint: endpoint.into(),
            overrun: BandwidthOverrun {
                subject: subject.into(),
                bytes_used,
                quota,
            },
        }
    }

    /// Creates a store outage event.
    #[must_use]
    pub fn store_outage(operation: impl Into<String>, scope: impl Into<String>) -> Self {
        Self::StoreOutage {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: Severity::Critical,
            operation: operation.into(),
            scope: scope.into(),
        }
    }

    /// Attaches a source IP to the event.
    #[must_use]
    pub fn with_ip(mut self, addr: impl Into<String>) -> Self {
        match &mut self {
            Self::RateLimit { ip, .. }
            | Self::SuspiciousActivity { ip, .. }
            | Self::SubjectBlocked { ip, .. }
            | Self::BandwidthExceeded { ip, .. } => *ip = Some(addr.into()),
            Self::StoreOutage { .. } => {}
        }
        self
    }

    /// Returns the unique event identifier.
    #[must_use]
    pub const fn event_id(&self) -> Uuid {
        match self {
            Self::RateLimit { event_id, .. }
            | Self::SuspiciousActivity { event_id, .. }
            | Self::SubjectBlocked { event_id, .. }
            | Self::BandwidthExceeded { event_id, .. }
            | Self::StoreOutage { event_id, .. } => *event_id,
        }
    }

    /// Returns the event type as a static string.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::RateLimit { .. } => "rate_limit",
            Self::SuspiciousActivity { .. } => "suspicious_activity",
            Self::SubjectBlocked { .. } => "subject_blocked",
            Self::BandwidthExceeded { .. } => "bandwidth_exceeded",
            Self::StoreOutage { .. } => "store_outage",
        }
    }

    /// Returns the event severity.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::RateLimit { severity, .. }
            | Self::SuspiciousActivity { severity, .. }
            | Self::SubjectBlocked { severity, .. }
            | Self::BandwidthExceeded { severity, .. }
            | Self::StoreOutage { severity, .. } => *severity,
        }
    }

    /// Returns when the event occurred.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RateLimit { timestamp, .. }
            | Self::SuspiciousActivity { timestamp, .. }
            | Self::SubjectBlocked { timestamp, .. }
            | Self::BandwidthExceeded { timestamp, .. }
            | Self::StoreOutage { timestamp, .. } => *timestamp,
        }
    }

    /// Serializes the event to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
