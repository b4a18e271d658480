//! Audit logging backends.
//!
//! This module provides the [`AuditLogger`] trait and default implementations.

use crate::events::{AuditEvent, Severity};
use parking_lot::RwLock;

/// Trait for audit logging backends.
///
/// Implement this trait to create custom audit log destinations
/// (e.g., file, database, external collector). Backends must never block the
/// caller for unbounded time; the gate treats `log` as fire-and-forget.
pub trait AuditLogger: Send + Sync {
    /// Logs an audit event.
    fn log(&self, event: &AuditEvent);

    /// Logs an audit event if the severity is at or above the minimum.
    fn log_if_severe(&self, event: &AuditEvent, min_severity: Severity) {
        if event.severity() >= min_severity {
            self.log(event);
        }
    }
}

/// Audit logger that uses the `tracing` infrastructure.
///
/// Events are logged at levels based on severity:
/// - Info, Low → `tracing::info!`
/// - Medium → `tracing::warn!`
/// - High, Critical → `tracing::error!`
#[derive(Debug, Clone, Default)]
pub struct TracingAuditLogger {
    /// Optional prefix for all log messages.
    prefix: Option<String>,
}

impl TracingAuditLogger {
    /// Creates a new tracing-based audit logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new tracing-based audit logger with a prefix.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }
}

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: &AuditEvent) {
        let event_id = event.event_id();
        let event_type = event.event_type();
        let severity = event.severity();
        let timestamp = event.timestamp();

        // Serialize to JSON for structured logging (ignore errors)
        let json = event.to_json().unwrap_or_else(|_| "{}".to_string());

        let prefix = self.prefix.as_deref().unwrap_or("AUDIT");

        match severity {
            Severity::Info | Severity::Low => {
                tracing::info!(
                    target: "turnstile_audit",
                    %event_id,
                    %event_type,
                    %severity,
                    %timestamp,
                    event_json = %json,
                    "[{prefix}] {event_type}"
                );
            }
            Severity::Medium => {
                tracing::warn!(
                    target: "turnstile_audit",
                    %event_id,
                    %event_type,
                    %severity,
                    %timestamp,
                    event_json = %json,
                    "[{prefix}] {event_type}"
                );
            }
            Severity::High | Severity::Critical => {
                tracing::error!(
                    target: "turnstile_audit",
                    %event_id,
                    %event_type,
                    %severity,
                    %timestamp,
                    event_json = %json,
                    "[{prefix}] {event_type}"
                );
            }
        }
    }
}

/// A no-op audit logger for testing or disabled scenarios.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditLogger;

impl NoopAuditLogger {
    /// Creates a new no-op audit logger.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl AuditLogger for NoopAuditLogger {
    fn log(&self, _event: &AuditEvent) {
        // Intentionally does nothing
    }
}

/// In-memory audit logger that retains events for later inspection.
///
/// Primarily a test double, but also usable for exposing recent events over
/// an admin surface. Bounded: oldest events are dropped past `capacity`.
#[derive(Debug)]
pub struct MemoryAuditLogger {
    events: RwLock<Vec<AuditEvent>>,
    capacity: usize,
}

impl MemoryAuditLogger {
    /// Creates a new in-memory logger with the default capacity (1024).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Creates a new in-memory logger retaining at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            capacity,
        }
    }

    /// Returns a snapshot of all retained events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }

    /// Returns the number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns retained events of the given type.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Clears all retained events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl Default for MemoryAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: &AuditEvent) {
        let mut events = self.events.write();
        if events.len() >= self.capacity {
            events.remove(0);
        }
        events.push(event.clone());
    }
}

/// A boxed audit logger for dynamic dispatch.
pub type BoxedAuditLogger = Box<dyn AuditLogger>;

impl AuditLogger for BoxedAuditLogger {
    fn log(&self, event: &AuditEvent) {
        (**self).log(event);
    }
}
