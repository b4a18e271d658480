//! # turnstile-audit
//!
//! Append-only audit event sink for the Turnstile admission gate.
//!
//! Every violation the gate observes (rate limit hits, suspicious input,
//! escalations to a block, bandwidth overruns, store outages) is emitted as a
//! typed [`AuditEvent`] and handed to an [`AuditLogger`]. Logging is
//! fire-and-forget by construction: `log` returns nothing, so a slow or
//! broken backend can never change an admission decision.
//!
//! ## Features
//!
//! - [`AuditEvent`] — enum covering all gate-relevant events
//! - [`AuditLogger`] — pluggable trait for audit backends
//! - [`TracingAuditLogger`] — default implementation using `tracing`
//! - [`MemoryAuditLogger`] — in-memory backend for tests and inspection
//!
//! ## Example
//!
//! ```rust
//! use turnstile_audit::{AuditEvent, AuditLogger, TracingAuditLogger, Severity};
//!
//! let logger = TracingAuditLogger::new();
//!
//! let event = AuditEvent::rate_limit_exceeded(
//!     "endpoint:/api/assets",
//!     76,
//!     75,
//!     60,
//!     "user:s-1042",
//! );
//! logger.log(&event);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod logger;

// Re-export main types
pub use error::{AuditError, Result};
pub use events::{
    AuditEvent, BandwidthOverrun, BlockApplied, RateLimitViolation, Severity, SuspiciousInput,
};
pub use logger::{AuditLogger, MemoryAuditLogger, NoopAuditLogger, TracingAuditLogger};
