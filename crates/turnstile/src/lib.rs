//! # turnstile
//!
//! Admission control for web backends: multi-scope rate limiting, abuse
//! detection, escalation to temporary blocks, and bandwidth accounting,
//! evaluated on every inbound request before business logic runs.
//!
//! ## Decision Pipeline
//!
//! - [`Gate`] - top-level façade: blocklist → scope checks → abuse scan →
//!   bandwidth preflight, then a single post-flight commit
//! - [`RateLimiterCore`] - sequential scope checks with deterministic
//!   precedence (endpoint, subject-global, system-wide, burst, critical)
//! - [`PolicyResolver`] - role- and content-scaled effective limits
//!
//! ## Enforcement
//!
//! - [`AbuseDetector`] - signature families plus a rapid-repetition heuristic
//! - [`EscalationManager`] - rolling violation tally, temporary blocks
//! - [`BandwidthAccountant`] - hourly byte ledger for downloads
//! - [`ResponseClassifier`] - 429/503/403 responses with `X-RateLimit-*`
//!   headers
//!
//! ## State
//!
//! - [`CounterStore`] - atomic increment-with-expiry primitive; the
//!   in-process [`MemoryCounterStore`] is the default backing
//! - [`GateConfig`] - immutable configuration, loaded once at startup
//!
//! # Example
//!
//! ```rust
//! use turnstile::{Gate, GateConfig, RequestDescriptor, ResponseMeta, Role, RouteClassifier, Subject};
//!
//! let gate = Gate::new(GateConfig::default());
//! let classifier = RouteClassifier::with_defaults();
//!
//! let request = RequestDescriptor::new(
//!     Subject::user("s-1042"),
//!     Role::Student,
//!     "GET",
//!     "/api/rooms",
//!     &classifier,
//! );
//!
//! let decision = gate.evaluate(&request);
//! if decision.is_allowed() {
//!     // ... run the protected handler ...
//!     gate.commit(&decision, &ResponseMeta::new(2048));
//! } else if let Some(denial) = decision.denial() {
//!     println!("{} {}", denial.response.status, denial.response.to_json());
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod abuse;
pub mod bandwidth;
pub mod classify;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod escalation;
pub mod gate;
pub mod limiter;
pub mod policy;
pub mod store;

// Re-export main types
pub use abuse::{AbuseDetector, ScanMatch, SignatureKind};
pub use bandwidth::BandwidthAccountant;
pub use classify::{DenialResponse, ResponseClassifier};
pub use config::{
    AbuseConfig, BandwidthConfig, BurstConfig, EscalationConfig, GateConfig, GateConfigBuilder,
    LimitRule, LimitsConfig,
};
pub use descriptor::{
    ActionCategory, ContentClass, RequestDescriptor, ResponseMeta, Role, RouteClassifier,
    RouteRule, Subject,
};
pub use error::{GateError, GateResult};
pub use escalation::{Block, EscalationManager};
pub use gate::{Decision, Denial, Gate};
pub use limiter::{Admission, RateLimiterCore, ScopeCharge};
pub use policy::{EffectivePolicy, PolicyResolver};
pub use store::{
    CounterStore, IncrementOutcome, MemoryCounterStore, RateLimitKey, Scope, StoreError,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::classify::{DenialResponse, ResponseClassifier};
    pub use crate::config::{GateConfig, LimitRule};
    pub use crate::descriptor::{
        ActionCategory, ContentClass, RequestDescriptor, ResponseMeta, Role, RouteClassifier,
        Subject,
    };
    pub use crate::error::{GateError, GateResult};
    pub use crate::gate::{Decision, Denial, Gate};
    pub use crate::store::{CounterStore, MemoryCounterStore, Scope};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_flow() {
        let gate = Gate::new(GateConfig::default());
        let classifier = RouteClassifier::with_defaults();

        let request = RequestDescriptor::new(
            Subject::user("s-1"),
            Role::Student,
            "GET",
            "/api/rooms",
            &classifier,
        );

        let decision = gate.evaluate(&request);
        assert!(decision.is_allowed());
        gate.commit(&decision, &ResponseMeta::new(512));
    }

    #[test]
    fn test_denial_renders_wire_contract() {
        let gate = Gate::new(GateConfig::default());
        let classifier = RouteClassifier::with_defaults();

        let request = RequestDescriptor::new(
            Subject::user("s-1"),
            Role::Student,
            "POST",
            "/api/search",
            &classifier,
        )
        .with_input("q", "'; DROP TABLE students; --");

        let decision = gate.evaluate(&request);
        let denial = decision.denial().expect("signature should deny");

        assert_eq!(denial.response.status, 429);
        assert!(denial.response.header("Retry-After").is_some());
        let body: serde_json::Value = serde_json::from_str(&denial.response.to_json()).unwrap();
        assert_eq!(body["code"], "SUSPICIOUS_ACTIVITY");
    }
}
