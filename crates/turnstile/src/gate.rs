//! The top-level admission façade.
//!
//! `evaluate` runs the full check pipeline before the protected handler:
//! allowlist, blocklist, scope checks, abuse scan, and (for downloads) the
//! bandwidth preflight. `commit` runs after the handler, charging counters
//! and the bandwidth ledger for admitted requests only. Audit logging is
//! fire-and-forget; a failing sink never affects the decision.

use std::sync::Arc;

use tracing::{debug, info, warn};
use turnstile_audit::{AuditEvent, AuditLogger, TracingAuditLogger};

use crate::abuse::AbuseDetector;
use crate::bandwidth::BandwidthAccountant;
use crate::classify::{DenialResponse, ResponseClassifier};
use crate::config::GateConfig;
use crate::descriptor::{ContentClass, RequestDescriptor, ResponseMeta, RouteClassifier, Subject};
use crate::error::GateError;
use crate::escalation::{Block, EscalationManager};
use crate::limiter::{Admission, RateLimiterCore};
use crate::store::{CounterStore, MemoryCounterStore, StoreError};

/// A terminal denial: the underlying error plus its wire-level response.
#[derive(Debug)]
pub struct Denial {
    /// Why the request was refused.
    pub error: GateError,
    /// Classified response for the surrounding pipeline to serialize.
    pub response: DenialResponse,
}

/// Outcome of evaluating one request.
#[derive(Debug)]
pub enum Decision {
    /// The request may proceed to the protected handler.
    Allow(Admission),
    /// The request is refused; the response is terminal.
    Deny(Denial),
}

impl Decision {
    /// Whether the request was admitted.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    /// Whether the request was refused.
    #[must_use]
    pub const fn is_denied(&self) -> bool {
        matches!(self, Self::Deny(_))
    }

    /// The admission, when allowed.
    #[must_use]
    pub const fn admission(&self) -> Option<&Admission> {
        match self {
            Self::Allow(admission) => Some(admission),
            Self::Deny(_) => None,
        }
    }

    /// The denial, when refused.
    #[must_use]
    pub const fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Allow(_) => None,
            Self::Deny(denial) => Some(denial),
        }
    }
}

/// The admission-control façade invoked by the request pipeline.
pub struct Gate {
    config: GateConfig,
    limiter: RateLimiterCore,
    abuse: AbuseDetector,
    escalation: EscalationManager,
    bandwidth: BandwidthAccountant,
    classifier: ResponseClassifier,
    audit: Arc<dyn AuditLogger>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Gate {
    /// Creates a gate with an in-memory counter store and tracing-based
    /// audit logging.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MemoryCounterStore::new()),
            Arc::new(TracingAuditLogger::new()),
        )
    }

    /// Creates a gate over an injected counter store and audit sink.
    #[must_use]
    pub fn with_parts(
        config: GateConfig,
        store: Arc<dyn CounterStore>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        let limiter = RateLimiterCore::from_config(Arc::clone(&store), &config);
        let abuse = AbuseDetector::new(config.abuse);
        let escalation = EscalationManager::new(Arc::clone(&store), config.escalation);
        let bandwidth = BandwidthAccountant::new(
            store,
            config.bandwidth.clone(),
            config.limits.content_multipliers.clone(),
        );

        Self {
            config,
            limiter,
            abuse,
            escalation,
            bandwidth,
            classifier: ResponseClassifier::new(),
            audit,
        }
    }

    /// Evaluates a request before the protected handler runs.
    ///
    /// No counter is mutated here; call [`Gate::commit`] after the handler
    /// to charge counters and the bandwidth ledger.
    #[must_use]
    pub fn evaluate(&self, descriptor: &RequestDescriptor) -> Decision {
        let subject = &descriptor.subject;

        if self.config.is_allowlisted(&subject.to_string()) {
            debug!(subject = %subject, "Allowlisted subject, bypassing checks");
            return Decision::Allow(Admission::bypass(descriptor));
        }

        // Blocklist first: an active block short-circuits everything.
        if let Some(block) = self
            .escalation
            .check_blocked(subject)
            .or_else(|| descriptor.ip_subject().and_then(|ip| self.escalation.check_blocked(&ip)))
        {
            return self.deny(descriptor, Self::blocked_error(&block));
        }

        let admission = match self.limiter.check(descriptor) {
            Ok(admission) => admission,
            Err(err) => return self.deny(descriptor, err),
        };

        if let Err(err) = self.abuse.inspect(descriptor) {
            return self.deny(descriptor, err);
        }

        if descriptor.category.is_download() {
            let content = descriptor.content_class.unwrap_or(ContentClass::Other);
            if let Err(err) = self.bandwidth.preflight(subject, descriptor.role, content) {
                return self.deny(descriptor, err);
            }
        }

        for scope in &admission.skipped {
            self.audit
                .log(&AuditEvent::store_outage("peek", scope.as_str()));
        }

        debug!(
            subject = %subject,
            category = %descriptor.category,
            remaining = admission.remaining,
            "Request admitted"
        );
        Decision::Allow(admission)
    }

    /// Post-flight commit: charges counters and, for downloads, the
    /// bandwidth ledger. A no-op for denials and allowlist bypasses.
    ///
    /// The response's content class is authoritative for quota attribution;
    /// preflight only saw what the request declared. When the completed
    /// transfer pushes the ledger over that quota, the overshoot is audited
    /// here, so the denial of the next request is traceable to this one.
    pub fn commit(&self, decision: &Decision, meta: &ResponseMeta) {
        let Decision::Allow(admission) = decision else {
            return;
        };
        if admission.bypass {
            return;
        }

        self.limiter.commit(admission);

        if admission.category.is_download() {
            if let Some(total) = self.bandwidth.record(&admission.subject, meta.bytes) {
                let content = meta
                    .content_class
                    .or(admission.content_class)
                    .unwrap_or(ContentClass::Other);
                let quota = self.bandwidth.effective_quota(admission.role, content);
                if total >= quota {
                    self.audit.log(&AuditEvent::bandwidth_exceeded(
                        admission.subject.to_string(),
                        total,
                        quota,
                        admission.path.clone(),
                    ));
                }
            }
        }
    }

    /// Number of currently blocked subjects.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.escalation.blocked_count()
    }

    /// Snapshot of all active blocks.
    #[must_use]
    pub fn list_blocked(&self) -> Vec<Block> {
        self.escalation.list_blocked()
    }

    /// The gate's configuration.
    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Compiles the configured route table into a classifier for building
    /// request descriptors.
    #[must_use]
    pub fn classifier(&self) -> RouteClassifier {
        RouteClassifier::from_rules(&self.config.routes)
    }

    /// Removes expired blocks and stale repetition windows.
    pub fn cleanup(&self) {
        let blocks = self.escalation.cleanup();
        let windows = self.abuse.cleanup_stale();
        if blocks > 0 || windows > 0 {
            debug!(blocks = blocks, windows = windows, "Gate cleanup");
        }
    }

    fn blocked_error(block: &Block) -> GateError {
        GateError::Blocked {
            subject: block.subject.clone(),
            reason: block.reason.clone(),
            expires_at: block.expires_at,
            retry_after_secs: block.remaining().map_or(1, |d| d.as_secs().max(1)),
        }
    }

    /// Terminal denial path: escalate if the violation qualifies, audit,
    /// and classify the response.
    fn deny(&self, descriptor: &RequestDescriptor, error: GateError) -> Decision {
        if error.escalates() {
            if let Some(block) = self
                .escalation
                .record_violation(&descriptor.subject, Self::violation_type(&error))
            {
                info!(
                    subject = %block.subject,
                    expires_at = %block.expires_at,
                    "Escalation threshold crossed, subject blocked"
                );
                let event = Self::attach_ip(
                    descriptor,
                    AuditEvent::subject_blocked(
                        block.subject.clone(),
                        block.reason.clone(),
                        u64::from(block.block_count),
                        block.expires_at,
                    ),
                );
                self.audit.log(&event);
            }
        }

        let event = Self::attach_ip(descriptor, Self::audit_event(descriptor, &error));
        self.audit.log(&event);

        warn!(
            subject = %descriptor.subject,
            endpoint = %descriptor.path,
            category = %descriptor.category,
            error = %error,
            "Request denied"
        );

        let response = self.classifier.classify(&error);
        Decision::Deny(Denial { error, response })
    }

    fn violation_type(error: &GateError) -> &'static str {
        match error {
            GateError::SuspiciousActivity { .. } => "suspicious_activity",
            GateError::LimitExceeded { .. } => "critical_limit_exceeded",
            _ => "violation",
        }
    }

    fn audit_event(descriptor: &RequestDescriptor, error: &GateError) -> AuditEvent {
        match error {
            GateError::LimitExceeded { subject, scope, window_id, limit, count, .. } => {
                AuditEvent::rate_limit_exceeded(
                    format!("{}:{window_id}", scope.as_str()),
                    *count,
                    *limit,
                    0,
                    subject.clone(),
                )
            }
            GateError::SystemOverload { endpoint, limit, count, .. } => {
                AuditEvent::rate_limit_exceeded(
                    format!("system:{endpoint}"),
                    *count,
                    *limit,
                    0,
                    "system",
                )
            }
            GateError::SuspiciousActivity { subject, signature, location, fragment } => {
                AuditEvent::suspicious_activity(
                    signature.clone(),
                    location.clone(),
                    fragment.clone(),
                    subject.clone(),
                    descriptor.path.clone(),
                )
            }
            GateError::Blocked { subject, reason, expires_at, .. } => {
                AuditEvent::subject_blocked(subject.clone(), reason.clone(), 0, *expires_at)
            }
            GateError::BandwidthExceeded { subject, used, quota, .. } => {
                AuditEvent::bandwidth_exceeded(subject.clone(), *used, *quota, descriptor.path.clone())
            }
            GateError::Store(StoreError::Unavailable { operation }) => {
                AuditEvent::store_outage(*operation, "gate")
            }
        }
    }

    fn attach_ip(descriptor: &RequestDescriptor, event: AuditEvent) -> AuditEvent {
        match descriptor.ip {
            Some(ip) => event.with_ip(ip.to_string()),
            None => event,
        }
    }
}

/// Convenience: evaluate a request against a subject's active block only.
/// Useful for cheap pre-routing checks.
impl Gate {
    /// Returns the active block for a subject, if any.
    #[must_use]
    pub fn active_block(&self, subject: &Subject) -> Option<Block> {
        self.escalation.check_blocked(subject)
    }
}
