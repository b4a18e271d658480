//! The central decision engine: sequential scope checks with a single
//! commit pass.
//!
//! Scopes are evaluated in fixed precedence order so the reported violation
//! is deterministic: per-subject endpoint first, then the login IP pair,
//! the per-subject global, the system-wide endpoint limit, burst, and the
//! critical overlay. Counters are only incremented once every scope has
//! passed; a denied request never consumes budget.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::GateConfig;
use crate::descriptor::{ActionCategory, ContentClass, RequestDescriptor, Role, Subject};
use crate::error::{GateError, GateResult};
use crate::policy::PolicyResolver;
use crate::store::{CounterStore, RateLimitKey, Scope, StoreError};

/// One counter the request will be charged against if admitted.
#[derive(Debug, Clone)]
pub struct ScopeCharge {
    /// Counter key.
    pub key: RateLimitKey,
    /// Effective limit for this scope.
    pub limit: u64,
    /// Counter window.
    pub window: Duration,
}

/// A passed evaluation, carrying everything needed to commit the request
/// and to populate rate-limit response headers.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Subject that was admitted.
    pub subject: Subject,
    /// Resolved role of the subject.
    pub role: Role,
    /// Request path, kept for post-flight attribution.
    pub path: String,
    /// Resolved action category.
    pub category: ActionCategory,
    /// Content class, when the request declared one.
    pub content_class: Option<ContentClass>,
    /// Effective limit of the most specific scope (for `X-RateLimit-Limit`).
    pub limit: u64,
    /// Requests left in the most specific scope after this one commits.
    pub remaining: u64,
    /// Seconds until the most specific scope's window resets.
    pub reset_secs: u64,
    /// Scopes skipped because the store was unavailable (fail-open).
    pub skipped: Vec<Scope>,
    /// True when the subject is allowlisted and no counters apply.
    pub bypass: bool,
    charges: Vec<ScopeCharge>,
}

impl Admission {
    /// An admission that bypasses all counters (allowlisted subject).
    #[must_use]
    pub fn bypass(descriptor: &RequestDescriptor) -> Self {
        Self {
            subject: descriptor.subject.clone(),
            role: descriptor.role,
            path: descriptor.path.clone(),
            category: descriptor.category,
            content_class: descriptor.content_class,
            limit: 0,
            remaining: 0,
            reset_secs: 0,
            skipped: Vec::new(),
            bypass: true,
            charges: Vec::new(),
        }
    }

    /// Counters this admission will charge on commit.
    #[must_use]
    pub fn charges(&self) -> &[ScopeCharge] {
        &self.charges
    }
}

/// Orchestrates scope checks against the counter store.
pub struct RateLimiterCore {
    store: Arc<dyn CounterStore>,
    resolver: PolicyResolver,
}

impl std::fmt::Debug for RateLimiterCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterCore")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl RateLimiterCore {
    /// Creates a limiter over the given counter store.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, resolver: PolicyResolver) -> Self {
        Self { store, resolver }
    }

    /// Creates a limiter from the gate configuration.
    #[must_use]
    pub fn from_config(store: Arc<dyn CounterStore>, config: &GateConfig) -> Self {
        Self::new(store, PolicyResolver::from_config(config))
    }

    /// Evaluates every scope without mutating any counter.
    ///
    /// # Errors
    ///
    /// Returns the first scope violation in precedence order, or
    /// [`GateError::SystemOverload`] for the system-wide scope. Store
    /// outages fail open per scope and are reported in
    /// [`Admission::skipped`].
    pub fn check(&self, descriptor: &RequestDescriptor) -> GateResult<Admission> {
        let policy =
            self.resolver
                .resolve(descriptor.role, descriptor.category, descriptor.content_class);

        let subject = &descriptor.subject;
        let mut charges: Vec<ScopeCharge> = Vec::with_capacity(6);
        let mut skipped: Vec<Scope> = Vec::new();

        // 1. Per-subject, per-endpoint (most specific)
        charges.push(ScopeCharge {
            key: RateLimitKey::new(subject, Scope::Endpoint, &descriptor.path),
            limit: policy.limit,
            window: policy.window,
        });

        // Secondary login pair: the same endpoint counted against the IP,
        // so rotating identities behind one address still hits a wall.
        if let (Some(rule), Some(ip_subject)) = (policy.login_ip, descriptor.ip_subject()) {
            charges.push(ScopeCharge {
                key: RateLimitKey::new(&ip_subject, Scope::Endpoint, &descriptor.path),
                limit: rule.limit,
                window: rule.window,
            });
        }

        // 2. Per-subject global
        charges.push(ScopeCharge {
            key: RateLimitKey::new(subject, Scope::RoleGlobal, "global"),
            limit: policy.subject_global.limit,
            window: policy.subject_global.window,
        });

        // 3. Per-endpoint system-wide (overload protection)
        charges.push(ScopeCharge {
            key: RateLimitKey::system(Scope::SystemGlobal, &descriptor.path),
            limit: policy.system_limit,
            window: policy.window,
        });

        // 4. Burst
        if let Some(rule) = policy.burst {
            charges.push(ScopeCharge {
                key: RateLimitKey::new(subject, Scope::Burst, "burst"),
                limit: rule.limit,
                window: rule.window,
            });
        }

        // 5. Critical-operation overlay
        if let Some(rule) = policy.critical {
            charges.push(ScopeCharge {
                key: RateLimitKey::new(subject, Scope::Critical, descriptor.category.as_str()),
                limit: rule.limit,
                window: rule.window,
            });
        }

        for charge in &charges {
            match self.store.peek(&charge.key) {
                Ok(count) if count >= charge.limit => {
                    return Err(self.denial(descriptor, charge, count));
                }
                Ok(_) => {}
                Err(StoreError::Unavailable { operation }) => {
                    warn!(
                        key = %charge.key,
                        operation = operation,
                        "Counter store unavailable, failing open for scope"
                    );
                    skipped.push(charge.key.scope);
                }
            }
        }

        let endpoint = &charges[0];
        let count = self.store.peek(&endpoint.key).unwrap_or(0);
        let reset_secs = self
            .store
            .remaining_window(&endpoint.key)
            .ok()
            .flatten()
            .unwrap_or(endpoint.window)
            .as_secs();

        Ok(Admission {
            subject: descriptor.subject.clone(),
            role: descriptor.role,
            path: descriptor.path.clone(),
            category: descriptor.category,
            content_class: descriptor.content_class,
            limit: endpoint.limit,
            remaining: endpoint.limit.saturating_sub(count.saturating_add(1)),
            reset_secs,
            skipped,
            bypass: false,
            charges,
        })
    }

    /// Charges every scope counter for an admitted request in one pass.
    ///
    /// Runs only after all checks passed, so counters reflect admitted
    /// requests only. Store outages are logged and skipped. A counter that
    /// raced over its limit between check and commit is logged at debug;
    /// the admission stands, atomic increments are the hard requirement.
    pub fn commit(&self, admission: &Admission) {
        if admission.bypass {
            return;
        }

        for charge in &admission.charges {
            match self.store.try_increment(&charge.key, charge.limit, charge.window) {
                Ok(outcome) if !outcome.allowed => {
                    debug!(
                        key = %charge.key,
                        count = outcome.count,
                        limit = charge.limit,
                        "Counter raced over limit between check and commit"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(key = %charge.key, error = %err, "Failed to commit scope counter");
                }
            }
        }
    }

    /// Access to the policy resolver.
    #[must_use]
    pub const fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    fn denial(&self, descriptor: &RequestDescriptor, charge: &ScopeCharge, count: u64) -> GateError {
        let retry_after_secs = self
            .store
            .remaining_window(&charge.key)
            .ok()
            .flatten()
            .unwrap_or(charge.window)
            .as_secs()
            .max(1);

        if charge.key.scope == Scope::SystemGlobal {
            return GateError::SystemOverload {
                endpoint: descriptor.path.clone(),
                limit: charge.limit,
                count,
                retry_after_secs,
            };
        }

        GateError::LimitExceeded {
            subject: charge.key.subject.clone(),
            scope: charge.key.scope,
            window_id: charge.key.window_id.clone(),
            limit: charge.limit,
            count,
            retry_after_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitRule;
    use crate::descriptor::RouteClassifier;
    use crate::store::MemoryCounterStore;

    fn limiter_with(config: &GateConfig) -> (RateLimiterCore, Arc<MemoryCounterStore>) {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = RateLimiterCore::from_config(Arc::clone(&store) as Arc<dyn CounterStore>, config);
        (limiter, store)
    }

    fn api_descriptor(user: &str) -> RequestDescriptor {
        let classifier = RouteClassifier::with_defaults();
        RequestDescriptor::new(Subject::user(user), Role::Student, "GET", "/api/rooms", &classifier)
    }

    // ==================== Check/Commit Tests ====================

    #[test]
    fn test_admit_until_limit() {
        let config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::per_secs(3, 60))
            .build();
        let (limiter, _) = limiter_with(&config);
        let descriptor = api_descriptor("s-1");

        for _ in 0..3 {
            let admission = limiter.check(&descriptor).unwrap();
            limiter.commit(&admission);
        }

        let err = limiter.check(&descriptor).unwrap_err();
        match err {
            GateError::LimitExceeded { scope, limit, count, retry_after_secs, .. } => {
                assert_eq!(scope, Scope::Endpoint);
                assert_eq!(limit, 3);
                assert_eq!(count, 3);
                assert!(retry_after_secs > 0);
            }
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_check_does_not_consume_budget() {
        let config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::per_secs(2, 60))
            .build();
        let (limiter, _) = limiter_with(&config);
        let descriptor = api_descriptor("s-1");

        // Many checks without commits: nothing is consumed.
        for _ in 0..10 {
            assert!(limiter.check(&descriptor).is_ok());
        }

        let admission = limiter.check(&descriptor).unwrap();
        assert_eq!(admission.remaining, 1);
    }

    #[test]
    fn test_denied_request_consumes_nothing() {
        let config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::per_secs(1, 60))
            .build();
        let (limiter, store) = limiter_with(&config);
        let descriptor = api_descriptor("s-1");

        let admission = limiter.check(&descriptor).unwrap();
        limiter.commit(&admission);

        for _ in 0..5 {
            assert!(limiter.check(&descriptor).is_err());
        }

        let key = RateLimitKey::new(&descriptor.subject, Scope::Endpoint, "/api/rooms");
        assert_eq!(store.peek(&key).unwrap(), 1);
    }

    #[test]
    fn test_window_reset_readmits() {
        let config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::new(1, Duration::from_millis(20)))
            .build();
        let (limiter, _) = limiter_with(&config);
        let descriptor = api_descriptor("s-1");

        let admission = limiter.check(&descriptor).unwrap();
        limiter.commit(&admission);
        assert!(limiter.check(&descriptor).is_err());

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check(&descriptor).is_ok());
    }

    #[test]
    fn test_endpoint_precedence_over_global() {
        // Endpoint and subject-global both exhausted: endpoint is reported.
        let mut config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::per_secs(1, 60))
            .build();
        config.limits.subject_global = LimitRule::per_secs(1, 3600);
        let (limiter, _) = limiter_with(&config);
        let descriptor = api_descriptor("s-1");

        let admission = limiter.check(&descriptor).unwrap();
        limiter.commit(&admission);

        let err = limiter.check(&descriptor).unwrap_err();
        assert!(matches!(err, GateError::LimitExceeded { scope: Scope::Endpoint, .. }));
    }

    #[test]
    fn test_subject_global_scope() {
        let mut config = GateConfig::default();
        config.limits.subject_global = LimitRule::per_secs(2, 3600);
        config.burst.enabled = false;
        let (limiter, _) = limiter_with(&config);
        let classifier = RouteClassifier::with_defaults();

        // Two different endpoints share the subject-global budget.
        for path in ["/api/a", "/api/b"] {
            let d = RequestDescriptor::new(
                Subject::user("s-1"),
                Role::Student,
                "GET",
                path,
                &classifier,
            );
            let admission = limiter.check(&d).unwrap();
            limiter.commit(&admission);
        }

        let d = RequestDescriptor::new(Subject::user("s-1"), Role::Student, "GET", "/api/c", &classifier);
        let err = limiter.check(&d).unwrap_err();
        assert!(matches!(err, GateError::LimitExceeded { scope: Scope::RoleGlobal, .. }));
    }

    #[test]
    fn test_system_overload() {
        let mut config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::per_secs(2, 60))
            .build();
        config.limits.system_global_factor = 1;
        config.burst.enabled = false;
        let (limiter, _) = limiter_with(&config);
        let classifier = RouteClassifier::with_defaults();

        // Different subjects, same endpoint: they share the system counter.
        for user in ["a", "b"] {
            let d = RequestDescriptor::new(Subject::user(user), Role::Student, "GET", "/api/rooms", &classifier);
            let admission = limiter.check(&d).unwrap();
            limiter.commit(&admission);
        }

        let d = RequestDescriptor::new(Subject::user("c"), Role::Student, "GET", "/api/rooms", &classifier);
        let err = limiter.check(&d).unwrap_err();
        match err {
            GateError::SystemOverload { endpoint, .. } => assert_eq!(endpoint, "/api/rooms"),
            other => panic!("expected SystemOverload, got {other:?}"),
        }
    }

    #[test]
    fn test_burst_scope() {
        let mut config = GateConfig::default();
        config.burst.threshold = 2;
        config.burst.window = Duration::from_secs(10);
        let (limiter, _) = limiter_with(&config);
        let classifier = RouteClassifier::with_defaults();

        // Burst budget is shared across endpoints for the subject.
        for path in ["/api/a", "/api/b"] {
            let d = RequestDescriptor::new(Subject::user("s-1"), Role::Student, "GET", path, &classifier);
            let admission = limiter.check(&d).unwrap();
            limiter.commit(&admission);
        }

        let d = RequestDescriptor::new(Subject::user("s-1"), Role::Student, "GET", "/api/c", &classifier);
        let err = limiter.check(&d).unwrap_err();
        assert!(matches!(err, GateError::LimitExceeded { scope: Scope::Burst, .. }));
    }

    #[test]
    fn test_critical_overlay() {
        let mut config = GateConfig::default();
        config.burst.enabled = false;
        config.limits.critical.insert(ActionCategory::Backup, LimitRule::per_secs(1, 3600));
        config.limits.categories.insert(ActionCategory::Backup, LimitRule::per_secs(10, 3600));
        let (limiter, _) = limiter_with(&config);
        let classifier = RouteClassifier::with_defaults();

        let d = RequestDescriptor::new(Subject::user("admin-1"), Role::Admin, "POST", "/admin/backup", &classifier);
        assert_eq!(d.category, ActionCategory::Backup);

        let admission = limiter.check(&d).unwrap();
        limiter.commit(&admission);

        // Endpoint scope has room, the critical overlay does not.
        let err = limiter.check(&d).unwrap_err();
        assert!(matches!(err, GateError::LimitExceeded { scope: Scope::Critical, .. }));
    }

    #[test]
    fn test_login_ip_pair() {
        let mut config = GateConfig::default();
        config.limits.login_ip = LimitRule::per_secs(5, 900);
        config.limits.categories.insert(ActionCategory::Login, LimitRule::per_secs(3, 600));
        config.burst.enabled = false;
        let (limiter, _) = limiter_with(&config);
        let classifier = RouteClassifier::with_defaults();
        let ip = "1.2.3.4".parse().unwrap();

        let login = |email: &str| {
            RequestDescriptor::new(Subject::user(email), Role::Guest, "POST", "/auth/login", &classifier)
                .with_ip(ip)
        };

        // Guest multiplier 0.25 on base 3 floors the email limit at 1.
        // Exhaust a@x.com's email scope.
        let admission = limiter.check(&login("a@x.com")).unwrap();
        limiter.commit(&admission);
        let err = limiter.check(&login("a@x.com")).unwrap_err();
        assert!(matches!(err, GateError::LimitExceeded { scope: Scope::Endpoint, .. }));

        // Other identities from the same IP keep charging the IP pair.
        for email in ["b@x.com", "c@x.com", "d@x.com", "e@x.com"] {
            let admission = limiter.check(&login(email)).unwrap();
            limiter.commit(&admission);
        }

        // IP scope now at 5/5: the next identity is refused by the IP pair.
        let err = limiter.check(&login("f@x.com")).unwrap_err();
        match err {
            GateError::LimitExceeded { subject, scope, .. } => {
                assert_eq!(scope, Scope::Endpoint);
                assert_eq!(subject, "ip:1.2.3.4");
            }
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_fail_open_on_outage() {
        use crate::store::{IncrementOutcome, StoreError};

        struct DownStore;
        impl CounterStore for DownStore {
            fn try_increment(
                &self,
                _: &RateLimitKey,
                _: u64,
                _: Duration,
            ) -> Result<IncrementOutcome, StoreError> {
                Err(StoreError::Unavailable { operation: "try_increment" })
            }
            fn add(&self, _: &RateLimitKey, _: u64, _: Duration) -> Result<u64, StoreError> {
                Err(StoreError::Unavailable { operation: "add" })
            }
            fn peek(&self, _: &RateLimitKey) -> Result<u64, StoreError> {
                Err(StoreError::Unavailable { operation: "peek" })
            }
            fn remaining_window(&self, _: &RateLimitKey) -> Result<Option<Duration>, StoreError> {
                Err(StoreError::Unavailable { operation: "remaining_window" })
            }
            fn reset(&self, _: &RateLimitKey) -> Result<(), StoreError> {
                Err(StoreError::Unavailable { operation: "reset" })
            }
        }

        let limiter = RateLimiterCore::from_config(Arc::new(DownStore), &GateConfig::default());
        let descriptor = api_descriptor("s-1");

        let admission = limiter.check(&descriptor).unwrap();
        assert!(!admission.skipped.is_empty());
        assert!(admission.skipped.contains(&Scope::Endpoint));

        // Commit must not panic against a dead store.
        limiter.commit(&admission);
    }

    #[test]
    fn test_admission_headers() {
        let config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::per_secs(10, 60))
            .build();
        let (limiter, _) = limiter_with(&config);
        let descriptor = api_descriptor("s-1");

        let admission = limiter.check(&descriptor).unwrap();
        assert_eq!(admission.limit, 10);
        assert_eq!(admission.remaining, 9);
        assert!(admission.reset_secs <= 60);
        limiter.commit(&admission);

        let admission = limiter.check(&descriptor).unwrap();
        assert_eq!(admission.remaining, 8);
    }

    #[test]
    fn test_bypass_admission() {
        let (limiter, store) = limiter_with(&GateConfig::default());
        let descriptor = api_descriptor("s-1");

        let admission = Admission::bypass(&descriptor);
        limiter.commit(&admission);
        assert_eq!(store.tracked_count(), 0);
    }

    #[test]
    fn test_role_scales_endpoint_limit() {
        let config = GateConfig::builder()
            .category_limit(ActionCategory::Api, LimitRule::per_secs(4, 60))
            .build();
        let (limiter, _) = limiter_with(&config);
        let classifier = RouteClassifier::with_defaults();

        // Guest multiplier 0.25: effective limit 1.
        let d = RequestDescriptor::new(Subject::user("g-1"), Role::Guest, "GET", "/api/rooms", &classifier);
        let admission = limiter.check(&d).unwrap();
        assert_eq!(admission.limit, 1);

        // Admin multiplier 2.0: effective limit 8.
        let d = RequestDescriptor::new(Subject::user("a-1"), Role::Admin, "GET", "/api/rooms", &classifier);
        let admission = limiter.check(&d).unwrap();
        assert_eq!(admission.limit, 8);
    }
}
