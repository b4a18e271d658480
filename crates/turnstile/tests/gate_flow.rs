//! End-to-end tests for the admission pipeline: evaluate, handler, commit.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use turnstile::{
    ActionCategory, ContentClass, CounterStore, Decision, Gate, GateConfig, GateError,
    IncrementOutcome, LimitRule, MemoryCounterStore, RateLimitKey, RequestDescriptor,
    ResponseMeta, Role, RouteClassifier, Scope, StoreError, Subject,
};
use turnstile_audit::{AuditLogger, MemoryAuditLogger};

// ==================== Helper Functions ====================

fn gate_with_audit(config: GateConfig) -> (Gate, Arc<MemoryAuditLogger>) {
    let audit = Arc::new(MemoryAuditLogger::new());
    let gate = Gate::with_parts(
        config,
        Arc::new(MemoryCounterStore::new()),
        Arc::clone(&audit) as Arc<dyn AuditLogger>,
    );
    (gate, audit)
}

fn request(user: &str, method: &str, path: &str) -> RequestDescriptor {
    let classifier = RouteClassifier::with_defaults();
    RequestDescriptor::new(Subject::user(user), Role::Student, method, path, &classifier)
}

fn admit(gate: &Gate, descriptor: &RequestDescriptor) {
    let decision = gate.evaluate(descriptor);
    assert!(decision.is_allowed(), "expected allow, got {decision:?}");
    gate.commit(&decision, &ResponseMeta::new(0));
}

/// Store double that is permanently down.
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

// ==================== Limit and Window Tests ====================

#[test]
fn test_limit_boundary_and_retry_after() {
    let config = GateConfig::builder()
        .category_limit(ActionCategory::Api, LimitRule::per_secs(5, 60))
        .build();
    let (gate, _) = gate_with_audit(config);

    for _ in 0..5 {
        admit(&gate, &request("s-1", "GET", "/api/rooms"));
    }

    let decision = gate.evaluate(&request("s-1", "GET", "/api/rooms"));
    let denial = decision.denial().expect("sixth request should be denied");
    assert_eq!(denial.response.status, 429);
    assert!(denial.response.retry_after_secs > 0);
    assert_eq!(denial.response.header("X-RateLimit-Remaining"), Some("0"));
}

#[test]
fn test_window_elapse_readmits() {
    let config = GateConfig::builder()
        .category_limit(ActionCategory::Api, LimitRule::new(1, Duration::from_millis(30)))
        .build();
    let (gate, _) = gate_with_audit(config);

    admit(&gate, &request("s-1", "GET", "/api/rooms"));
    assert!(gate.evaluate(&request("s-1", "GET", "/api/rooms")).is_denied());

    std::thread::sleep(Duration::from_millis(40));
    admit(&gate, &request("s-1", "GET", "/api/rooms"));
}

#[test]
fn test_subjects_do_not_share_endpoint_budget() {
    let config = GateConfig::builder()
        .category_limit(ActionCategory::Api, LimitRule::per_secs(1, 60))
        .build();
    let (gate, _) = gate_with_audit(config);

    admit(&gate, &request("s-1", "GET", "/api/rooms"));
    admit(&gate, &request("s-2", "GET", "/api/rooms"));
    assert!(gate.evaluate(&request("s-1", "GET", "/api/rooms")).is_denied());
}

// ==================== Login Scenario ====================

#[test]
fn test_login_email_and_ip_scopes() {
    let mut config = GateConfig::default();
    config.limits.categories.insert(ActionCategory::Login, LimitRule::per_secs(3, 600));
    config.limits.login_ip = LimitRule::per_secs(5, 900);
    config.limits.role_multipliers.insert(Role::Guest, 1.0);
    config.burst.enabled = false;
    let (gate, _) = gate_with_audit(config);

    let classifier = RouteClassifier::with_defaults();
    let ip: IpAddr = "1.2.3.4".parse().unwrap();
    let login = |email: &str| {
        RequestDescriptor::new(Subject::user(email), Role::Guest, "POST", "/auth/login", &classifier)
            .with_ip(ip)
    };

    // Three attempts exhaust a@x.com's email scope; each also charged the IP.
    for _ in 0..3 {
        admit(&gate, &login("a@x.com"));
    }
    let decision = gate.evaluate(&login("a@x.com"));
    match &decision.denial().unwrap().error {
        GateError::LimitExceeded { subject, .. } => assert_eq!(subject, "user:a@x.com"),
        other => panic!("expected email-scope denial, got {other:?}"),
    }

    // A different identity from the same IP is still checked against the
    // IP scope and increments it.
    admit(&gate, &login("b@x.com"));
    admit(&gate, &login("c@x.com"));

    // IP counter now at 5/5: the sixth admitted-or-not attempt from this
    // address is refused with an IP-scope message.
    let decision = gate.evaluate(&login("d@x.com"));
    match &decision.denial().unwrap().error {
        GateError::LimitExceeded { subject, scope, retry_after_secs, .. } => {
            assert_eq!(subject, "ip:1.2.3.4");
            assert_eq!(*scope, Scope::Endpoint);
            assert!(*retry_after_secs > 0 && *retry_after_secs <= 900);
        }
        other => panic!("expected IP-scope denial, got {other:?}"),
    }
}

// ==================== Escalation ====================

#[test]
fn test_suspicious_activity_escalates_to_block() {
    let (gate, audit) = gate_with_audit(GateConfig::default());
    let classifier = RouteClassifier::with_defaults();
    let ip: IpAddr = "10.9.8.7".parse().unwrap();

    let attack = RequestDescriptor::new(
        Subject::user("mallory"),
        Role::Student,
        "POST",
        "/api/search",
        &classifier,
    )
    .with_ip(ip)
    .with_input("q", "../../etc/passwd");

    for _ in 0..5 {
        let decision = gate.evaluate(&attack);
        let denial = decision.denial().unwrap();
        assert!(matches!(denial.error, GateError::SuspiciousActivity { .. }));
    }

    // Threshold crossed on the fifth violation.
    assert_eq!(gate.blocked_count(), 1);
    let block = gate.active_block(&Subject::user("mallory")).unwrap();
    assert!(block.remaining().unwrap() <= Duration::from_secs(3600));

    // A request that would pass every counter is refused while blocked.
    let clean = request("mallory", "GET", "/api/rooms");
    let decision = gate.evaluate(&clean);
    let denial = decision.denial().unwrap();
    assert_eq!(denial.response.status, 403);
    assert_eq!(denial.response.code, "SUBJECT_BLOCKED");

    // Audit trail: five suspicious events plus the block.
    assert_eq!(audit.events_of_type("suspicious_activity").len(), 5);
    assert_eq!(audit.events_of_type("subject_blocked").len(), 2); // creation + the refusal
}

#[test]
fn test_blocked_requests_do_not_extend_the_tally() {
    let (gate, _) = gate_with_audit(GateConfig::default());
    let attack = request("mallory", "POST", "/api/search").with_input("q", "<script>x</script>");

    for _ in 0..5 {
        let _ = gate.evaluate(&attack);
    }
    assert_eq!(gate.blocked_count(), 1);

    // Hammering while blocked does not stack further blocks.
    for _ in 0..10 {
        assert!(gate.evaluate(&attack).is_denied());
    }
    assert_eq!(gate.blocked_count(), 1);
}

#[test]
fn test_critical_limit_denials_escalate_to_block() {
    let (gate, audit) = gate_with_audit(GateConfig::default());
    let backup = request("op-1", "POST", "/admin/backup");
    assert_eq!(backup.category, ActionCategory::Backup);

    // One backup per hour is the critical ceiling; the first goes through.
    admit(&gate, &backup);

    // Hammering the exhausted critical scope: each denial feeds the tally.
    for _ in 0..5 {
        let decision = gate.evaluate(&backup);
        match &decision.denial().unwrap().error {
            GateError::LimitExceeded { scope, .. } => assert_eq!(*scope, Scope::Critical),
            other => panic!("expected critical-scope denial, got {other:?}"),
        }
    }

    // Fifth violation crosses the threshold and blocks the subject.
    assert_eq!(gate.blocked_count(), 1);
    assert_eq!(audit.events_of_type("subject_blocked").len(), 1);

    let decision = gate.evaluate(&request("op-1", "GET", "/api/rooms"));
    let denial = decision.denial().unwrap();
    assert!(matches!(denial.error, GateError::Blocked { .. }));
    assert_eq!(denial.response.status, 403);
}

// ==================== Bandwidth ====================

#[test]
fn test_download_overshoot_then_deny() {
    let mut config = GateConfig::default();
    config.bandwidth.role_quotas = HashMap::from([(Role::Student, 10_000)]);
    let (gate, _) = gate_with_audit(config);

    let classifier = RouteClassifier::with_defaults();
    let download = RequestDescriptor::new(
        Subject::user("s-1"),
        Role::Student,
        "GET",
        "/downloads/lecture.mp4",
        &classifier,
    )
    .with_content_class(ContentClass::Video);
    assert_eq!(download.category, ActionCategory::Download);

    // Video divides the 10_000-byte budget by 4: effective quota 2_500.
    // The first transfer passes preflight and overshoots on commit.
    let decision = gate.evaluate(&download);
    assert!(decision.is_allowed());
    gate.commit(&decision, &ResponseMeta::new(4_000).with_content_class(ContentClass::Video));

    let decision = gate.evaluate(&download);
    match &decision.denial().unwrap().error {
        GateError::BandwidthExceeded { used, quota, .. } => {
            assert_eq!(*used, 4_000);
            assert_eq!(*quota, 2_500);
        }
        other => panic!("expected BandwidthExceeded, got {other:?}"),
    }

    // Non-download traffic is unaffected by the exhausted ledger.
    admit(&gate, &request("s-1", "GET", "/api/rooms"));
}

// ==================== Fail-Open ====================

#[test]
fn test_dead_store_fails_open() {
    let audit = Arc::new(MemoryAuditLogger::new());
    let gate = Gate::with_parts(
        GateConfig::default(),
        Arc::new(DownStore),
        Arc::clone(&audit) as Arc<dyn AuditLogger>,
    );

    // Every scope is unavailable; the request is still admitted and the
    // outage is reported per skipped scope.
    let decision = gate.evaluate(&request("s-1", "GET", "/api/rooms"));
    let admission = decision.admission().expect("fail-open should admit");
    assert!(admission.skipped.contains(&Scope::Endpoint));
    assert!(!audit.events_of_type("store_outage").is_empty());

    // Commit and download accounting must not panic against a dead store.
    gate.commit(&decision, &ResponseMeta::new(1024));

    let classifier = RouteClassifier::with_defaults();
    let download = RequestDescriptor::new(
        Subject::user("s-1"),
        Role::Student,
        "GET",
        "/files/doc.pdf",
        &classifier,
    );
    let decision = gate.evaluate(&download);
    assert!(decision.is_allowed());
    gate.commit(&decision, &ResponseMeta::new(1024));
}

// ==================== Wire Contract ====================

#[test]
fn test_denial_wire_contract() {
    let config = GateConfig::builder()
        .category_limit(ActionCategory::Api, LimitRule::per_secs(1, 60))
        .build();
    let (gate, _) = gate_with_audit(config);

    admit(&gate, &request("s-1", "GET", "/api/rooms"));
    let decision = gate.evaluate(&request("s-1", "GET", "/api/rooms"));
    let response = &decision.denial().unwrap().response;

    let body: serde_json::Value = serde_json::from_str(&response.to_json()).unwrap();
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["retry_after"], response.retry_after_secs);
    assert!(body["message"].as_str().unwrap().contains(&response.retry_after_secs.to_string()));
    assert!(body["timestamp"].as_str().unwrap().contains('T'));

    let plain = response.to_plain_text();
    assert!(plain.contains("RATE_LIMIT_EXCEEDED"));
    assert_eq!(
        response.header("Retry-After"),
        Some(response.retry_after_secs.to_string().as_str())
    );
}

#[test]
fn test_allowlisted_subject_bypasses_everything() {
    let config = GateConfig::builder()
        .category_limit(ActionCategory::Api, LimitRule::per_secs(1, 60))
        .allow_subject("user:healthcheck")
        .build();
    let (gate, audit) = gate_with_audit(config);

    for _ in 0..20 {
        let decision = gate.evaluate(&request("healthcheck", "GET", "/api/rooms"));
        assert!(decision.is_allowed());
        assert!(decision.admission().unwrap().bypass);
        gate.commit(&decision, &ResponseMeta::new(0));
    }
    assert!(audit.is_empty());
}

// ==================== Decision Shape ====================

#[test]
fn test_decision_accessors() {
    let (gate, _) = gate_with_audit(GateConfig::default());
    let decision = gate.evaluate(&request("s-1", "GET", "/api/rooms"));

    assert!(decision.is_allowed());
    assert!(!decision.is_denied());
    let admission = decision.admission().unwrap();
    assert_eq!(admission.category, ActionCategory::Api);
    assert!(admission.limit > 0);

    match decision {
        Decision::Allow(admission) => assert!(!admission.bypass),
        Decision::Deny(_) => panic!("expected allow"),
    }
}
