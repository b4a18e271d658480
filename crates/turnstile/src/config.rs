//! Gate configuration.
//!
//! All limits, multiplier tables, and thresholds live here as one immutable
//! struct tree. The configuration is loaded (or built) once at process start
//! and passed by reference into the gate; nothing mutates it at runtime.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::{default_route_rules, ActionCategory, ContentClass, Role, RouteRule};

/// One `(limit, window)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Maximum requests per window.
    pub limit: u64,
    /// Window length.
    pub window: Duration,
}

impl LimitRule {
    /// Creates a limit rule.
    #[must_use]
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Shorthand with the window in seconds.
    #[must_use]
    pub const fn per_secs(limit: u64, window_secs: u64) -> Self {
        Self::new(limit, Duration::from_secs(window_secs))
    }
}

/// Base limits and multiplier tables for the policy resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Base per-subject limit per action category.
    pub categories: HashMap<ActionCategory, LimitRule>,
    /// Secondary per-IP pair for login endpoints (checked alongside the
    /// per-credential limit).
    pub login_ip: LimitRule,
    /// Stricter critical-operation overlay, keyed by category.
    pub critical: HashMap<ActionCategory, LimitRule>,
    /// Role multipliers applied to base limits.
    pub role_multipliers: HashMap<Role, f64>,
    /// Content-type multipliers dividing base limits (video costs more).
    pub content_multipliers: HashMap<ContentClass, f64>,
    /// Per-subject limit across all endpoints, scaled by role multiplier.
    pub subject_global: LimitRule,
    /// System-global per-endpoint limit as a factor over the per-subject
    /// effective limit (overload protection).
    pub system_global_factor: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let categories = HashMap::from([
            (ActionCategory::Api, LimitRule::per_secs(100, 60)),
            (ActionCategory::Login, LimitRule::per_secs(3, 600)),
            (ActionCategory::Download, LimitRule::per_secs(20, 60)),
            (ActionCategory::Upload, LimitRule::per_secs(10, 60)),
            (ActionCategory::AccountCreation, LimitRule::per_secs(5, 3600)),
            (ActionCategory::BulkWrite, LimitRule::per_secs(10, 3600)),
            (ActionCategory::Backup, LimitRule::per_secs(2, 3600)),
        ]);
        let critical = HashMap::from([
            (ActionCategory::AccountCreation, LimitRule::per_secs(3, 3600)),
            (ActionCategory::BulkWrite, LimitRule::per_secs(5, 3600)),
            (ActionCategory::Backup, LimitRule::per_secs(1, 3600)),
        ]);
        let role_multipliers = HashMap::from([
            (Role::Admin, 2.0),
            (Role::Staff, 1.5),
            (Role::Student, 1.0),
            (Role::Guest, 0.25),
        ]);
        let content_multipliers = HashMap::from([
            (ContentClass::Document, 1.0),
            (ContentClass::Image, 1.5),
            (ContentClass::Audio, 2.0),
            (ContentClass::Video, 4.0),
            (ContentClass::Archive, 2.5),
            (ContentClass::Other, 1.0),
        ]);

        Self {
            categories,
            login_ip: LimitRule::per_secs(5, 900),
            critical,
            role_multipliers,
            content_multipliers,
            subject_global: LimitRule::per_secs(1000, 3600),
            system_global_factor: 100,
        }
    }
}

/// Short-window burst detection settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Maximum requests per burst window.
    pub threshold: u64,
    /// Burst window length.
    pub window: Duration,
    /// Whether burst detection is enabled.
    pub enabled: bool,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            window: Duration::from_secs(10),
            enabled: true,
        }
    }
}

/// Abuse detector settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// Whether signature scanning is enabled.
    pub signatures_enabled: bool,
    /// Identical submissions within the repeat window that trip the
    /// rapid-repetition heuristic.
    pub max_repeats: u64,
    /// Repeat-detection window.
    pub repeat_window: Duration,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            signatures_enabled: true,
            max_repeats: 5,
            repeat_window: Duration::from_secs(10),
        }
    }
}

/// Escalation and blocklist settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Violations within the rolling window before a block is created.
    pub violation_threshold: u64,
    /// Rolling violation window.
    pub violation_window: Duration,
    /// Block TTL for a first offense.
    pub block_duration: Duration,
    /// Hard cap on any block TTL. Blocks always expire.
    pub max_block_duration: Duration,
    /// Whether escalation is enabled.
    pub enabled: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            violation_threshold: 5,
            violation_window: Duration::from_secs(3600),
            block_duration: Duration::from_secs(1800), // 30 minutes
            max_block_duration: Duration::from_secs(3600),
            enabled: true,
        }
    }
}

/// Bandwidth accounting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Base hourly byte quota per role. Divided by the content multiplier
    /// of the transfer.
    pub role_quotas: HashMap<Role, u64>,
    /// Ledger window (one hour).
    pub window: Duration,
    /// Whether bandwidth accounting is enabled.
    pub enabled: bool,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        Self {
            role_quotas: HashMap::from([
                (Role::Admin, 5 * 1024 * MIB),
                (Role::Staff, 2 * 1024 * MIB),
                (Role::Student, 1024 * MIB),
                (Role::Guest, 256 * MIB),
            ]),
            window: Duration::from_secs(3600),
            enabled: true,
        }
    }
}

/// Top-level gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Limit tables for the policy resolver.
    pub limits: LimitsConfig,
    /// Burst detection settings.
    pub burst: BurstConfig,
    /// Abuse detector settings.
    pub abuse: AbuseConfig,
    /// Escalation and blocklist settings.
    pub escalation: EscalationConfig,
    /// Bandwidth accounting settings.
    pub bandwidth: BandwidthConfig,
    /// Ordered route-to-category table.
    pub routes: Vec<RouteRule>,
    /// Subjects that bypass all checks (rendered `user:<id>`/`ip:<addr>`).
    pub allowlist: HashSet<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            burst: BurstConfig::default(),
            abuse: AbuseConfig::default(),
            escalation: EscalationConfig::default(),
            bandwidth: BandwidthConfig::default(),
            routes: default_route_rules(),
            allowlist: HashSet::new(),
        }
    }
}

impl GateConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> GateConfigBuilder {
        GateConfigBuilder::default()
    }

    /// Checks whether a rendered subject is allowlisted.
    #[must_use]
    pub fn is_allowlisted(&self, subject: &str) -> bool {
        self.allowlist.contains(subject)
    }
}

/// Builder for [`GateConfig`].
#[derive(Debug, Clone, Default)]
pub struct GateConfigBuilder {
    config: GateConfig,
}

impl GateConfigBuilder {
    /// Sets the limit tables.
    #[must_use]
    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.config.limits = limits;
        self
    }

    /// Sets burst detection settings.
    #[must_use]
    pub fn burst(mut self, burst: BurstConfig) -> Self {
        self.config.burst = burst;
        self
    }

    /// Sets abuse detector settings.
    #[must_use]
    pub fn abuse(mut self, abuse: AbuseConfig) -> Self {
        self.config.abuse = abuse;
        self
    }

    /// Sets escalation settings.
    #[must_use]
    pub fn escalation(mut self, escalation: EscalationConfig) -> Self {
        self.config.escalation = escalation;
        self
    }

    /// Sets bandwidth accounting settings.
    #[must_use]
    pub fn bandwidth(mut self, bandwidth: BandwidthConfig) -> Self {
        self.config.bandwidth = bandwidth;
        self
    }

    /// Replaces the route table.
    #[must_use]
    pub fn routes(mut self, routes: Vec<RouteRule>) -> Self {
        self.config.routes = routes;
        self
    }

    /// Appends a route rule.
    #[must_use]
    pub fn route(mut self, rule: RouteRule) -> Self {
        self.config.routes.push(rule);
        self
    }

    /// Overrides the base limit for one category.
    #[must_use]
    pub fn category_limit(mut self, category: ActionCategory, rule: LimitRule) -> Self {
        self.config.limits.categories.insert(category, rule);
        self
    }

    /// Adds an allowlisted subject.
    #[must_use]
    pub fn allow_subject(mut self, subject: impl Into<String>) -> Self {
        self.config.allowlist.insert(subject.into());
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> GateConfig {
        self.config
    }
}
