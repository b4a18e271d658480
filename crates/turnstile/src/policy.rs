//! Policy resolution: turning configuration tables into per-request limits.

use std::time::Duration;

use crate::config::{BurstConfig, GateConfig, LimitRule, LimitsConfig};
use crate::descriptor::{ActionCategory, ContentClass, Role};

/// The limits that apply to one request, computed from role, action
/// category, and content type. Immutable once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePolicy {
    /// Per-subject, per-endpoint limit (role and content scaled).
    pub limit: u64,
    /// Window for the per-endpoint counter.
    pub window: Duration,
    /// Secondary per-IP pair for login endpoints.
    pub login_ip: Option<LimitRule>,
    /// Stricter critical-operation overlay, when the category carries one.
    pub critical: Option<LimitRule>,
    /// Per-subject cross-endpoint limit (role scaled).
    pub subject_global: LimitRule,
    /// System-wide per-endpoint limit (overload protection).
    pub system_limit: u64,
    /// Burst counter pair, when burst detection is enabled.
    pub burst: Option<LimitRule>,
}

/// Computes effective limits from the configured tables.
///
/// Constructed once at startup from the immutable [`GateConfig`]; resolving
/// is pure arithmetic over read-only tables, so no locking is involved.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    limits: LimitsConfig,
    burst: BurstConfig,
}

impl PolicyResolver {
    /// Creates a resolver from limit tables.
    #[must_use]
    pub const fn new(limits: LimitsConfig, burst: BurstConfig) -> Self {
        Self { limits, burst }
    }

    /// Creates a resolver from the gate configuration.
    #[must_use]
    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(config.limits.clone(), config.burst)
    }

    /// Role multiplier, defaulting to 1.0 for unlisted roles.
    #[must_use]
    pub fn role_multiplier(&self, role: Role) -> f64 {
        self.limits.role_multipliers.get(&role).copied().unwrap_or(1.0)
    }

    /// Content multiplier, defaulting to 1.0 when the class is unknown.
    #[must_use]
    pub fn content_multiplier(&self, content: Option<ContentClass>) -> f64 {
        content
            .and_then(|c| self.limits.content_multipliers.get(&c).copied())
            .unwrap_or(1.0)
    }

    /// `max(1, floor(base * role_multiplier / content_multiplier))`.
    ///
    /// The floor at 1 guarantees every role can make at least one request
    /// per window regardless of how punishing the multipliers are.
    #[must_use]
    pub fn effective_limit(base: u64, role_multiplier: f64, content_multiplier: f64) -> u64 {
        let divisor = if content_multiplier > 0.0 { content_multiplier } else { 1.0 };
        let scaled = (base as f64 * role_multiplier / divisor).floor() as u64;
        scaled.max(1)
    }

    /// Resolves the full effective policy for one request.
    #[must_use]
    pub fn resolve(
        &self,
        role: Role,
        category: ActionCategory,
        content: Option<ContentClass>,
    ) -> EffectivePolicy {
        let base = self
            .limits
            .categories
            .get(&category)
            .copied()
            .unwrap_or(LimitRule::per_secs(100, 60));

        let role_mult = self.role_multiplier(role);
        let content_mult = self.content_multiplier(content);
        let limit = Self::effective_limit(base.limit, role_mult, content_mult);

        let subject_global = LimitRule::new(
            Self::effective_limit(self.limits.subject_global.limit, role_mult, 1.0),
            self.limits.subject_global.window,
        );

        EffectivePolicy {
            limit,
            window: base.window,
            login_ip: (category == ActionCategory::Login).then_some(self.limits.login_ip),
            critical: if category.is_critical() {
                self.limits.critical.get(&category).copied()
            } else {
                None
            },
            subject_global,
            system_limit: limit.saturating_mul(self.limits.system_global_factor),
            burst: self
                .burst
                .enabled
                .then_some(LimitRule::new(self.burst.threshold, self.burst.window)),
        }
    }
}
