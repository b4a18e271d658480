//! Hourly byte-usage ledger for download-class actions.
//!
//! Preflight runs before the handler and denies when the subject's ledger
//! already meets its quota. Postflight adds the completed response's size.
//! A single large transfer can therefore push usage over quota only after it
//! completes; the next request is the one denied. That ordering is the
//! intended semantic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::BandwidthConfig;
use crate::descriptor::{ContentClass, Role, Subject};
use crate::error::{GateError, GateResult};
use crate::store::{CounterStore, RateLimitKey, Scope};

const LEDGER_WINDOW_ID: &str = "hourly";

/// Per-subject hourly byte ledger built on the counter store.
pub struct BandwidthAccountant {
    store: Arc<dyn CounterStore>,
    config: BandwidthConfig,
    content_multipliers: HashMap<ContentClass, f64>,
}

impl std::fmt::Debug for BandwidthAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthAccountant")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BandwidthAccountant {
    /// Creates an accountant over the given counter store.
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: BandwidthConfig,
        content_multipliers: HashMap<ContentClass, f64>,
    ) -> Self {
        Self {
            store,
            config,
            content_multipliers,
        }
    }

    /// Effective hourly quota for a role and content class. Expensive
    /// content classes shrink the quota; a video byte costs more of the
    /// budget than a document byte.
    #[must_use]
    pub fn effective_quota(&self, role: Role, content: ContentClass) -> u64 {
        let base = self.config.role_quotas.get(&role).copied().unwrap_or(0);
        let multiplier = self
            .content_multipliers
            .get(&content)
            .copied()
            .unwrap_or(1.0);
        if multiplier <= 0.0 {
            return base;
        }
        (base as f64 / multiplier).floor() as u64
    }

    /// Checks the ledger before the handler runs.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::BandwidthExceeded`] when the subject's usage this
    /// hour already meets its effective quota. A store outage fails open.
    pub fn preflight(
        &self,
        subject: &Subject,
        role: Role,
        content: ContentClass,
    ) -> GateResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let quota = self.effective_quota(role, content);
        let key = RateLimitKey::new(subject, Scope::Bandwidth, LEDGER_WINDOW_ID);

        let used = match self.store.peek(&key) {
            Ok(used) => used,
            Err(err) => {
                warn!(subject = %subject, error = %err, "Bandwidth ledger unavailable, allowing");
                return Ok(());
            }
        };

        if used >= quota {
            let retry_after_secs = match self.store.remaining_window(&key) {
                Ok(remaining) => remaining.unwrap_or(self.config.window).as_secs(),
                Err(_) => self.config.window.as_secs(),
            };
            return Err(GateError::BandwidthExceeded {
                subject: subject.to_string(),
                used,
                quota,
                retry_after_secs,
            });
        }

        debug!(
            subject = %subject,
            used = used,
            quota = quota,
            "Bandwidth preflight passed"
        );
        Ok(())
    }

    /// Adds a completed response's size to the subject's ledger. Returns
    /// the new hourly total when the write lands.
    ///
    /// Runs after the response body is known and must never fail the
    /// request; write errors are logged and swallowed.
    pub fn record(&self, subject: &Subject, bytes: u64) -> Option<u64> {
        if !self.config.enabled || bytes == 0 {
            return None;
        }

        let key = RateLimitKey::new(subject, Scope::Bandwidth, LEDGER_WINDOW_ID);
        match self.store.add(&key, bytes, self.config.window) {
            Ok(total) => {
                debug!(subject = %subject, bytes = bytes, total = total, "Bandwidth recorded");
                Some(total)
            }
            Err(err) => {
                warn!(subject = %subject, error = %err, "Failed to record bandwidth usage");
                None
            }
        }
    }

    /// Bytes used by a subject in the current hour.
    #[must_use]
    pub fn usage(&self, subject: &Subject) -> u64 {
        let key = RateLimitKey::new(subject, Scope::Bandwidth, LEDGER_WINDOW_ID);
        self.store.peek(&key).unwrap_or(0)
    }

    /// Ledger window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.config.window
    }
}
