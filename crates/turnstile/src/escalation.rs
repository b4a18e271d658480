//! Escalation of repeated violations into temporary blocks.
//!
//! The violation tally lives in the [`CounterStore`] under
//! [`Scope::Violations`] with a rolling one-hour window. Block metadata is
//! kept in an in-process blocklist with lazy expiry. Blocks always carry a
//! finite TTL; there is no permanent block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::EscalationConfig;
use crate::descriptor::Subject;
use crate::store::{CounterStore, RateLimitKey, Scope};

const VIOLATION_WINDOW_ID: &str = "hourly";

/// A temporary block on a subject.
#[derive(Debug, Clone)]
pub struct Block {
    /// Blocked subject, rendered (`user:<id>` or `ip:<addr>`).
    pub subject: String,
    /// Why the block was created.
    pub reason: String,
    /// When the block was created.
    pub created_at: DateTime<Utc>,
    /// When the block expires. Always finite.
    pub expires_at: DateTime<Utc>,
    /// How many times this subject has been blocked.
    pub block_count: u32,
}

impl Block {
    fn new(subject: String, reason: impl Into<String>, duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            subject,
            reason: reason.into(),
            created_at: now,
            expires_at: now + chrono::Duration::milliseconds(duration.as_millis() as i64),
            block_count: 1,
        }
    }

    /// Whether the block has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Remaining time on the block, `None` once expired.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        let now = Utc::now();
        if self.expires_at > now {
            let diff = self.expires_at - now;
            Some(Duration::from_millis(diff.num_milliseconds() as u64))
        } else {
            None
        }
    }
}

/// Entry in the blocklist with internal timing.
#[derive(Debug)]
struct BlockEntry {
    block: Block,
    /// Internal timing for fast expiry checks.
    expires_instant: Instant,
}

impl BlockEntry {
    fn new(block: Block, duration: Duration) -> Self {
        Self {
            block,
            expires_instant: Instant::now() + duration,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_instant
    }
}

/// Subject blocklist with automatic expiry.
#[derive(Debug)]
struct Blocklist {
    blocked: RwLock<HashMap<String, BlockEntry>>,
    last_cleanup: RwLock<Instant>,
    cleanup_interval: Duration,
}

impl Blocklist {
    fn new() -> Self {
        Self {
            blocked: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
            cleanup_interval: Duration::from_secs(60),
        }
    }

    /// Inserts or refreshes a block. Returns the stored block.
    fn block(&self, subject: &str, reason: &str, duration: Duration) -> Block {
        let mut blocked = self.blocked.write();

        let stored = if let Some(existing) = blocked.get_mut(subject) {
            let count = existing.block.block_count.saturating_add(1);
            let mut block = Block::new(subject.to_string(), reason, duration);
            block.block_count = count;
            *existing = BlockEntry::new(block.clone(), duration);
            info!(
                subject = %subject,
                reason = %reason,
                block_count = count,
                "Subject re-blocked"
            );
            block
        } else {
            let block = Block::new(subject.to_string(), reason, duration);
            blocked.insert(subject.to_string(), BlockEntry::new(block.clone(), duration));
            info!(subject = %subject, reason = %reason, "Subject blocked");
            block
        };

        drop(blocked);
        self.maybe_cleanup();
        stored
    }

    fn get(&self, subject: &str) -> Option<Block> {
        self.maybe_cleanup();
        let blocked = self.blocked.read();
        blocked.get(subject).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.block.clone())
            }
        })
    }

    fn block_count(&self, subject: &str) -> u32 {
        self.blocked
            .read()
            .get(subject)
            .map_or(0, |e| e.block.block_count)
    }

    fn len(&self) -> usize {
        self.blocked
            .read()
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }

    fn list(&self) -> Vec<Block> {
        self.blocked
            .read()
            .values()
            .filter(|e| !e.is_expired())
            .map(|e| e.block.clone())
            .collect()
    }

    fn cleanup(&self) -> usize {
        let mut blocked = self.blocked.write();
        let initial = blocked.len();

        blocked.retain(|subject, entry| {
            let keep = !entry.is_expired();
            if !keep {
                debug!(subject = %subject, "Block expired, removing");
            }
            keep
        });

        let removed = initial.saturating_sub(blocked.len());
        *self.last_cleanup.write() = Instant::now();
        removed
    }

    fn maybe_cleanup(&self) {
        let should_cleanup = {
            let last = *self.last_cleanup.read();
            last.elapsed() >= self.cleanup_interval
        };
        if should_cleanup {
            self.cleanup();
        }
    }
}

/// Converts accumulated violations into temporary blocks.
///
/// Keeps the rolling per-subject violation tally in the counter store and
/// the block metadata in an in-process blocklist. A present, unexpired block
/// short-circuits all other gate logic for that subject.
pub struct EscalationManager {
    store: Arc<dyn CounterStore>,
    blocklist: Blocklist,
    config: EscalationConfig,
}

impl std::fmt::Debug for EscalationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationManager")
            .field("blocklist", &self.blocklist)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EscalationManager {
    /// Creates a manager over the given counter store.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, config: EscalationConfig) -> Self {
        Self {
            store,
            blocklist: Blocklist::new(),
            config,
        }
    }

    /// Returns the active block for a subject, if any.
    #[must_use]
    pub fn check_blocked(&self, subject: &Subject) -> Option<Block> {
        self.blocklist.get(&subject.to_string())
    }

    /// Records one violation against a subject. Returns the new block if
    /// this violation crossed the escalation threshold.
    ///
    /// A store outage here is logged and swallowed: losing one tally entry
    /// must never fail the request being denied.
    pub fn record_violation(&self, subject: &Subject, violation_type: &str) -> Option<Block> {
        if !self.config.enabled {
            return None;
        }

        let key = RateLimitKey::new(subject, Scope::Violations, VIOLATION_WINDOW_ID);
        let count = match self.store.add(&key, 1, self.config.violation_window) {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    subject = %subject,
                    error = %err,
                    "Violation tally unavailable, skipping escalation"
                );
                return None;
            }
        };

        debug!(
            subject = %subject,
            violation_type = %violation_type,
            count = count,
            threshold = self.config.violation_threshold,
            "Violation recorded"
        );

        if count < self.config.violation_threshold {
            return None;
        }

        let rendered = subject.to_string();
        let duration = self.block_duration_for(self.blocklist.block_count(&rendered));
        let reason = format!(
            "{count} violations within {}s (last: {violation_type})",
            self.config.violation_window.as_secs()
        );
        let block = self.blocklist.block(&rendered, &reason, duration);

        // Start the tally fresh so the next block requires a full round of
        // violations after this one expires.
        if let Err(err) = self.store.reset(&key) {
            warn!(subject = %subject, error = %err, "Failed to reset violation tally");
        }

        Some(block)
    }

    /// Block TTL for the next block: first offense gets the configured
    /// duration, repeat offenders get double, capped at the maximum.
    fn block_duration_for(&self, prior_blocks: u32) -> Duration {
        if prior_blocks == 0 {
            self.config.block_duration.min(self.config.max_block_duration)
        } else {
            (self.config.block_duration * 2).min(self.config.max_block_duration)
        }
    }

    /// Number of currently blocked subjects.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.blocklist.len()
    }

    /// Snapshot of all active blocks.
    #[must_use]
    pub fn list_blocked(&self) -> Vec<Block> {
        self.blocklist.list()
    }

    /// Removes expired blocks. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.blocklist.cleanup()
    }
}
