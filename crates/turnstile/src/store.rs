//! Atomic increment-with-expiry counters over a shared key space.
//!
//! Every mutable piece of gate state (scope counters, violation tallies,
//! bandwidth ledgers) lives behind the [`CounterStore`] trait. The store's
//! operations are the only way shared counters are mutated; there is no ad
//! hoc read-modify-write anywhere in the crate.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::descriptor::Subject;

/// A dimension along which a counter is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Per-subject, per-endpoint (most specific).
    Endpoint,
    /// Per-subject across all endpoints, role based.
    RoleGlobal,
    /// Per-endpoint across all subjects (system overload protection).
    SystemGlobal,
    /// Short-window burst counter.
    Burst,
    /// Critical-operation overlay.
    Critical,
    /// Rolling violation tally (escalation manager's key space).
    Violations,
    /// Hourly byte ledger (bandwidth accountant's key space).
    Bandwidth,
}

impl Scope {
    /// Returns the string representation of this scope.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint",
            Self::RoleGlobal => "role_global",
            Self::SystemGlobal => "system_global",
            Self::Burst => "burst",
            Self::Critical => "critical",
            Self::Violations => "violations",
            Self::Bandwidth => "bandwidth",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Composite key identifying exactly one live counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    /// Rendered subject (`user:<id>`, `ip:<addr>`, or `system`).
    pub subject: String,
    /// Counter scope.
    pub scope: Scope,
    /// Window discriminator (endpoint path, role name, or category).
    pub window_id: String,
}

impl RateLimitKey {
    /// Creates a key for a subject-scoped counter.
    #[must_use]
    pub fn new(subject: &Subject, scope: Scope, window_id: impl Into<String>) -> Self {
        Self {
            subject: subject.to_string(),
            scope,
            window_id: window_id.into(),
        }
    }

    /// Creates a key in the system-wide key space (no subject dimension).
    #[must_use]
    pub fn system(scope: Scope, window_id: impl Into<String>) -> Self {
        Self {
            subject: "system".to_string(),
            scope,
            window_id: window_id.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.subject, self.scope, self.window_id)
    }
}

/// Errors from the counter store backing.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying store is unreachable. Callers fail open.
    #[error("counter store unavailable during {operation}")]
    Unavailable {
        /// The operation that failed.
        operation: &'static str,
    },
}

/// Result of an atomic increment-then-compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementOutcome {
    /// Whether the increment stayed within the limit.
    pub allowed: bool,
    /// Count after the operation (not incremented when denied).
    pub count: u64,
    /// Time until the window resets (zero when allowed).
    pub retry_after: Duration,
}

/// Atomic increment-with-expiry primitive.
///
/// `try_increment` must be a single atomic operation under concurrent
/// callers sharing a key; this is the one hard correctness requirement of
/// the subsystem.
pub trait CounterStore: Send + Sync {
    /// Atomically increments the counter if it is below `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store is down.
    fn try_increment(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: Duration,
    ) -> Result<IncrementOutcome, StoreError>;

    /// Atomically adds `amount` to the counter, creating it with the given
    /// window on first use. Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store is down.
    fn add(&self, key: &RateLimitKey, amount: u64, window: Duration) -> Result<u64, StoreError>;

    /// Reads the current count without mutating anything.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store is down.
    fn peek(&self, key: &RateLimitKey) -> Result<u64, StoreError>;

    /// Time until the counter's window resets, if one is live.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store is down.
    fn remaining_window(&self, key: &RateLimitKey) -> Result<Option<Duration>, StoreError>;

    /// Deletes the counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store is down.
    fn reset(&self, key: &RateLimitKey) -> Result<(), StoreError>;
}

/// One live windowed counter.
#[derive(Debug)]
struct WindowedCounter {
    count: u64,
    window_start: Instant,
    window: Duration,
}

impl WindowedCounter {
    fn new(window: Duration) -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            window,
        }
    }

    fn is_expired(&self) -> bool {
        self.window_start.elapsed() >= self.window
    }

    /// Restarts the window if it has elapsed. At most one live counter per
    /// key: an expired counter is replaced, never read.
    fn roll_if_expired(&mut self, window: Duration) {
        if self.is_expired() {
            self.count = 0;
            self.window_start = Instant::now();
            self.window = window;
        }
    }

    fn remaining(&self) -> Duration {
        self.window.saturating_sub(self.window_start.elapsed())
    }
}

/// In-process counter store backed by a lock-protected map.
///
/// Expiry is passive: counters roll over lazily on access, and a periodic
/// sweep removes keys nobody touches anymore.
pub struct MemoryCounterStore {
    counters: RwLock<HashMap<RateLimitKey, WindowedCounter>>,
    last_sweep: RwLock<Instant>,
    sweep_interval: Duration,
}

impl MemoryCounterStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            last_sweep: RwLock::new(Instant::now()),
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Number of live keys (including not-yet-swept expired ones).
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.counters.read().len()
    }

    /// Removes all counters.
    pub fn clear(&self) {
        self.counters.write().clear();
    }

    /// Removes expired counters. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|_, c| !c.is_expired());
        let removed = before.saturating_sub(counters.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired counters");
        }
        *self.last_sweep.write() = Instant::now();
        removed
    }

    fn maybe_sweep(&self) {
        let due = self.last_sweep.read().elapsed() >= self.sweep_interval;
        if due {
            self.sweep_expired();
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

impl CounterStore for MemoryCounterStore {
    fn try_increment(
        &self,
        key: &RateLimitKey,
        limit: u64,
        window: Duration,
    ) -> Result<IncrementOutcome, StoreError> {
        self.maybe_sweep();
        let mut counters = self.counters.write();
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| WindowedCounter::new(window));
        counter.roll_if_expired(window);

        if counter.count < limit {
            counter.count += 1;
            Ok(IncrementOutcome {
                allowed: true,
                count: counter.count,
                retry_after: Duration::ZERO,
            })
        } else {
            Ok(IncrementOutcome {
                allowed: false,
                count: counter.count,
                retry_after: counter.remaining(),
            })
        }
    }

    fn add(&self, key: &RateLimitKey, amount: u64, window: Duration) -> Result<u64, StoreError> {
        self.maybe_sweep();
        let mut counters = self.counters.write();
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| WindowedCounter::new(window));
        counter.roll_if_expired(window);
        counter.count = counter.count.saturating_add(amount);
        Ok(counter.count)
    }

    fn peek(&self, key: &RateLimitKey) -> Result<u64, StoreError> {
        let counters = self.counters.read();
        Ok(counters
            .get(key)
            .filter(|c| !c.is_expired())
            .map_or(0, |c| c.count))
    }

    fn remaining_window(&self, key: &RateLimitKey) -> Result<Option<Duration>, StoreError> {
        let counters = self.counters.read();
        Ok(counters
            .get(key)
            .filter(|c| !c.is_expired())
            .map(WindowedCounter::remaining))
    }

    fn reset(&self, key: &RateLimitKey) -> Result<(), StoreError> {
        self.counters.write().remove(key);
        Ok(())
    }
}
