//! Abuse detection: signature matching and rapid-repetition heuristics.
//!
//! Signature scanning is stateless and runs against the request's textual
//! surface (path, user agent, header values, all input values). The
//! repetition heuristic is the only stateful part and keeps its own
//! short sliding windows per (subject, submission fingerprint).

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::config::AbuseConfig;
use crate::descriptor::RequestDescriptor;
use crate::error::{GateError, GateResult};

/// Signature family that matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// SQL keyword/operator combinations.
    SqlInjection,
    /// Script/markup injection.
    ScriptInjection,
    /// Directory traversal sequences.
    PathTraversal,
    /// Shell metacharacter chains.
    CommandInjection,
    /// Known scanner/attack-tool user agents.
    MaliciousAgent,
    /// Rapid identical submissions (not a signature, same decision type).
    RapidRepetition,
}

impl SignatureKind {
    /// Returns the string representation of this signature family.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SqlInjection => "sql_injection",
            Self::ScriptInjection => "script_injection",
            Self::PathTraversal => "path_traversal",
            Self::CommandInjection => "command_injection",
            Self::MaliciousAgent => "malicious_agent",
            Self::RapidRepetition => "rapid_repetition",
        }
    }
}

/// A signature hit: which family, where, and the offending fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    /// Signature family.
    pub kind: SignatureKind,
    /// Location of the match (`path`, `user_agent`, `header:<name>`,
    /// `input:<key>`).
    pub location: String,
    /// Matched fragment, truncated for logging.
    pub fragment: String,
}

/// Compiled signature tables, built once per process.
static SIGNATURES: Lazy<Vec<(SignatureKind, Regex)>> = Lazy::new(|| {
    let table: &[(SignatureKind, &str)] = &[
        // SQL keyword/operator combinations
        (
            SignatureKind::SqlInjection,
            r"(?i)\b(union\s+(all\s+)?select|select\s+[\w\*,\s]+\s+from|insert\s+into|drop\s+table|truncate\s+table|delete\s+from)\b",
        ),
        (
            SignatureKind::SqlInjection,
            r#"(?i)('|%27)\s*(or|and)\s+[\w'"]+\s*(=|like|<|>)"#,
        ),
        (SignatureKind::SqlInjection, r"(?i);\s*(drop|delete|truncate|shutdown)\b"),
        (
            SignatureKind::SqlInjection,
            r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(|(?i)waitfor\s+delay",
        ),
        (SignatureKind::SqlInjection, r"(?i)\b(or|and)\s+\d+\s*=\s*\d+"),
        // Script/markup injection
        (SignatureKind::ScriptInjection, r"(?i)<\s*script"),
        (SignatureKind::ScriptInjection, r"(?i)javascript\s*:"),
        (
            SignatureKind::ScriptInjection,
            r"(?i)\bon(error|load|click|mouseover|focus)\s*=",
        ),
        (SignatureKind::ScriptInjection, r"(?i)<\s*(iframe|object|embed|svg)\b"),
        (SignatureKind::ScriptInjection, r"(?i)(document\.cookie|\beval\s*\()"),
        // Path traversal
        (SignatureKind::PathTraversal, r"\.\.[/\\]"),
        (SignatureKind::PathTraversal, r"(?i)%2e%2e(%2f|%5c|/)"),
        (
            SignatureKind::PathTraversal,
            r"(?i)(/etc/passwd|/etc/shadow|boot\.ini|win\.ini)",
        ),
        // Command-injection metacharacters
        (
            SignatureKind::CommandInjection,
            r"[;&|`]\s*(cat|ls|rm|wget|curl|nc|bash|sh|ping|powershell|cmd)\b",
        ),
        (SignatureKind::CommandInjection, r"\$\([^)]*\)"),
        (
            SignatureKind::CommandInjection,
            r"(\|\||&&)\s*(rm|curl|wget|nc)\b",
        ),
    ];

    table
        .iter()
        .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (*kind, re)))
        .collect()
});

/// Known scanner and attack-tool user-agent substrings (lowercase).
const MALICIOUS_AGENTS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "metasploit",
    "dirbuster",
    "gobuster",
    "wpscan",
    "hydra",
    "acunetix",
    "burpsuite",
];

const MAX_FRAGMENT_LEN: usize = 80;

fn truncate_fragment(text: &str) -> String {
    if text.len() <= MAX_FRAGMENT_LEN {
        text.to_string()
    } else {
        let mut end = MAX_FRAGMENT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

/// Matches one text value against every signature family.
fn match_signatures(text: &str, location: &str) -> Option<ScanMatch> {
    for (kind, regex) in SIGNATURES.iter() {
        if let Some(found) = regex.find(text) {
            return Some(ScanMatch {
                kind: *kind,
                location: location.to_string(),
                fragment: truncate_fragment(found.as_str()),
            });
        }
    }
    None
}

/// Sliding window of submission timestamps for one fingerprint.
#[derive(Debug)]
struct RepeatWindow {
    timestamps: VecDeque<Instant>,
}

impl RepeatWindow {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }

    /// Records one submission and returns the count inside the window.
    fn record(&mut self, window: Duration) -> u64 {
        let now = Instant::now();
        while self
            .timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);
        self.timestamps.len() as u64
    }

    fn is_stale(&self, window: Duration) -> bool {
        self.timestamps
            .back()
            .is_none_or(|t| t.elapsed() >= window)
    }
}

/// Stateless signature matching plus the rapid-repetition heuristic.
#[derive(Debug)]
pub struct AbuseDetector {
    config: AbuseConfig,
    repeats: RwLock<HashMap<u64, RepeatWindow>>,
}

impl AbuseDetector {
    /// Creates a detector from configuration.
    #[must_use]
    pub fn new(config: AbuseConfig) -> Self {
        Self {
            config,
            repeats: RwLock::new(HashMap::new()),
        }
    }

    /// Scans the request's textual surface against all signature families.
    ///
    /// Purely read-only; matching is independent of any counter state.
    #[must_use]
    pub fn scan(&self, descriptor: &RequestDescriptor) -> Option<ScanMatch> {
        if !self.config.signatures_enabled {
            return None;
        }

        if let Some(hit) = match_signatures(&descriptor.path, "path") {
            return Some(hit);
        }

        if let Some(agent) = &descriptor.user_agent {
            let lowered = agent.to_ascii_lowercase();
            for needle in MALICIOUS_AGENTS {
                if lowered.contains(needle) {
                    return Some(ScanMatch {
                        kind: SignatureKind::MaliciousAgent,
                        location: "user_agent".to_string(),
                        fragment: truncate_fragment(agent),
                    });
                }
            }
            if let Some(hit) = match_signatures(agent, "user_agent") {
                return Some(hit);
            }
        }

        for (name, value) in &descriptor.headers {
            if let Some(hit) = match_signatures(value, &format!("header:{name}")) {
                return Some(hit);
            }
        }

        for (key, value) in &descriptor.inputs {
            if let Some(hit) = match_signatures(value, &format!("input:{key}")) {
                return Some(hit);
            }
        }

        None
    }

    /// Records a submission and reports whether the subject exceeded the
    /// identical-submission threshold inside the repeat window.
    #[must_use]
    pub fn record_repetition(&self, descriptor: &RequestDescriptor) -> bool {
        if self.config.max_repeats == 0 {
            return false;
        }

        let fingerprint = Self::fingerprint(descriptor);
        let mut repeats = self.repeats.write();
        let count = repeats
            .entry(fingerprint)
            .or_insert_with(RepeatWindow::new)
            .record(self.config.repeat_window);

        if count >= self.config.max_repeats {
            debug!(
                subject = %descriptor.subject,
                path = %descriptor.path,
                count = count,
                "Rapid repetition detected"
            );
            true
        } else {
            false
        }
    }

    /// Full inspection: signature scan, then the repetition heuristic.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::SuspiciousActivity`] on any hit.
    pub fn inspect(&self, descriptor: &RequestDescriptor) -> GateResult<()> {
        if let Some(hit) = self.scan(descriptor) {
            return Err(GateError::SuspiciousActivity {
                subject: descriptor.subject.to_string(),
                signature: hit.kind.as_str().to_string(),
                location: hit.location,
                fragment: hit.fragment,
            });
        }

        if self.record_repetition(descriptor) {
            return Err(GateError::SuspiciousActivity {
                subject: descriptor.subject.to_string(),
                signature: SignatureKind::RapidRepetition.as_str().to_string(),
                location: format!("path:{}", descriptor.path),
                fragment: truncate_fragment(&descriptor.path),
            });
        }

        Ok(())
    }

    /// Removes stale repetition windows. Returns the number removed.
    pub fn cleanup_stale(&self) -> usize {
        let mut repeats = self.repeats.write();
        let before = repeats.len();
        let window = self.config.repeat_window;
        repeats.retain(|_, w| !w.is_stale(window));
        before.saturating_sub(repeats.len())
    }

    /// Number of tracked submission fingerprints.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.repeats.read().len()
    }

    /// Hash of (subject, method, path, normalized inputs). Two requests
    /// with the same fingerprint count as identical submissions.
    fn fingerprint(descriptor: &RequestDescriptor) -> u64 {
        let mut hasher = DefaultHasher::new();
        descriptor.subject.to_string().hash(&mut hasher);
        descriptor.method.hash(&mut hasher);
        descriptor.path.hash(&mut hasher);

        let mut inputs = descriptor.inputs.clone();
        inputs.sort();
        inputs.hash(&mut hasher);

        hasher.finish()
    }
}
