//! Request descriptors consumed by the gate.
//!
//! The surrounding request pipeline builds a [`RequestDescriptor`] once per
//! inbound request (subject identity, resolved role, normalized action
//! category, raw input values) and hands it to the gate before invoking the
//! protected handler.

use std::fmt;
use std::net::IpAddr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The identity a counter is tracked against.
///
/// Renders as `user:<id>` or `ip:<addr>`, which is also the form used in
/// counter keys, block entries, and audit events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Subject {
    /// An authenticated user (student id, staff id, or login email).
    User(String),
    /// An unauthenticated peer identified by source address.
    Ip(IpAddr),
}

impl Subject {
    /// Creates a user subject.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }

    /// Creates an IP subject.
    #[must_use]
    pub const fn ip(addr: IpAddr) -> Self {
        Self::Ip(addr)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Role resolved by the identity layer before the gate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System administrator.
    Admin,
    /// Hostel/office staff.
    Staff,
    /// Regular student account.
    Student,
    /// Unauthenticated or provisional account.
    Guest,
}

impl Role {
    /// Returns the string representation of this role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Student => "student",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized action category, derived from the request route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// General API traffic (default).
    Api,
    /// Login and credential endpoints.
    Login,
    /// File/report downloads (bandwidth-accounted).
    Download,
    /// File uploads.
    Upload,
    /// Account creation (critical).
    AccountCreation,
    /// Bulk grade/attendance writes (critical).
    BulkWrite,
    /// Backup/export operations (critical).
    Backup,
}

impl ActionCategory {
    /// Returns the string representation of this category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Login => "login",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::AccountCreation => "account_creation",
            Self::BulkWrite => "bulk_write",
            Self::Backup => "backup",
        }
    }

    /// Whether this category carries the stricter critical-operation overlay.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::AccountCreation | Self::BulkWrite | Self::Backup)
    }

    /// Whether responses in this category are bandwidth-accounted.
    #[must_use]
    pub const fn is_download(&self) -> bool {
        matches!(self, Self::Download)
    }
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Content class of a transfer, used to scale limits and bandwidth quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentClass {
    /// Plain documents (PDF, office, text).
    Document,
    /// Images.
    Image,
    /// Audio streams/files.
    Audio,
    /// Video streams/files.
    Video,
    /// Archives (zip, tar).
    Archive,
    /// Anything else.
    Other,
}

impl ContentClass {
    /// Derives a content class from a MIME type.
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else if mime.starts_with("image/") {
            Self::Image
        } else if mime.contains("zip") || mime.contains("tar") || mime.contains("compressed") {
            Self::Archive
        } else if mime.starts_with("text/")
            || mime.contains("pdf")
            || mime.contains("msword")
            || mime.contains("officedocument")
            || mime.contains("json")
        {
            Self::Document
        } else {
            Self::Other
        }
    }

    /// Returns the string representation of this content class.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Archive => "archive",
            Self::Other => "other",
        }
    }
}

/// A single route classification rule.
///
/// Pattern syntax: a trailing `*` makes it a prefix match, a leading `^`
/// makes it a regular expression, anything else is an exact path match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path pattern.
    pub pattern: String,
    /// Category assigned on match.
    pub category: ActionCategory,
}

impl RouteRule {
    /// Creates a new route rule.
    #[must_use]
    pub fn new(pattern: impl Into<String>, category: ActionCategory) -> Self {
        Self {
            pattern: pattern.into(),
            category,
        }
    }
}

/// Compiled form of a route pattern.
#[derive(Debug)]
enum CompiledPattern {
    Exact(String),
    Prefix(String),
    Pattern(Regex),
}

impl CompiledPattern {
    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => p == path,
            Self::Prefix(p) => path.starts_with(p.as_str()),
            Self::Pattern(re) => re.is_match(path),
        }
    }
}

/// Ordered route-to-category classifier, compiled once at startup.
///
/// Rules are evaluated top to bottom; the first match wins, and unmatched
/// paths fall through to [`ActionCategory::Api`].
#[derive(Debug)]
pub struct RouteClassifier {
    rules: Vec<(CompiledPattern, ActionCategory)>,
}

impl RouteClassifier {
    /// Compiles an ordered rule table.
    ///
    /// Rules with invalid regex patterns are skipped with a warning rather
    /// than failing startup.
    #[must_use]
    pub fn from_rules(rules: &[RouteRule]) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = if let Some(prefix) = rule.pattern.strip_suffix('*') {
                CompiledPattern::Prefix(prefix.to_string())
            } else if rule.pattern.starts_with('^') {
                match Regex::new(&rule.pattern) {
                    Ok(re) => CompiledPattern::Pattern(re),
                    Err(e) => {
                        tracing::warn!(pattern = %rule.pattern, error = %e, "Skipping invalid route pattern");
                        continue;
                    }
                }
            } else {
                CompiledPattern::Exact(rule.pattern.clone())
            };
            compiled.push((pattern, rule.category));
        }
        Self { rules: compiled }
    }

    /// Default classification table for the hostel/asset backend.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_rules(&default_route_rules())
    }

    /// Classifies a request path. Evaluated once per request.
    #[must_use]
    pub fn classify(&self, path: &str) -> ActionCategory {
        for (pattern, category) in &self.rules {
            if pattern.matches(path) {
                debug!(path = %path, category = %category, "Route classified");
                return *category;
            }
        }
        ActionCategory::Api
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Default ordered route rules.
#[must_use]
pub fn default_route_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::new("/auth/login", ActionCategory::Login),
        RouteRule::new("/auth/*", ActionCategory::Login),
        RouteRule::new("/accounts/new", ActionCategory::AccountCreation),
        RouteRule::new("/students/register", ActionCategory::AccountCreation),
        RouteRule::new(r"^/(grades|attendance)/bulk", ActionCategory::BulkWrite),
        RouteRule::new("/admin/backup*", ActionCategory::Backup),
        RouteRule::new(r"^/(files|downloads|reports/export)(/|$)", ActionCategory::Download),
        RouteRule::new("/uploads/*", ActionCategory::Upload),
    ]
}

/// Everything the gate needs to know about one inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Primary subject (authenticated user, or the peer IP).
    pub subject: Subject,
    /// Source address, when known. Tracked separately from `subject` so
    /// login endpoints can limit both the credential and the peer.
    pub ip: Option<IpAddr>,
    /// Resolved role.
    pub role: Role,
    /// HTTP method.
    pub method: String,
    /// Normalized request path.
    pub path: String,
    /// Action category (route classification result).
    pub category: ActionCategory,
    /// Content class of the requested resource, when known up front.
    pub content_class: Option<ContentClass>,
    /// User agent header, if present.
    pub user_agent: Option<String>,
    /// Header values to scan (name, value).
    pub headers: Vec<(String, String)>,
    /// Flattened input values to scan (key, value). Nested structures are
    /// flattened by the pipeline before they reach the gate.
    pub inputs: Vec<(String, String)>,
}

impl RequestDescriptor {
    /// Creates a descriptor with the given identity and route, classified
    /// against the supplied table.
    #[must_use]
    pub fn new(
        subject: Subject,
        role: Role,
        method: impl Into<String>,
        path: impl Into<String>,
        classifier: &RouteClassifier,
    ) -> Self {
        let path = path.into();
        let category = classifier.classify(&path);
        Self {
            subject,
            ip: None,
            role,
            method: method.into(),
            path,
            category,
            content_class: None,
            user_agent: None,
            headers: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Sets the source address.
    #[must_use]
    pub const fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Sets the content class.
    #[must_use]
    pub const fn with_content_class(mut self, class: ContentClass) -> Self {
        self.content_class = Some(class);
        self
    }

    /// Sets the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Adds a header to scan.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds an input value to scan.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.push((key.into(), value.into()));
        self
    }

    /// Overrides the classified category.
    #[must_use]
    pub const fn with_category(mut self, category: ActionCategory) -> Self {
        self.category = category;
        self
    }

    /// The IP rendered as a secondary subject, when present.
    #[must_use]
    pub fn ip_subject(&self) -> Option<Subject> {
        self.ip.map(Subject::Ip)
    }
}

/// Response metadata handed to the gate's post-flight commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Total response size in bytes.
    pub bytes: u64,
    /// Content class of the response body, when known. Authoritative over
    /// the class the request declared when attributing bandwidth usage.
    pub content_class: Option<ContentClass>,
}

impl ResponseMeta {
    /// Creates response metadata.
    #[must_use]
    pub const fn new(bytes: u64) -> Self {
        Self {
            bytes,
            content_class: None,
        }
    }

    /// Sets the content class.
    #[must_use]
    pub const fn with_content_class(mut self, class: ContentClass) -> Self {
        self.content_class = Some(class);
        self
    }
}
