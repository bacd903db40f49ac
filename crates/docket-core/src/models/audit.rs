//! Audit trail models.
//!
//! Every mutation in the system appends exactly one [`AuditEvent`]. Events are
//! append-only, totally ordered by `seq`, and removed only by retention.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Actor id used for events produced by the system itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Entity type names.
pub mod entity {
    pub const JOB: &str = "job";
    pub const TENANT: &str = "tenant";
    pub const CACHE_ENTRY: &str = "cache_entry";
    pub const RATE_LIMIT_WINDOW: &str = "rate_limit_window";
    pub const ALERT: &str = "security_alert";
    pub const SESSION: &str = "session";
    pub const CONFIG: &str = "config";
    pub const AUTH: &str = "auth";
    pub const RETENTION: &str = "retention";
}

/// Custom action names.
pub mod action {
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const LOGIN_SUCCEEDED: &str = "login_succeeded";
    pub const CACHE_HIT: &str = "cache_hit";
    pub const BLOCKED: &str = "blocked";
    pub const PURGE: &str = "purge";
    pub const ARCHIVE: &str = "archive";
}

/// Kind of mutation an event describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    /// Domain-specific action (e.g. `login_failed`, `cache_hit`).
    Custom(String),
}

impl AuditAction {
    pub fn custom(name: impl Into<String>) -> Self {
        AuditAction::Custom(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Custom(name) => name,
        }
    }
}

impl From<String> for AuditAction {
    fn from(s: String) -> Self {
        match s.as_str() {
            "CREATE" => AuditAction::Create,
            "UPDATE" => AuditAction::Update,
            "DELETE" => AuditAction::Delete,
            _ => AuditAction::Custom(s),
        }
    }
}

impl From<AuditAction> for String {
    fn from(a: AuditAction) -> Self {
        a.as_str().to_string()
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Some(Severity::Info),
            "WARNING" => Some(Severity::Warning),
            "ERROR" => Some(Severity::Error),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Functional area an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    Job,
    Cache,
    RateLimit,
    Security,
    Authentication,
    Configuration,
    Session,
    System,
    /// Reported by an external collaborator without a built-in meaning.
    External,
}

impl AuditCategory {
    /// Categories an external reporter may write. Everything else is
    /// produced only by docket's own mutations.
    pub fn is_externally_reportable(&self) -> bool {
        matches!(self, AuditCategory::Authentication | AuditCategory::External)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Job => "JOB",
            AuditCategory::Cache => "CACHE",
            AuditCategory::RateLimit => "RATE_LIMIT",
            AuditCategory::Security => "SECURITY",
            AuditCategory::Authentication => "AUTHENTICATION",
            AuditCategory::Configuration => "CONFIGURATION",
            AuditCategory::Session => "SESSION",
            AuditCategory::System => "SYSTEM",
            AuditCategory::External => "EXTERNAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "JOB" => Some(AuditCategory::Job),
            "CACHE" => Some(AuditCategory::Cache),
            "RATE_LIMIT" => Some(AuditCategory::RateLimit),
            "SECURITY" => Some(AuditCategory::Security),
            "AUTHENTICATION" => Some(AuditCategory::Authentication),
            "CONFIGURATION" => Some(AuditCategory::Configuration),
            "SESSION" => Some(AuditCategory::Session),
            "SYSTEM" => Some(AuditCategory::System),
            "EXTERNAL" => Some(AuditCategory::External),
            _ => None,
        }
    }
}

/// An event waiting to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub tenant_id: String,
    pub actor_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub severity: Severity,
    pub category: AuditCategory,
    /// Network origin of the triggering request, if known.
    pub origin: Option<String>,
    pub device: Option<String>,
    pub metadata: Option<JsonValue>,
}

impl NewAuditEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        actor_id: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: AuditAction,
        category: AuditCategory,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            before: None,
            after: None,
            severity: Severity::Info,
            category,
            origin: None,
            device: None,
            metadata: None,
        }
    }

    pub fn with_before(mut self, before: JsonValue) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: JsonValue) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Materialize the event with its identity and position in the log.
    pub fn into_event(self, id: Uuid, seq: i64, occurred_at: DateTime<Utc>) -> AuditEvent {
        let changed_fields = diff_fields(self.before.as_ref(), self.after.as_ref());
        AuditEvent {
            id,
            seq,
            tenant_id: self.tenant_id,
            actor_id: self.actor_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action: self.action,
            before: self.before,
            after: self.after,
            changed_fields,
            severity: self.severity,
            category: self.category,
            origin: self.origin,
            device: self.device,
            metadata: self.metadata,
            occurred_at,
        }
    }
}

/// An immutable, sequenced audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Monotonic position in the log.
    pub seq: i64,
    pub tenant_id: String,
    pub actor_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub before: Option<JsonValue>,
    pub after: Option<JsonValue>,
    pub changed_fields: Vec<String>,
    pub severity: Severity,
    pub category: AuditCategory,
    pub origin: Option<String>,
    pub device: Option<String>,
    pub metadata: Option<JsonValue>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Calendar date (UTC) of the event.
    pub fn date(&self) -> NaiveDate {
        self.occurred_at.date_naive()
    }

    /// Event time truncated to the hour.
    pub fn hour_bucket(&self) -> DateTime<Utc> {
        self.occurred_at
            .duration_trunc(TimeDelta::hours(1))
            .unwrap_or(self.occurred_at)
    }

    /// Read a string field from the `after` snapshot.
    pub fn after_str(&self, field: &str) -> Option<&str> {
        self.after.as_ref()?.get(field)?.as_str()
    }

    /// Read a string field from the `before` snapshot.
    pub fn before_str(&self, field: &str) -> Option<&str> {
        self.before.as_ref()?.get(field)?.as_str()
    }
}

/// Top-level keys whose values differ between two JSON snapshots.
///
/// A missing or non-object snapshot is treated as empty, so a CREATE lists
/// every key of `after` and a DELETE every key of `before`.
pub fn diff_fields(before: Option<&JsonValue>, after: Option<&JsonValue>) -> Vec<String> {
    let empty = serde_json::Map::new();
    let b = before.and_then(JsonValue::as_object).unwrap_or(&empty);
    let a = after.and_then(JsonValue::as_object).unwrap_or(&empty);

    let keys: BTreeSet<&String> = b.keys().chain(a.keys()).collect();
    keys.into_iter()
        .filter(|k| b.get(*k) != a.get(*k))
        .cloned()
        .collect()
}

/// Audit query filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub tenant_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub actor_id: Option<String>,
    pub category: Option<AuditCategory>,
    pub action: Option<String>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQuery {
    /// Whether an event satisfies every filter (pagination excluded).
    pub fn matches(&self, e: &AuditEvent) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| *t == e.tenant_id)
            && self.entity_type.as_ref().is_none_or(|t| *t == e.entity_type)
            && self.entity_id.as_ref().is_none_or(|i| *i == e.entity_id)
            && self.actor_id.as_ref().is_none_or(|a| *a == e.actor_id)
            && self.category.is_none_or(|c| c == e.category)
            && self.action.as_deref().is_none_or(|a| a == e.action.as_str())
            && self.min_severity.is_none_or(|s| e.severity >= s)
            && self.since.is_none_or(|s| e.occurred_at >= s)
            && self.until.is_none_or(|u| e.occurred_at < u)
    }
}

/// One page of audit results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    /// Total matching events, ignoring pagination.
    pub total: i64,
}
