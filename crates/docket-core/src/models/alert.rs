//! Security and operational alert models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;

/// Kind of alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    /// Repeated failed authentication for one actor.
    BruteForce,
    /// Origin/device churn for one actor.
    Anomaly,
    /// Job pipeline failure rate above threshold.
    ProcessingFailureRate,
    /// Raised by an administrator.
    Manual,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::BruteForce => "BRUTE_FORCE",
            AlertType::Anomaly => "ANOMALY",
            AlertType::ProcessingFailureRate => "PROCESSING_FAILURE_RATE",
            AlertType::Manual => "MANUAL",
        }
    }

    /// Operational alerts concern the pipeline, not an actor.
    pub fn is_operational(&self) -> bool {
        matches!(self, AlertType::ProcessingFailureRate)
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BRUTE_FORCE" => Ok(AlertType::BruteForce),
            "ANOMALY" => Ok(AlertType::Anomaly),
            "PROCESSING_FAILURE_RATE" => Ok(AlertType::ProcessingFailureRate),
            "MANUAL" => Ok(AlertType::Manual),
            other => Err(Error::InvalidInput(format!("Unknown alert type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(AlertSeverity::Low),
            "MEDIUM" => Ok(AlertSeverity::Medium),
            "HIGH" => Ok(AlertSeverity::High),
            "CRITICAL" => Ok(AlertSeverity::Critical),
            other => Err(Error::InvalidInput(format!("Unknown alert severity: {other}"))),
        }
    }
}

/// Review status of an alert. Resolution is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "OPEN",
            AlertStatus::Investigating => "INVESTIGATING",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::FalsePositive => "FALSE_POSITIVE",
        }
    }

    /// Still accepting new evidence.
    pub fn is_active(&self) -> bool {
        matches!(self, AlertStatus::Open | AlertStatus::Investigating)
    }

    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (Open, Investigating)
                | (Open, Resolved)
                | (Open, FalsePositive)
                | (Investigating, Resolved)
                | (Investigating, FalsePositive)
        )
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(AlertStatus::Open),
            "INVESTIGATING" => Ok(AlertStatus::Investigating),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            "FALSE_POSITIVE" => Ok(AlertStatus::FalsePositive),
            other => Err(Error::InvalidInput(format!("Unknown alert status: {other}"))),
        }
    }
}

/// A raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    /// Affected tenant. Operational alerts use the `system` scope.
    pub tenant_id: String,
    /// Affected actor, if the alert is actor-scoped.
    pub actor_id: Option<String>,
    /// Structured evidence sufficient to act without re-querying the log.
    pub evidence: JsonValue,
    pub evidence_count: i64,
    /// `type:tenant:actor:bucket` of the window that first raised it. A
    /// label for responders and log correlation; merging is decided by
    /// [`SecurityAlert::absorbs`], which follows activity past the bucket.
    pub dedup_key: String,
    pub status: AlertStatus,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolution_note: Option<String>,
}

impl SecurityAlert {
    /// New OPEN alert from a candidate.
    pub fn from_candidate(id: Uuid, c: &AlertCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id,
            alert_type: c.alert_type,
            severity: c.severity,
            tenant_id: c.tenant_id.clone(),
            actor_id: c.actor_id.clone(),
            evidence: c.evidence.clone(),
            evidence_count: c.evidence_count,
            dedup_key: c.dedup_key(),
            status: AlertStatus::Open,
            first_occurrence: c.first_occurrence,
            last_occurrence: c.last_occurrence,
            created_at: now,
            updated_at: now,
            resolution_note: None,
        }
    }

    /// Whether this active alert should absorb `c` instead of a new alert
    /// being raised. Manual alerts never merge.
    pub fn absorbs(&self, c: &AlertCandidate) -> bool {
        self.status.is_active()
            && self.alert_type != AlertType::Manual
            && self.alert_type == c.alert_type
            && self.tenant_id == c.tenant_id
            && self.actor_id == c.actor_id
            && c.last_occurrence - self.last_occurrence <= chrono::Duration::seconds(c.window_secs)
    }

    /// Fold newer evidence in. Returns false when nothing changed.
    pub fn absorb(&mut self, c: &AlertCandidate, now: DateTime<Utc>) -> bool {
        if c.last_occurrence <= self.last_occurrence && c.evidence_count <= self.evidence_count {
            return false;
        }
        self.last_occurrence = self.last_occurrence.max(c.last_occurrence);
        self.evidence_count = self.evidence_count.max(c.evidence_count);
        self.evidence = c.evidence.clone();
        self.severity = self.severity.max(c.severity);
        self.updated_at = now;
        true
    }

    /// Apply a review transition.
    pub fn review(&mut self, update: &AlertStatusUpdate, now: DateTime<Utc>) -> Result<(), Error> {
        if !self.status.can_transition_to(update.status) {
            return Err(Error::transition(self.status, update.status));
        }
        self.status = update.status;
        if update.note.is_some() {
            self.resolution_note = update.note.clone();
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn snapshot(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Alert proposed by a detector rule or an administrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCandidate {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub evidence: JsonValue,
    pub evidence_count: i64,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    /// Trailing window the rule evaluated; active alerts whose last
    /// occurrence falls inside it absorb the candidate.
    pub window_secs: i64,
}

impl AlertCandidate {
    /// `type:tenant:actor:bucket`, where bucket is the window-aligned start.
    pub fn dedup_key(&self) -> String {
        let window = self.window_secs.max(1);
        let bucket = self.first_occurrence.timestamp().div_euclid(window) * window;
        format!(
            "{}:{}:{}:{}",
            self.alert_type.as_str(),
            self.tenant_id,
            self.actor_id.as_deref().unwrap_or("-"),
            bucket
        )
    }
}

/// What an upsert did to the alert store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    /// An active alert absorbed newer evidence.
    Updated,
    /// The candidate carried nothing the active alert did not already have.
    Unchanged,
}

/// Alert status change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStatusUpdate {
    pub status: AlertStatus,
    #[serde(default)]
    pub note: Option<String>,
}

/// Alert listing filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertFilter {
    pub tenant_id: Option<String>,
    pub alert_type: Option<AlertType>,
    pub status: Option<AlertStatus>,
    pub actor_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AlertFilter {
    pub fn matches(&self, a: &SecurityAlert) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| *t == a.tenant_id)
            && self.alert_type.is_none_or(|t| t == a.alert_type)
            && self.status.is_none_or(|s| s == a.status)
            && self
                .actor_id
                .as_ref()
                .is_none_or(|x| a.actor_id.as_ref() == Some(x))
    }
}
