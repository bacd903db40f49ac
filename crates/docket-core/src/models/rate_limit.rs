//! Rate limiting models.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::defaults;

/// Geometric block escalation for repeat offenders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressivePenalty {
    /// Each violation within `period_secs` multiplies the block by this.
    pub multiplier: u32,
    /// Rolling period in which violations accumulate.
    pub period_secs: u64,
    /// Upper bound on any single block.
    pub max_block_secs: u64,
}

impl Default for ProgressivePenalty {
    fn default() -> Self {
        Self {
            multiplier: defaults::RATE_LIMIT_PENALTY_MULTIPLIER,
            period_secs: defaults::RATE_LIMIT_PENALTY_PERIOD_SECS,
            max_block_secs: defaults::RATE_LIMIT_MAX_BLOCK_SECS,
        }
    }
}

/// Limits applied to one (actor, endpoint) window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
    /// Block applied once the window overflows. Zero blocks until the
    /// window boundary.
    pub block_secs: u64,
    #[serde(default)]
    pub penalty: Option<ProgressivePenalty>,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_requests: defaults::RATE_LIMIT_REQUESTS,
            window_secs: defaults::RATE_LIMIT_WINDOW_SECS,
            block_secs: defaults::RATE_LIMIT_BLOCK_SECS,
            penalty: None,
        }
    }
}

/// A named limit scoped by endpoint pattern and optionally tenant and role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub name: String,
    /// Endpoint glob, `*` matches any run of characters (e.g. `jobs.*`).
    pub endpoint_pattern: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub limit: RateLimit,
}

impl RateLimitPolicy {
    /// Global fallback policy for every endpoint.
    pub fn global_default() -> Self {
        Self {
            name: "global-default".to_string(),
            endpoint_pattern: "*".to_string(),
            tenant_id: None,
            role: None,
            limit: RateLimit::default(),
        }
    }

    /// Whether the endpoint pattern matches `endpoint`.
    pub fn matches_endpoint(&self, endpoint: &str) -> bool {
        if !self.endpoint_pattern.contains('*') {
            return self.endpoint_pattern == endpoint;
        }
        let pattern = format!(
            "^{}$",
            regex::escape(&self.endpoint_pattern).replace(r"\*", ".*")
        );
        Regex::new(&pattern)
            .map(|re| re.is_match(endpoint))
            .unwrap_or(false)
    }

    /// Whether this policy applies to a caller.
    pub fn applies_to(&self, tenant_id: &str, role: Option<&str>, endpoint: &str) -> bool {
        self.tenant_id.as_deref().is_none_or(|t| t == tenant_id)
            && self.role.as_deref().is_none_or(|r| Some(r) == role)
            && self.matches_endpoint(endpoint)
    }

    /// Ordering key: higher wins. Scope first (tenant+role > tenant > role >
    /// global), then exact patterns over globs, then longer patterns.
    pub fn specificity(&self) -> (u8, bool, usize) {
        let scope = match (&self.tenant_id, &self.role) {
            (Some(_), Some(_)) => 3,
            (Some(_), None) => 2,
            (None, Some(_)) => 1,
            (None, None) => 0,
        };
        (
            scope,
            !self.endpoint_pattern.contains('*'),
            self.endpoint_pattern.len(),
        )
    }
}

/// Pick the most specific applicable policy.
pub fn select_policy<'a>(
    policies: &'a [RateLimitPolicy],
    tenant_id: &str,
    role: Option<&str>,
    endpoint: &str,
) -> Option<&'a RateLimitPolicy> {
    policies
        .iter()
        .filter(|p| p.applies_to(tenant_id, role, endpoint))
        .max_by_key(|p| p.specificity())
}

/// Identity of a counter window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    /// `actor:<tenant>:<actor>` or `tenant:<tenant>`.
    pub actor_key: String,
    pub endpoint: String,
    pub window_secs: i64,
}

impl WindowKey {
    pub fn new(actor_key: impl Into<String>, endpoint: impl Into<String>, window_secs: u64) -> Self {
        Self {
            actor_key: actor_key.into(),
            endpoint: endpoint.into(),
            window_secs: window_secs as i64,
        }
    }

    pub fn actor(tenant_id: &str, actor_id: &str, endpoint: &str, window_secs: u64) -> Self {
        Self::new(format!("actor:{tenant_id}:{actor_id}"), endpoint, window_secs)
    }

    pub fn tenant(tenant_id: &str, window_secs: u64) -> Self {
        Self::new(format!("tenant:{tenant_id}"), "*", window_secs)
    }

    pub fn display(&self) -> String {
        format!("{}|{}|{}", self.actor_key, self.endpoint, self.window_secs)
    }
}

/// Counter state for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub key: WindowKey,
    pub window_start: DateTime<Utc>,
    pub request_count: i64,
    pub blocked_until: Option<DateTime<Utc>>,
    /// Violations counted toward the progressive penalty.
    pub violation_count: i32,
    pub last_violation_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitWindow {
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|b| b > now)
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.window_start + chrono::Duration::seconds(self.key.window_secs)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateDecision {
    Allow { remaining: u32 },
    Deny { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allow { .. })
    }
}
