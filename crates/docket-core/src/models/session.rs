//! Front-door session models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An authenticated caller session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor_id: String,
    pub origin: Option<String>,
    pub device: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Session {
    /// Idle past `idle` or older than `absolute`.
    pub fn is_stale(&self, now: DateTime<Utc>, idle: Duration, absolute: Duration) -> bool {
        now - self.last_seen_at > idle || now - self.created_at > absolute
    }
}

/// Input for opening a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSession {
    #[serde(default)]
    pub device: Option<String>,
}
