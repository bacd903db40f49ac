use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use docket_core::{changes, new_v7, Error, Result, Session, SessionRepository};

use super::{lock, MemoryAuditLog};

pub struct MemorySessionRepository {
    sessions: Mutex<HashMap<Uuid, Session>>,
    audit: Arc<MemoryAuditLog>,
}

impl MemorySessionRepository {
    pub fn new(audit: Arc<MemoryAuditLog>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            audit,
        }
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(
        &self,
        tenant_id: &str,
        actor_id: &str,
        origin: Option<&str>,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let session = Session {
            id: new_v7(),
            tenant_id: tenant_id.to_string(),
            actor_id: actor_id.to_string(),
            origin: origin.map(str::to_string),
            device: device.map(str::to_string),
            created_at: now,
            last_seen_at: now,
        };
        let mut sessions = lock(&self.sessions);
        self.audit.record(changes::session_opened(&session), now)?;
        sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn touch(&self, tenant_id: &str, session_id: Uuid, now: DateTime<Utc>) -> Result<Session> {
        let mut sessions = lock(&self.sessions);
        let before = sessions
            .get(&session_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let mut after = before.clone();
        after.last_seen_at = now;
        self.audit.record(changes::session_touched(&before, &after), now)?;
        sessions.insert(session_id, after.clone());
        Ok(after)
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(lock(&self.sessions).get(&session_id).cloned())
    }

    async fn purge_stale(
        &self,
        idle_before: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, s| s.last_seen_at >= idle_before && s.created_at >= created_before);
        Ok((before - sessions.len()) as u64)
    }
}
