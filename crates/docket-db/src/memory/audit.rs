//! In-process append-only audit log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docket_core::{
    defaults, new_v7, AuditEvent, AuditPage, AuditQuery, AuditRepository, Error, NewAuditEvent,
    Result,
};

use super::lock;

#[derive(Default)]
struct LogState {
    events: Vec<AuditEvent>,
    last_seq: i64,
}

/// Append-only event vector with a monotonic sequence.
///
/// Other in-process repositories call [`MemoryAuditLog::record`] while holding
/// their own lock, so an entity mutation and its event commit together.
#[derive(Default)]
pub struct MemoryAuditLog {
    state: Mutex<LogState>,
    fail_writes: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail (durability fault injection).
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Append one event. Callers apply their mutation only after this
    /// returns `Ok`.
    pub fn record(&self, event: NewAuditEvent, now: DateTime<Utc>) -> Result<AuditEvent> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::AuditWrite("audit log unavailable".to_string()));
        }
        let mut state = lock(&self.state);
        state.last_seq += 1;
        let event = event.into_event(new_v7(), state.last_seq, now);
        state.events.push(event.clone());
        Ok(event)
    }

    /// Snapshot of every retained event in sequence order.
    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.state).events.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditLog {
    async fn append(&self, event: NewAuditEvent, now: DateTime<Utc>) -> Result<AuditEvent> {
        self.record(event, now)
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage> {
        let limit = query
            .limit
            .unwrap_or(defaults::PAGE_LIMIT)
            .clamp(1, defaults::PAGE_LIMIT_MAX) as usize;
        let offset = query.offset.unwrap_or(0).max(0) as usize;

        let state = lock(&self.state);
        let matching: Vec<&AuditEvent> = state.events.iter().filter(|e| query.matches(e)).collect();
        let total = matching.len() as i64;
        let events = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(AuditPage { events, total })
    }

    async fn scan(
        &self,
        since: DateTime<Utc>,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let state = lock(&self.state);
        Ok(state
            .events
            .iter()
            .filter(|e| e.seq > after_seq && e.occurred_at >= since)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = lock(&self.state);
        let before = state.events.len();
        state.events.retain(|e| e.occurred_at >= cutoff);
        Ok((before - state.events.len()) as u64)
    }
}
