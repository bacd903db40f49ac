use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use docket_core::{CacheEntry, CacheRepository, NewCacheEntry, Result};

/// Stored entry plus lock-free hit accounting, so reads share the map lock.
struct Slot {
    entry: CacheEntry,
    hits: AtomicI64,
    last_hit_ms: AtomicI64,
}

impl Slot {
    fn view(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        entry.hit_count = self.hits.load(Ordering::Relaxed);
        let ms = self.last_hit_ms.load(Ordering::Relaxed);
        entry.last_hit_at = (ms > 0)
            .then(|| Utc.timestamp_millis_opt(ms).single())
            .flatten();
        entry
    }
}

type SlotKey = (String, String);

/// Tenant-scoped cache map. Cache writes are not ledger mutations, so this
/// store does not audit; the cache service records hits itself.
#[derive(Default)]
pub struct MemoryCacheRepository {
    slots: RwLock<HashMap<SlotKey, Arc<Slot>>>,
}

impl MemoryCacheRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheRepository for MemoryCacheRepository {
    async fn get(
        &self,
        tenant_id: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let slot = {
            let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
            slots.get(&(tenant_id.to_string(), key.to_string())).cloned()
        };
        let Some(slot) = slot else {
            return Ok(None);
        };
        if slot.entry.is_expired(now) {
            return Ok(None);
        }
        slot.hits.fetch_add(1, Ordering::Relaxed);
        slot.last_hit_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
        Ok(Some(slot.view()))
    }

    async fn put(&self, entry: NewCacheEntry) -> Result<CacheEntry> {
        let entry = entry.into_entry();
        let slot = Arc::new(Slot {
            entry: entry.clone(),
            hits: AtomicI64::new(0),
            last_hit_ms: AtomicI64::new(0),
        });
        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        slots.insert((entry.tenant_id.clone(), entry.key.clone()), slot);
        Ok(entry)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
        let before = slots.len();
        slots.retain(|_, s| !s.entry.is_expired(now));
        Ok((before - slots.len()) as u64)
    }
}
