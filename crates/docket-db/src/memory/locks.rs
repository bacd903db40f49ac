use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use docket_core::{LeaderLock, Result};

use super::lock;

/// Named leases: `name → (holder, expires_at)`.
#[derive(Default)]
pub struct MemoryLeaderLock {
    leases: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryLeaderLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaderLock for MemoryLeaderLock {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = lock(&self.leases);
        if let Some((current, expires)) = leases.get(name) {
            if current != holder && *expires > now {
                return Ok(false);
            }
        }
        leases.insert(name.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = lock(&self.leases);
        if leases.get(name).is_some_and(|(h, _)| h == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_holder_waits_for_expiry() {
        let locks = MemoryLeaderLock::new();
        let now = Utc::now();
        let ttl = Duration::seconds(60);
        assert!(locks.try_acquire("sweep", "a", ttl, now).await.unwrap());
        assert!(!locks.try_acquire("sweep", "b", ttl, now).await.unwrap());
        assert!(locks.try_acquire("sweep", "a", ttl, now).await.unwrap());
        assert!(locks
            .try_acquire("sweep", "b", ttl, now + Duration::seconds(61))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_ignored() {
        let locks = MemoryLeaderLock::new();
        let now = Utc::now();
        let ttl = Duration::seconds(60);
        locks.try_acquire("sweep", "a", ttl, now).await.unwrap();
        locks.release("sweep", "b").await.unwrap();
        assert!(!locks.try_acquire("sweep", "b", ttl, now).await.unwrap());
        locks.release("sweep", "a").await.unwrap();
        assert!(locks.try_acquire("sweep", "b", ttl, now).await.unwrap());
    }
}
