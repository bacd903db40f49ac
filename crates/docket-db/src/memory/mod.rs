//! In-process storage backend.
//!
//! Every repository keeps its entities behind a `std::sync::Mutex` and writes
//! audit events through a shared [`MemoryAuditLog`] while still holding the
//! entity lock, so lock order is always entity → audit log. No lock is held
//! across an `.await`.

mod alerts;
mod audit;
mod cache;
mod jobs;
mod locks;
mod rate_limits;
mod sessions;
mod tenants;

use std::sync::{Mutex, MutexGuard};

pub use alerts::MemoryAlertRepository;
pub use audit::MemoryAuditLog;
pub use cache::MemoryCacheRepository;
pub use jobs::MemoryJobRepository;
pub use locks::MemoryLeaderLock;
pub use rate_limits::MemoryRateLimitRepository;
pub use sessions::MemorySessionRepository;
pub use tenants::MemoryTenantRepository;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
