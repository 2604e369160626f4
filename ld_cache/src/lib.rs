//! ABOUTME: Shared-cache contract: distributed locks, job context, batch counters
//! ABOUTME: All operations are non-throwing; failures collapse into documented fallbacks

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ld_core::ContextMap;

pub mod memory;

pub use memory::MemoryCache;

/// A replica presence marker must have strictly more than this much TTL
/// remaining to count as healthy.
pub const REPLICA_HEALTH_FLOOR_MS: u64 = 5_000;

/// Options for acquiring a distributed lock.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lock lifetime in milliseconds.
    pub ttl_ms: u64,
    /// Caller-supplied lock value; a fresh opaque token when absent.
    pub value: Option<String>,
}

impl LockOptions {
    pub fn new(ttl_ms: u64) -> Self {
        Self { ttl_ms, value: None }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, Default)]
pub struct LockAcquisition {
    pub acquired: bool,
    /// The stored fencing value; required for release and extend.
    pub lock_value: Option<String>,
    /// Absolute expiry of the lease.
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockAcquisition {
    pub fn denied() -> Self {
        Self::default()
    }

    pub fn granted(lock_value: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            acquired: true,
            lock_value: Some(lock_value),
            expires_at: Some(expires_at),
        }
    }
}

/// Shared-cache contract consumed by the orchestration core.
///
/// Operations never surface errors: implementations log internally and
/// return the documented fallback (`denied`, `false`, `None`, `0`, `1`)
/// instead. Lock release and extend carry compare-and-set semantics on the
/// fencing value.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Atomic test-and-set of `lock:<key>`. Exactly one of any set of
    /// concurrent acquirers wins; the rest observe `acquired = false`.
    async fn acquire_lock(&self, key: &str, options: LockOptions) -> LockAcquisition;

    /// Atomic compare-and-delete. True only when a lock exists at `key`
    /// with exactly `lock_value`.
    async fn release_lock(&self, key: &str, lock_value: &str) -> bool;

    /// Atomic compare-and-expire. The new TTL replaces the old lease
    /// outright rather than extending it.
    async fn extend_lock(&self, key: &str, lock_value: &str, ttl_ms: u64) -> bool;

    /// Store a job's dynamic context, replacing any prior value and expiry.
    async fn set_job_context(&self, job_name: &str, context: &ContextMap, ttl_ms: Option<u64>);

    /// Fetch a detached copy of a job's dynamic context, or `None` when
    /// absent, expired, or unreadable.
    async fn get_job_context(&self, job_name: &str) -> Option<ContextMap>;

    /// Idempotent removal of a job's dynamic context.
    async fn delete_job_context(&self, job_name: &str);

    /// Atomic zero-initialized increment of `batch:<jobName>`. The error
    /// fallback is 1, never 0.
    async fn increment_batch(&self, job_name: &str) -> u64;

    /// Current batch counter, 0 when absent.
    async fn get_batch(&self, job_name: &str) -> u64;

    /// Idempotent counter reset.
    async fn reset_batch(&self, job_name: &str);

    /// Round-trip probe, typically an acquire/release of a disposable lock.
    async fn is_healthy(&self) -> bool;

    /// Optional compaction hook, called periodically by the Manager.
    async fn cleanup(&self) {}

    /// Optional teardown. Implementations that own timers must cancel them
    /// here. Defaults to `cleanup`.
    async fn destroy(&self) {
        self.cleanup().await;
    }

    /// Whether this cache tracks replica presence markers at all. When
    /// false, `ping_replica` answers cannot prove inactivity and the
    /// Manager preserves the roster as-is.
    fn supports_replica_tracking(&self) -> bool {
        false
    }

    /// True only when the replica's presence marker exists with strictly
    /// more than [`REPLICA_HEALTH_FLOOR_MS`] of TTL remaining.
    async fn ping_replica(&self, replica_id: &str) -> bool {
        let _ = replica_id;
        false
    }

    /// Refresh this replica's presence marker.
    async fn touch_replica(&self, replica_id: &str, ttl_ms: u64) {
        let _ = (replica_id, ttl_ms);
    }
}
