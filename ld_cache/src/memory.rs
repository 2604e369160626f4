//! ABOUTME: Single-process cache back end with mutex-linearized operations
//! ABOUTME: Deadline-based TTLs enforced lazily on read and swept by cleanup

use crate::{Cache, LockAcquisition, LockOptions, REPLICA_HEALTH_FLOOR_MS};
use async_trait::async_trait;
use chrono::Utc;
use ld_core::ContextMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct LockEntry {
    value: String,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Clone)]
struct ContextEntry {
    /// Stored serialized so reads hand back structurally detached copies.
    json: String,
    expires_at: Option<Instant>,
}

impl ContextEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    locks: HashMap<String, LockEntry>,
    contexts: HashMap<String, ContextEntry>,
    batches: HashMap<String, u64>,
    replicas: HashMap<String, Instant>,
}

/// In-process cache for single-node deployments and tests.
///
/// Every operation funnels through one fair mutex, so mutations run in
/// enqueue order and acquire/release/extend are atomic without any further
/// coordination. Expiry is a stored deadline checked on access; no timers
/// are owned, so the default teardown (a sweep) is all destroy needs, and
/// other in-process replicas sharing this cache keep their state.
#[derive(Debug, Default)]
pub struct MemoryCache {
    state: Mutex<CacheState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn acquire_lock(&self, key: &str, options: LockOptions) -> LockAcquisition {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.locks.get(key) {
            if !existing.is_expired() {
                debug!(key = %key, "Lock already held");
                return LockAcquisition::denied();
            }
        }

        let value = options
            .value
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ttl = Duration::from_millis(options.ttl_ms);
        state.locks.insert(
            key.to_string(),
            LockEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        let expires_at = Utc::now() + chrono::Duration::milliseconds(options.ttl_ms as i64);
        debug!(key = %key, ttl_ms = options.ttl_ms, "Lock acquired");
        LockAcquisition::granted(value, expires_at)
    }

    async fn release_lock(&self, key: &str, lock_value: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.locks.get(key) {
            Some(entry) if entry.value == lock_value => {
                state.locks.remove(key);
                debug!(key = %key, "Lock released");
                true
            }
            Some(_) => {
                debug!(key = %key, "Release refused: lock value mismatch");
                false
            }
            None => false,
        }
    }

    async fn extend_lock(&self, key: &str, lock_value: &str, ttl_ms: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.locks.get_mut(key) {
            Some(entry) if entry.value == lock_value && !entry.is_expired() => {
                entry.expires_at = Instant::now() + Duration::from_millis(ttl_ms);
                true
            }
            _ => false,
        }
    }

    async fn set_job_context(&self, job_name: &str, context: &ContextMap, ttl_ms: Option<u64>) {
        let json = match serde_json::to_string(context) {
            Ok(json) => json,
            Err(e) => {
                warn!(job = %job_name, error = %e, "Failed to serialize job context");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.contexts.insert(
            job_name.to_string(),
            ContextEntry {
                json,
                expires_at: ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms)),
            },
        );
    }

    async fn get_job_context(&self, job_name: &str) -> Option<ContextMap> {
        let mut state = self.state.lock().await;
        let entry = state.contexts.get(job_name)?;
        if entry.is_expired() {
            state.contexts.remove(job_name);
            return None;
        }
        match serde_json::from_str(&entry.json) {
            Ok(context) => Some(context),
            Err(e) => {
                warn!(job = %job_name, error = %e, "Failed to deserialize job context");
                None
            }
        }
    }

    async fn delete_job_context(&self, job_name: &str) {
        self.state.lock().await.contexts.remove(job_name);
    }

    async fn increment_batch(&self, job_name: &str) -> u64 {
        let mut state = self.state.lock().await;
        let counter = state.batches.entry(job_name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn get_batch(&self, job_name: &str) -> u64 {
        self.state
            .lock()
            .await
            .batches
            .get(job_name)
            .copied()
            .unwrap_or(0)
    }

    async fn reset_batch(&self, job_name: &str) {
        self.state.lock().await.batches.remove(job_name);
    }

    async fn is_healthy(&self) -> bool {
        let probe = format!("health:{}", uuid::Uuid::new_v4());
        let acquired = self.acquire_lock(&probe, LockOptions::new(1_000)).await;
        match acquired.lock_value {
            Some(value) if acquired.acquired => self.release_lock(&probe, &value).await,
            _ => false,
        }
    }

    async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.locks.retain(|_, entry| entry.expires_at > now);
        state
            .contexts
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        state.replicas.retain(|_, expires_at| *expires_at > now);
    }

    fn supports_replica_tracking(&self) -> bool {
        true
    }

    async fn ping_replica(&self, replica_id: &str) -> bool {
        let state = self.state.lock().await;
        match state.replicas.get(replica_id) {
            Some(expires_at) => {
                let floor = Duration::from_millis(REPLICA_HEALTH_FLOOR_MS);
                expires_at.saturating_duration_since(Instant::now()) > floor
            }
            None => false,
        }
    }

    async fn touch_replica(&self, replica_id: &str, ttl_ms: u64) {
        self.state.lock().await.replicas.insert(
            replica_id.to_string(),
            Instant::now() + Duration::from_millis(ttl_ms),
        );
    }
}
