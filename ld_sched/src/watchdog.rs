//! ABOUTME: Deadlock watchdog: reclaims locks held past twice their lease
//! ABOUTME: Entries are dropped from the books whether or not release succeeds

use crate::manager::{ActiveLock, ManagerInner};
use ld_cache::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
/// A lock is presumed orphaned once it has outlived its lease twice over.
const STALE_AGE_FACTOR: u32 = 2;

impl ManagerInner {
    pub(crate) fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_destroyed() {
                    break;
                }
                inner.release_stale_locks().await;
                inner.cache.cleanup().await;
            }
        })
    }

    /// One sweep: release every tracked lock older than twice its lease and
    /// forget it regardless of the release outcome, then summarize what is
    /// still held.
    pub(crate) async fn release_stale_locks(&self) -> usize {
        let stale: Vec<(String, ActiveLock)> = {
            let locks = self.active_locks.lock().await;
            locks
                .iter()
                .filter(|(_, lock)| {
                    lock.acquired_at.elapsed()
                        > Duration::from_millis(lock.ttl_ms) * STALE_AGE_FACTOR
                })
                .map(|(key, lock)| (key.clone(), lock.clone()))
                .collect()
        };

        for (key, lock) in &stale {
            if self.cache.release_lock(key, &lock.lock_value).await {
                self.log_warn(format!(
                    "Released stale lock for job '{}' (held {}s)",
                    lock.job_name,
                    lock.acquired_at.elapsed().as_secs()
                ));
            }
            self.active_locks.lock().await.remove(key);
        }

        let remaining: Vec<String> = {
            let locks = self.active_locks.lock().await;
            locks
                .values()
                .map(|lock| {
                    format!("{}:{}", lock.job_name, lock.acquired_at.elapsed().as_secs())
                })
                .collect()
        };
        if !remaining.is_empty() {
            self.log_debug(format!("Active locks: {}", remaining.join(", ")));
        }

        stale.len()
    }
}
