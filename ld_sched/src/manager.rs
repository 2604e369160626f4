//! ABOUTME: Manager lifecycle: construction, initialize, destroy, gates, registries
//! ABOUTME: All shared state lives in an Arc'd inner so timers can hold weak references

use crate::handler::MethodHandler;
use crate::options::{
    ManagerOptions, ReplicaIdSource, MAX_WATCH_INTERVAL_SECS, MIN_WATCH_INTERVAL_SECS,
};
use crate::JobFn;
use ld_cache::{Cache, MemoryCache};
use ld_core::{Error, LogLevel, Logger, Result};
use ld_crypto::QuerySecret;
use ld_storage::Storage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// A lock this replica acquired for a firing and has not yet released.
#[derive(Debug, Clone)]
pub(crate) struct ActiveLock {
    pub job_name: String,
    pub lock_value: String,
    pub acquired_at: Instant,
    pub ttl_ms: u64,
}

pub(crate) struct ManagerInner {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) handler: Option<Arc<dyn MethodHandler>>,
    pub(crate) query_secret: Option<QuerySecret>,
    pub(crate) replica_id: String,
    pub(crate) enabled: bool,
    pub(crate) watch_interval: u32,
    pub(crate) release_locks_on_shutdown: bool,

    pub(crate) initialized: AtomicBool,
    pub(crate) destroyed: AtomicBool,
    pub(crate) is_resetting: AtomicBool,
    pub(crate) log_level: StdRwLock<LogLevel>,

    /// Job name -> timer task for this replica's scheduler.
    pub(crate) cron_jobs: RwLock<HashMap<String, JoinHandle<()>>>,
    /// Inline execution registry, keyed by job name.
    pub(crate) inline_jobs: StdRwLock<HashMap<String, JobFn>>,
    /// Lock key -> bookkeeping for locks held by this replica.
    pub(crate) active_locks: Mutex<HashMap<String, ActiveLock>>,
    pub(crate) watchdog: Mutex<Option<JoinHandle<()>>>,
    init_lock: Mutex<()>,
}

impl ManagerInner {
    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::validation("manager has been destroyed"));
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::validation(
                "manager is not initialized; call initialize() first",
            ));
        }
        Ok(())
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn current_log_level(&self) -> LogLevel {
        *self
            .log_level
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_log_level(&self, level: LogLevel) {
        *self
            .log_level
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
    }

    pub(crate) fn log_error(&self, message: impl AsRef<str>) {
        if self.current_log_level().permits(LogLevel::Error) {
            self.logger.error(message.as_ref());
        }
    }

    pub(crate) fn log_warn(&self, message: impl AsRef<str>) {
        if self.current_log_level().permits(LogLevel::Warn) {
            self.logger.warn(message.as_ref());
        }
    }

    pub(crate) fn log_info(&self, message: impl AsRef<str>) {
        if self.current_log_level().permits(LogLevel::Info) {
            self.logger.log(message.as_ref());
        }
    }

    pub(crate) fn log_debug(&self, message: impl AsRef<str>) {
        if self.current_log_level().permits(LogLevel::Debug) {
            self.logger.debug(message.as_ref());
        }
    }

    pub(crate) fn inline_job(&self, name: &str) -> Option<JobFn> {
        self.inline_jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// TTL for this replica's liveness marker: generous enough to survive a
    /// few missed watch ticks, short enough that dead replicas fall out.
    pub(crate) fn replica_marker_ttl_ms(&self) -> u64 {
        u64::from(self.watch_interval) * 12 * 1_000
    }
}

/// The orchestrator. One `Manager` per replica; replicas coordinate through
/// the shared storage and cache handed in at construction.
#[derive(Clone)]
pub struct Manager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl Manager {
    /// Validate the options and build a manager. Nothing is scheduled until
    /// [`Manager::initialize`] runs.
    pub fn new(options: ManagerOptions) -> Result<Self> {
        let query_secret = options
            .query_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .map(QuerySecret::new)
            .transpose()?;

        let (replica_id, id_source) = options.resolve_replica_id()?;
        let watch_interval = options
            .watch_interval
            .clamp(MIN_WATCH_INTERVAL_SECS, MAX_WATCH_INTERVAL_SECS);

        if id_source == ReplicaIdSource::Generated {
            let message = format!(
                "No replica id configured; generated '{replica_id}' (identity changes on restart)"
            );
            if running_in_production() {
                options.logger.warn(&message);
            } else {
                options.logger.debug(&message);
            }
        }

        let inner = ManagerInner {
            storage: options.storage,
            cache: options
                .cache
                .unwrap_or_else(|| Arc::new(MemoryCache::new())),
            logger: options.logger,
            handler: options.handler,
            query_secret,
            replica_id,
            enabled: options.enabled,
            watch_interval,
            release_locks_on_shutdown: options.release_locks_on_shutdown,
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            is_resetting: AtomicBool::new(false),
            log_level: StdRwLock::new(LogLevel::Info),
            cron_jobs: RwLock::new(HashMap::new()),
            inline_jobs: StdRwLock::new(HashMap::new()),
            active_locks: Mutex::new(HashMap::new()),
            watchdog: Mutex::new(None),
            init_lock: Mutex::new(()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Prepare the fleet record, register this replica, build the
    /// scheduler, and start the deadlock watchdog. Safe to call again.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.is_destroyed() {
            return Err(Error::validation("manager has been destroyed"));
        }
        let _guard = self.inner.init_lock.lock().await;
        if self.inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.prepare().await?;

        let watchdog = self.inner.spawn_watchdog();
        *self.inner.watchdog.lock().await = Some(watchdog);

        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.log_debug(format!(
            "Manager initialized (replica {})",
            self.inner.replica_id
        ));
        Ok(())
    }

    /// Best-effort teardown: stop timers and the watchdog, release tracked
    /// locks, clear the inline registry, and tear down the cache. Safe to
    /// call more than once; in-flight firings are not interrupted.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.stop_all_timers().await;
        if let Some(watchdog) = self.inner.watchdog.lock().await.take() {
            watchdog.abort();
        }

        let held: Vec<(String, ActiveLock)> =
            self.inner.active_locks.lock().await.drain().collect();
        if self.inner.release_locks_on_shutdown {
            for (key, lock) in held {
                if !self.inner.cache.release_lock(&key, &lock.lock_value).await {
                    self.inner.log_warn(format!(
                        "Failed to release lock for job '{}' during shutdown",
                        lock.job_name
                    ));
                }
            }
        }

        self.inner
            .inline_jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.inner.cache.destroy().await;
        self.inner.log_debug("Manager destroyed");
    }

    /// Register the execution for an inline job. When a matching enabled
    /// job definition exists it is scheduled on this replica immediately.
    pub async fn register_inline_job<F>(&self, name: impl Into<String>, job: F) -> Result<()>
    where
        F: Fn(ld_core::ContextMap, ld_core::Lens) -> crate::JobFuture + Send + Sync + 'static,
    {
        if self.inner.is_destroyed() {
            return Err(Error::validation("manager has been destroyed"));
        }
        let name = name.into();
        crate::api::validate_job_name(&name)?;

        self.inner
            .inline_jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.clone(), Arc::new(job));

        if self.inner.initialized.load(Ordering::SeqCst) && self.inner.scheduling_active().await {
            if let Ok(Some(job)) = self.inner.storage.find_job_by_name(&name).await {
                self.inner.schedule_job(&job).await;
            }
        }
        Ok(())
    }

    /// Drop an inline registration; true when something was removed.
    pub fn remove_inline_job(&self, name: &str) -> bool {
        self.inner
            .inline_jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some()
    }

    /// Round-trip probe of both collaborators.
    pub async fn health_check(&self) -> bool {
        if self.inner.ensure_initialized().is_err() {
            return false;
        }
        let storage_ok = self.inner.storage.get_control().await.is_ok();
        storage_ok && self.inner.cache.is_healthy().await
    }

    /// Sweep locks held past twice their lease; returns how many were
    /// released. The watchdog runs this on its own cadence.
    pub async fn release_stale_locks(&self) -> usize {
        self.inner.release_stale_locks().await
    }

    pub fn replica_id(&self) -> &str {
        &self.inner.replica_id
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
            && !self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

fn running_in_production() -> bool {
    ["LUDARI_ENV", "NODE_ENV"]
        .iter()
        .any(|var| std::env::var(var).map(|v| v == "production").unwrap_or(false))
}
