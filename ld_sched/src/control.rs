//! ABOUTME: Fleet synchronization through the shared Control record
//! ABOUTME: Replica registration, stale-flag resets, and retry under version conflicts

use crate::manager::ManagerInner;
use ld_cache::Cache;
use ld_core::{id::fresh_token, Error, LogLevel, Result};
use ld_storage::{Control, ControlPatch, JobType, NewControl, NewJob, Storage, WATCH_JOB_NAME};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const MAX_CONTROL_RETRIES: u32 = 5;
const RETRY_BASE_DELAY_MS: u64 = 100;
/// Per-probe deadline when checking peer replica liveness.
const REPLICA_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What a coordinated write wants done to the stale set. The concrete list
/// is derived from the freshest Control read on every attempt, so two
/// replicas clearing themselves at once cannot resurrect each other's
/// flags.
#[derive(Debug, Clone, Default)]
pub(crate) enum StaleIntent {
    /// Leave the stale set alone.
    #[default]
    Keep,
    /// Exact replacement.
    Replace(Vec<String>),
    /// Drop this replica (and anything outside the written roster).
    RemoveSelf,
}

/// Intent for a coordinated Control write, resolved against a fresh read on
/// every attempt.
#[derive(Debug, Clone, Default)]
pub(crate) struct ControlUpdate {
    pub enabled: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub replicas: Option<Vec<String>>,
    /// Replace the roster outright instead of unioning with the stored one.
    pub exact_replicas: bool,
    pub stale: StaleIntent,
    /// Rotate the version token, forcing concurrent writers to conflict.
    pub rotate_version: bool,
}

impl ManagerInner {
    /// Load the Control record, creating it on first initialize. A creation
    /// race with another replica resolves by re-reading.
    pub(crate) async fn load_or_create_control(&self) -> Result<Control> {
        if let Some(control) = self.storage.get_control().await? {
            return Ok(control);
        }

        let created = self
            .storage
            .create_control(NewControl {
                enabled: true,
                log_level: LogLevel::Info,
                replicas: vec![self.replica_id.clone()],
                stale: Vec::new(),
                version: fresh_token(),
            })
            .await;

        match created {
            Ok(control) => Ok(control),
            Err(e) if e.is_conflict() => self
                .storage
                .get_control()
                .await?
                .ok_or_else(|| Error::validation("control record vanished during creation")),
            Err(e) => Err(e),
        }
    }

    /// Startup synchronization: register this replica, prune dead peers,
    /// ensure the watch job, and build the scheduler.
    pub(crate) async fn prepare(self: &Arc<Self>) -> Result<()> {
        let control = self.load_or_create_control().await?;
        self.set_log_level(control.log_level);
        self.cache
            .touch_replica(&self.replica_id, self.replica_marker_ttl_ms())
            .await;

        let replicas = self.prune_replicas(&control).await;
        let roster_changed = replicas != control.replicas;
        // Self never resets itself right after registering.
        let stale_changed = control.stale.iter().any(|r| {
            *r == self.replica_id || !replicas.contains(r)
        });

        if roster_changed || stale_changed {
            let update = ControlUpdate {
                replicas: Some(replicas),
                exact_replicas: true,
                stale: StaleIntent::RemoveSelf,
                ..Default::default()
            };
            match self.update_control_with_retry(&control.id, update).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    self.log_debug(format!("Replica roster update conflicted: {e}"));
                }
                Err(e) => return Err(e),
            }
        }

        self.ensure_watch_job().await?;
        self.initialize_jobs().await?;
        Ok(())
    }

    /// Probe every known peer; keep the ones that answer healthy and always
    /// keep self. Caches that cannot track replicas cannot prove a peer
    /// dead, so the roster is preserved as-is.
    async fn prune_replicas(&self, control: &Control) -> Vec<String> {
        let probe_peers = self.cache.supports_replica_tracking();
        let mut replicas = Vec::new();

        for replica in &control.replicas {
            if *replica == self.replica_id {
                replicas.push(replica.clone());
                continue;
            }
            if !probe_peers {
                replicas.push(replica.clone());
                continue;
            }
            let healthy =
                tokio::time::timeout(REPLICA_PROBE_TIMEOUT, self.cache.ping_replica(replica))
                    .await
                    .unwrap_or(false);
            if healthy {
                replicas.push(replica.clone());
            } else {
                self.log_debug(format!("Dropping unresponsive replica '{replica}'"));
            }
        }

        if !replicas.iter().any(|r| *r == self.replica_id) {
            replicas.push(self.replica_id.clone());
        }
        replicas
    }

    async fn ensure_watch_job(&self) -> Result<()> {
        if self
            .storage
            .find_job_by_name(WATCH_JOB_NAME)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let watch = NewJob::new(WATCH_JOB_NAME, JobType::Query)
            .with_cron(format!("*/{} * * * * *", self.watch_interval))
            .with_persist(false)
            .with_silent(true);
        match self.storage.create_job(watch).await {
            Ok(_) => Ok(()),
            // Another replica created it between the lookup and the insert.
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Coordinated Control write with conflict retries.
    ///
    /// Each attempt re-reads the record, carries its current version as the
    /// optimistic guard, and re-derives the payload: the roster is unioned
    /// with the stored one unless the caller asked for exact replacement
    /// (or sent an empty roster), while the stale set follows the caller's
    /// [`StaleIntent`]. Conflicts back off exponentially with jitter; any
    /// other error is fatal.
    pub(crate) async fn update_control_with_retry(
        &self,
        id: &str,
        update: ControlUpdate,
    ) -> Result<Control> {
        for attempt in 0..MAX_CONTROL_RETRIES {
            let current = self
                .storage
                .get_control()
                .await?
                .ok_or_else(|| Error::validation("control record does not exist"))?;
            if current.id != id {
                return Err(Error::validation(format!(
                    "control identity changed (expected {id}, found {})",
                    current.id
                )));
            }

            let replicas = update.replicas.as_ref().map(|requested| {
                if update.exact_replicas || requested.is_empty() {
                    requested.clone()
                } else {
                    union_rosters(&current.replicas, requested)
                }
            });

            let stale = match &update.stale {
                StaleIntent::Keep => None,
                StaleIntent::Replace(list) => Some(list.clone()),
                StaleIntent::RemoveSelf => {
                    let roster = replicas.as_ref().unwrap_or(&current.replicas);
                    Some(
                        current
                            .stale
                            .iter()
                            .filter(|r| roster.contains(r) && **r != self.replica_id)
                            .cloned()
                            .collect(),
                    )
                }
            };

            let patch = ControlPatch {
                enabled: update.enabled,
                log_level: update.log_level,
                replicas,
                stale,
                version: Some(current.version.clone()),
                set_version: update.rotate_version.then(fresh_token),
            };

            match self.storage.update_control(id, patch).await {
                Ok(control) => return Ok(control),
                Err(e) if e.is_conflict() && attempt + 1 < MAX_CONTROL_RETRIES => {
                    let delay = retry_delay(attempt);
                    self.log_debug(format!(
                        "Control update conflicted (attempt {}), retrying in {:?}",
                        attempt + 1,
                        delay
                    ));
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_conflict() => break,
                Err(e) => return Err(e),
            }
        }

        Err(Error::conflict(format!(
            "control update failed after {MAX_CONTROL_RETRIES} attempts"
        )))
    }

    /// Mark every replica stale and rotate the version so peers rebuild
    /// their schedulers on the next watch tick. A conflict means another
    /// replica already did this; that is success enough.
    pub(crate) async fn trigger_reset(&self) -> Result<()> {
        let control = self
            .storage
            .get_control()
            .await?
            .ok_or_else(|| Error::validation("control record does not exist"))?;

        let patch = ControlPatch {
            stale: Some(control.replicas.clone()),
            version: Some(control.version.clone()),
            set_version: Some(fresh_token()),
            ..Default::default()
        };

        match self.storage.update_control(&control.id, patch).await {
            Ok(updated) => {
                self.log_debug(format!(
                    "Marked {} replica(s) stale for rescheduling",
                    updated.stale.len()
                ));
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                self.log_debug("Reset already triggered by another replica");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Rebuild this replica's scheduler when the fleet flagged it stale.
    /// Reentry is guarded; contention on the stale-flag clear is quiet.
    pub(crate) async fn reset_jobs(self: &Arc<Self>, control: &Control) {
        if !control.stale.iter().any(|r| *r == self.replica_id) {
            return;
        }
        if self.is_resetting.swap(true, Ordering::SeqCst) {
            return;
        }

        self.log_debug("Stale flag observed; rebuilding scheduler");
        self.stop_all_timers().await;
        if let Err(e) = self.initialize_jobs().await {
            self.log_warn(format!("Failed to rebuild scheduler: {e}"));
        }

        let update = ControlUpdate {
            stale: StaleIntent::RemoveSelf,
            ..Default::default()
        };
        match self.update_control_with_retry(&control.id, update).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                self.log_debug(format!("Stale-flag clear conflicted: {e}"));
            }
            Err(e) => self.log_warn(format!("Failed to clear stale flag: {e}")),
        }

        self.is_resetting.store(false, Ordering::SeqCst);
    }
}

fn union_rosters(current: &[String], requested: &[String]) -> Vec<String> {
    let mut merged = current.to_vec();
    for replica in requested {
        if !merged.contains(replica) {
            merged.push(replica.clone());
        }
    }
    merged
}

/// Exponential backoff with up to 10% jitter.
fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..=base / 10);
    Duration::from_millis(base + jitter)
}
