//! ABOUTME: Per-job cron timers: parse, attach, replace, and stop
//! ABOUTME: Each timer is a tokio task that sleeps to the next fire and spawns the firing

use crate::manager::ManagerInner;
use chrono::Utc;
use cron::Schedule;
use ld_core::{Error, Result};
use ld_storage::{DeletedFilter, Job, JobFilter, JobType, Storage, WATCH_JOB_NAME};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Parse a 5- or 6-field cron expression. The underlying dialect is
/// seconds-first, so 5-field expressions gain a `0` seconds column.
pub(crate) fn parse_cron(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 => expression.trim().to_string(),
        _ => {
            return Err(Error::validation(format!(
                "cron expression must have 5 or 6 fields, found {fields}"
            )))
        }
    };

    Schedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("invalid cron expression '{expression}': {e}")))
}

impl ManagerInner {
    /// Whether this replica attaches timers at all: both the fleet
    /// kill-switch and the replica's own flag must be on.
    pub(crate) async fn scheduling_active(&self) -> bool {
        if !self.enabled {
            return false;
        }
        matches!(self.storage.get_control().await, Ok(Some(control)) if control.enabled)
    }

    /// Schedule every non-deleted job, plus the watch job. Does nothing
    /// while either the fleet or this replica is disabled.
    pub(crate) async fn initialize_jobs(self: &Arc<Self>) -> Result<()> {
        let control = self
            .storage
            .get_control()
            .await?
            .ok_or_else(|| Error::validation("control record does not exist"))?;

        if !control.enabled || !self.enabled {
            self.log_debug("Scheduling disabled; no jobs attached");
            return Ok(());
        }

        // The watch job is excluded from listings, so fetch it by name.
        if let Some(watch) = self.storage.find_job_by_name(WATCH_JOB_NAME).await? {
            self.schedule_job(&watch).await;
        }

        let jobs = self
            .storage
            .find_jobs(JobFilter {
                deleted: Some(DeletedFilter::Null),
                page_size: Some(u32::MAX),
                ..Default::default()
            })
            .await?;

        let mut scheduled = 0usize;
        for job in &jobs.data {
            if self.schedule_job(job).await {
                scheduled += 1;
            }
        }
        self.log_info(format!("Scheduled {scheduled} jobs"));
        Ok(())
    }

    /// Attach (or replace) the timer for one job. Returns whether a timer
    /// is now running for it.
    pub(crate) async fn schedule_job(self: &Arc<Self>, job: &Job) -> bool {
        self.stop_job_timer(&job.name).await;

        if job.is_deleted() || !job.enabled {
            return false;
        }
        let Some(expression) = job.cron.as_deref() else {
            return false;
        };
        if job.job_type == JobType::Query && job.query.is_none() && !job.is_watch_job() {
            self.log_debug(format!("Skipping query job '{}' with no query", job.name));
            return false;
        }
        if job.job_type == JobType::Method && self.handler.is_none() {
            self.log_warn(format!(
                "No handler configured; skipping method job '{}'",
                job.name
            ));
            return false;
        }

        let schedule = match parse_cron(expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                self.log_warn(format!("Cannot schedule job '{}': {e}", job.name));
                return false;
            }
        };

        let handle = self.spawn_timer(job.clone(), schedule);
        self.cron_jobs
            .write()
            .await
            .insert(job.name.clone(), handle);
        if !job.is_watch_job() {
            self.log_debug(format!("Scheduled job '{}' ({expression})", job.name));
        }
        true
    }

    /// The timer holds only a weak manager reference: a dropped or
    /// destroyed manager ends the loop instead of being kept alive by it.
    /// Firings are spawned off the timer task so a slow execution never
    /// delays the next upcoming fire of other jobs.
    fn spawn_timer(self: &Arc<Self>, job: Job, schedule: Schedule) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let Ok(wait) = (next - Utc::now()).to_std() else {
                    // The fire time slipped into the past; take the next one.
                    continue;
                };
                tokio::time::sleep(wait).await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                let job = job.clone();
                tokio::spawn(async move {
                    inner.execute_job(&job).await;
                });
            }
        })
    }

    /// Stop a job's timer; true when one was running.
    pub(crate) async fn stop_job_timer(&self, name: &str) -> bool {
        match self.cron_jobs.write().await.remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn stop_all_timers(&self) {
        let mut timers = self.cron_jobs.write().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}
