//! ABOUTME: Public job-definition API: CRUD over jobs, runs, and the Control record
//! ABOUTME: Validates names and shapes, protects system jobs, and propagates resets

use crate::control::{ControlUpdate, StaleIntent};
use crate::manager::Manager;
use crate::scheduler::parse_cron;
use ld_cache::Cache;
use ld_core::{ContextMap, Error, Result};
use ld_storage::{
    Control, ControlPatch, Job, JobFilter, JobPatch, JobRun, JobRunFilter, JobType, NewJob,
    Paginated, Storage, WATCH_JOB_NAME,
};
use regex::Regex;
use std::sync::OnceLock;

fn job_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,100}$").expect("static regex"))
}

/// Names the system keeps for itself.
pub(crate) fn is_reserved_name(name: &str) -> bool {
    name == WATCH_JOB_NAME
        || name.starts_with("__")
        || name.starts_with("system:")
        || name.starts_with("internal:")
}

pub(crate) fn validate_job_name(name: &str) -> Result<()> {
    if is_reserved_name(name) {
        return Err(Error::validation(format!(
            "job name '{name}' is reserved for the system"
        )));
    }
    if !job_name_pattern().is_match(name) {
        return Err(Error::validation(
            "job name must match [A-Za-z0-9_-]{1,100}",
        ));
    }
    Ok(())
}

impl Manager {
    /// Create a job definition. Query strings are envelope-encrypted when a
    /// secret is configured; schedulable query/method jobs trigger a fleet
    /// reset so every replica picks them up.
    pub async fn create_job(&self, mut data: NewJob) -> Result<Job> {
        self.inner.ensure_initialized()?;
        validate_job_name(&data.name)?;

        if let Some(cron) = data.cron.as_deref() {
            parse_cron(cron)?;
        }
        let schedulable = data.enabled && data.cron.is_some();
        if data.job_type == JobType::Query
            && schedulable
            && data.query.as_deref().map_or(true, |q| q.trim().is_empty())
        {
            return Err(Error::validation(
                "an enabled, scheduled query job requires a query",
            ));
        }
        if data.job_type == JobType::Method && schedulable && self.inner.handler.is_none() {
            return Err(Error::validation(
                "an enabled, scheduled method job requires a configured handler",
            ));
        }

        if let Some(secret) = &self.inner.query_secret {
            if let Some(query) = data.query.take() {
                data.query = Some(ld_crypto::encrypt(&query, secret)?);
            }
        }

        let job = self.inner.storage.create_job(data).await?;

        if matches!(job.job_type, JobType::Query | JobType::Method) && job.cron.is_some() {
            if let Err(e) = self.inner.trigger_reset().await {
                self.inner
                    .log_warn(format!("Failed to propagate reset for '{}': {e}", job.name));
            }
        } else if job.job_type == JobType::Inline
            && self.inner.inline_job(&job.name).is_some()
            && self.inner.scheduling_active().await
        {
            // Inline executions only exist on the replicas that registered
            // them, so scheduling is local rather than fleet-wide.
            self.inner.schedule_job(&job).await;
        }

        Ok(job)
    }

    /// Patch a job definition. Context changes are also pushed to the
    /// shared cache; the local timer is replaced (or stopped) to match the
    /// updated shape.
    pub async fn update_job(&self, id: &str, mut patch: JobPatch) -> Result<Job> {
        self.inner.ensure_initialized()?;
        if id.trim().is_empty() {
            return Err(Error::validation("job id is required"));
        }

        let current = self
            .inner
            .storage
            .find_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?;
        if is_reserved_name(&current.name) {
            return Err(Error::validation("cannot modify a system job"));
        }
        if let Some(name) = &patch.name {
            validate_job_name(name)?;
        }
        if let Some(Some(cron)) = &patch.cron {
            parse_cron(cron)?;
        }

        // Validate the job shape as it will be after the patch applies.
        let job_type = patch.job_type.unwrap_or(current.job_type);
        let enabled = patch.enabled.unwrap_or(current.enabled);
        let cron = match &patch.cron {
            Some(cron) => cron.clone(),
            None => current.cron.clone(),
        };
        let has_query = match &patch.query {
            Some(query) => query.as_deref().map_or(false, |q| !q.trim().is_empty()),
            None => current.query.as_deref().map_or(false, |q| !q.trim().is_empty()),
        };
        let schedulable = enabled && cron.is_some();
        if job_type == JobType::Query && schedulable && !has_query {
            return Err(Error::validation(
                "an enabled, scheduled query job requires a query",
            ));
        }
        if job_type == JobType::Method && schedulable && self.inner.handler.is_none() {
            return Err(Error::validation(
                "an enabled, scheduled method job requires a configured handler",
            ));
        }

        if let Some(secret) = &self.inner.query_secret {
            if let Some(query_patch) = patch.query.take() {
                patch.query = Some(match query_patch {
                    Some(query) => Some(ld_crypto::encrypt(&query, secret)?),
                    None => None,
                });
            }
        }

        if let Some(Some(context)) = &patch.context {
            self.inner
                .cache
                .set_job_context(&current.name, context, None)
                .await;
        } else if let Some(None) = &patch.context {
            // Clearing the static context also drops the cached dynamic
            // context, or firings would keep merging the stale values.
            self.inner.cache.delete_job_context(&current.name).await;
        }

        let updated = self.inner.storage.update_job(id, patch).await?;

        if updated.name != current.name {
            self.inner.stop_job_timer(&current.name).await;
        }
        self.inner.stop_job_timer(&updated.name).await;
        if self.inner.scheduling_active().await {
            self.inner.schedule_job(&updated).await;
        }

        if matches!(updated.job_type, JobType::Query | JobType::Method) {
            if let Err(e) = self.inner.trigger_reset().await {
                self.inner.log_warn(format!(
                    "Failed to propagate reset for '{}': {e}",
                    updated.name
                ));
            }
        }

        Ok(updated)
    }

    /// Flip a job's enabled flag.
    pub async fn toggle_job(&self, id: &str) -> Result<Job> {
        let current = self.checked_job(id).await?;
        self.update_job(id, JobPatch::default().with_enabled(!current.enabled))
            .await
    }

    /// Enable a job; a no-op when it already is.
    pub async fn enable_job(&self, id: &str) -> Result<Job> {
        let current = self.checked_job(id).await?;
        if current.enabled {
            return Ok(current);
        }
        self.update_job(id, JobPatch::default().with_enabled(true))
            .await
    }

    /// Disable a job; a no-op when it already is.
    pub async fn disable_job(&self, id: &str) -> Result<Job> {
        let current = self.checked_job(id).await?;
        if !current.enabled {
            return Ok(current);
        }
        self.update_job(id, JobPatch::default().with_enabled(false))
            .await
    }

    async fn checked_job(&self, id: &str) -> Result<Job> {
        self.inner.ensure_initialized()?;
        if id.trim().is_empty() {
            return Err(Error::validation("job id is required"));
        }
        let job = self
            .inner
            .storage
            .find_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?;
        if is_reserved_name(&job.name) {
            return Err(Error::validation("cannot modify a system job"));
        }
        Ok(job)
    }

    /// Fetch a job by id; system jobs read as absent.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.inner.ensure_initialized()?;
        let job = self.inner.storage.find_job(id).await?;
        Ok(job.filter(|j| !j.is_watch_job()))
    }

    /// Fetch a job by name; system jobs read as absent.
    pub async fn get_job_by_name(&self, name: &str) -> Result<Option<Job>> {
        self.inner.ensure_initialized()?;
        if name == WATCH_JOB_NAME {
            return Ok(None);
        }
        self.inner.storage.find_job_by_name(name).await
    }

    /// Soft-delete a job and stop its local timer.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let job = self.checked_job(id).await?;
        self.inner.stop_job_timer(&job.name).await;
        self.inner.storage.delete_job(id).await
    }

    /// Filtered job listing; the watch job never appears.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Paginated<Job>> {
        self.inner.ensure_initialized()?;
        let mut page = self.inner.storage.find_jobs(filter).await?;
        page.data.retain(|job| !job.is_watch_job());
        Ok(page)
    }

    /// Filtered run history.
    pub async fn list_job_runs(&self, filter: JobRunFilter) -> Result<Paginated<JobRun>> {
        self.inner.ensure_initialized()?;
        self.inner.storage.find_job_runs(filter).await
    }

    /// Read the fleet record.
    pub async fn get_control(&self) -> Result<Option<Control>> {
        self.inner.ensure_initialized()?;
        self.inner.storage.get_control().await
    }

    /// Flip the fleet kill-switch. Deliberately unguarded: an operator
    /// toggle wins over whatever version the record carries.
    pub async fn toggle_control(&self) -> Result<Control> {
        self.inner.ensure_initialized()?;
        let control = self
            .inner
            .storage
            .get_control()
            .await?
            .ok_or_else(|| Error::validation("control record does not exist"))?;
        self.inner
            .storage
            .update_control(
                &control.id,
                ControlPatch {
                    enabled: Some(!control.enabled),
                    ..Default::default()
                },
            )
            .await
    }

    /// Operational fleet reset: empty the roster, then re-register this
    /// replica cleanly through `prepare`.
    pub async fn purge_control(&self) -> Result<()> {
        self.inner.ensure_initialized()?;
        let control = self
            .inner
            .storage
            .get_control()
            .await?
            .ok_or_else(|| Error::validation("control record does not exist"))?;

        self.inner
            .update_control_with_retry(
                &control.id,
                ControlUpdate {
                    replicas: Some(Vec::new()),
                    exact_replicas: true,
                    stale: StaleIntent::Replace(Vec::new()),
                    ..Default::default()
                },
            )
            .await?;

        self.inner.prepare().await
    }

    /// Store dynamic context for a job. Distributed firings merge this
    /// over the job's static context, with the dynamic side winning.
    pub async fn set_job_context(
        &self,
        name: &str,
        context: &ContextMap,
        ttl_ms: Option<u64>,
    ) -> Result<()> {
        self.inner.ensure_initialized()?;
        validate_job_name(name)?;
        self.inner.cache.set_job_context(name, context, ttl_ms).await;
        Ok(())
    }

    /// Read a job's dynamic context, if any.
    pub async fn get_job_context(&self, name: &str) -> Result<Option<ContextMap>> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.cache.get_job_context(name).await)
    }

    /// Drop a job's dynamic context.
    pub async fn delete_job_context(&self, name: &str) -> Result<()> {
        self.inner.ensure_initialized()?;
        self.inner.cache.delete_job_context(name).await;
        Ok(())
    }

    /// Bump a job's batch counter, returning the new value.
    pub async fn increment_batch(&self, name: &str) -> Result<u64> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.cache.increment_batch(name).await)
    }

    /// Read a job's batch counter; 0 when it was never incremented.
    pub async fn get_batch(&self, name: &str) -> Result<u64> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.cache.get_batch(name).await)
    }

    /// Reset a job's batch counter.
    pub async fn reset_batch(&self, name: &str) -> Result<()> {
        self.inner.ensure_initialized()?;
        self.inner.cache.reset_batch(name).await;
        Ok(())
    }

    /// Fire a job immediately through the standard execution pipeline.
    pub async fn run_job(&self, id: &str) -> Result<()> {
        self.inner.ensure_initialized()?;
        if id.trim().is_empty() {
            return Err(Error::validation("job id is required"));
        }
        let job = self
            .inner
            .storage
            .find_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?;
        if is_reserved_name(&job.name) {
            return Err(Error::validation("cannot run a system job"));
        }
        self.inner.execute_job(&job).await;
        Ok(())
    }
}
