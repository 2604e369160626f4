//! ABOUTME: Per-firing pipeline: load, lock, run, record, release
//! ABOUTME: Execution failures are contained here; the scheduler never sees them

use crate::context;
use crate::manager::{ActiveLock, ManagerInner};
use crate::output::serialize_result;
use crate::{JobFn, JobOutput};
use ld_cache::{Cache, LockOptions};
use ld_core::{now, ContextMap, Error, Lens, Result};
use ld_storage::{Job, JobPatch, JobRunPatch, JobType, NewJobRun, Storage};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

impl ManagerInner {
    /// Entry point for a cron firing (and for manual triggers).
    pub(crate) async fn execute_job(self: &Arc<Self>, job: &Job) {
        match self.storage.get_control().await {
            Ok(Some(control)) => {
                self.set_log_level(control.log_level);
                if !control.stale.is_empty() {
                    self.reset_jobs(&control).await;
                }
            }
            Ok(None) => {}
            Err(e) => self.log_warn(format!("Failed to refresh control: {e}")),
        }

        if job.is_watch_job() {
            // The watch job only exists to tick; refresh our liveness
            // marker while we are here.
            self.cache
                .touch_replica(&self.replica_id, self.replica_marker_ttl_ms())
                .await;
            return;
        }

        let execution = self.build_execution(job);
        if let Err(e) = self.handle_job(&job.name, execution).await {
            self.log_error(format!("Job '{}' did not run: {e}", job.name));
        }
    }

    /// Bind the job's execution closure by type. The closure captures
    /// everything it needs so the pipeline can treat all three bindings
    /// uniformly.
    pub(crate) fn build_execution(self: &Arc<Self>, job: &Job) -> JobFn {
        match job.job_type {
            JobType::Query => {
                let storage = self.storage.clone();
                let secret = self.query_secret.clone();
                let stored = job.query.clone();
                let name = job.name.clone();
                Arc::new(move |_context, _lens| {
                    let storage = storage.clone();
                    let secret = secret.clone();
                    let stored = stored.clone();
                    let name = name.clone();
                    Box::pin(async move {
                        let Some(stored) = stored else {
                            return Err(Error::validation(format!(
                                "query job '{name}' has no query"
                            )));
                        };
                        let plaintext = match &secret {
                            Some(secret) => ld_crypto::decrypt(&stored, secret)?,
                            None => stored,
                        };
                        let query = ld_crypto::sanitize_query(&plaintext)?;
                        let value = storage.execute_query(&query).await?;
                        Ok(JobOutput::Value(value))
                    })
                })
            }
            JobType::Method => {
                let handler = self.handler.clone();
                let name = job.name.clone();
                Arc::new(move |context, lens| {
                    let handler = handler.clone();
                    let name = name.clone();
                    Box::pin(async move {
                        match handler {
                            Some(handler) => handler.execute_method(&name, &context, &lens).await,
                            None => Err(Error::validation(format!(
                                "no handler configured for method job '{name}'"
                            ))),
                        }
                    })
                })
            }
            JobType::Inline => {
                let inner = self.clone();
                let name = job.name.clone();
                Arc::new(move |context, lens| {
                    let inner = inner.clone();
                    let name = name.clone();
                    Box::pin(async move {
                        match inner.inline_job(&name) {
                            Some(job_fn) => job_fn(context, lens).await,
                            None => {
                                inner.log_warn(format!(
                                    "No inline handler registered for job '{name}'"
                                ));
                                Ok(JobOutput::None)
                            }
                        }
                    })
                })
            }
        }
    }

    /// The per-firing pipeline. Loads the latest definition, resolves the
    /// context, takes the distributed lock when asked to, runs the bound
    /// execution, records the outcome, and always releases what it took.
    pub(crate) async fn handle_job(self: &Arc<Self>, name: &str, execution: JobFn) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        if name.trim().is_empty() {
            return Err(Error::validation("job name must not be empty"));
        }

        let Some(job) = self.storage.find_job_by_name(name).await? else {
            return Ok(());
        };
        if !job.enabled || job.is_deleted() {
            return Ok(());
        }

        let lens = Lens::new();

        let mut run_id: Option<String> = None;
        if job.persist {
            match self
                .storage
                .create_job_run(NewJobRun {
                    job_id: job.id.clone(),
                    started: now(),
                })
                .await
            {
                Ok(run) => run_id = Some(run.id),
                Err(e) => self.log_warn(format!("Failed to record run for '{name}': {e}")),
            }
        }

        let mut exec_context: ContextMap = job.context.clone().unwrap_or_default();
        if context::is_distributed(&exec_context) {
            if let Some(dynamic) = self.cache.get_job_context(name).await {
                exec_context = context::merge_dynamic(exec_context, dynamic);
            }
        }

        let mut held_lock: Option<(String, String)> = None;
        if context::is_distributed(&exec_context) {
            let ttl_ms = context::lock_ttl_secs(&exec_context) * 1_000;
            let key = format!("lock:{name}");
            let acquisition = self.cache.acquire_lock(&key, LockOptions::new(ttl_ms)).await;
            if !acquisition.acquired {
                self.log_debug(format!(
                    "Job '{name}' is locked by another replica; skipping this firing"
                ));
                return Ok(());
            }
            let lock_value = acquisition.lock_value.unwrap_or_default();
            self.active_locks.lock().await.insert(
                key.clone(),
                ActiveLock {
                    job_name: name.to_string(),
                    lock_value: lock_value.clone(),
                    acquired_at: Instant::now(),
                    ttl_ms,
                },
            );
            held_lock = Some((key, lock_value));
        }

        if !job.silent {
            self.log_info(format!("Job started: {name}"));
        }

        match execution(exec_context.clone(), lens.clone()).await {
            Ok(output) => {
                if context::is_run_once(&exec_context) {
                    match self
                        .storage
                        .update_job(&job.id, JobPatch::default().with_enabled(false))
                        .await
                    {
                        Ok(_) => {
                            self.stop_job_timer(name).await;
                        }
                        Err(e) => self
                            .log_warn(format!("Failed to disable run-once job '{name}': {e}")),
                    }
                }

                if let Some(run_id) = &run_id {
                    let patch = JobRunPatch {
                        completed: Some(now()),
                        failed: None,
                        result: serialize_result(&output, &lens),
                    };
                    if let Err(e) = self.storage.update_job_run(run_id, patch).await {
                        self.log_warn(format!("Failed to complete run for '{name}': {e}"));
                    }
                }
                if !job.silent {
                    self.log_info(format!("Job completed: {name}"));
                }
            }
            Err(error) => {
                let _ = lens.capture_error("Job execution failed", &error);
                self.log_warn(format!("Job failed: {name}: {error}"));

                if let Some(run_id) = &run_id {
                    let patch = JobRunPatch {
                        completed: None,
                        failed: Some(now()),
                        result: Some(Value::String(lens.frames())),
                    };
                    if let Err(e) = self.storage.update_job_run(run_id, patch).await {
                        self.log_warn(format!("Failed to record failure for '{name}': {e}"));
                    }
                }
            }
        }

        if let Some((key, lock_value)) = held_lock {
            if !self.cache.release_lock(&key, &lock_value).await {
                self.log_warn(format!(
                    "Failed to release lock for job '{name}'; the watchdog will reclaim it"
                ));
            }
            // Drop the bookkeeping either way so entries never accumulate.
            self.active_locks.lock().await.remove(&key);
        }

        Ok(())
    }
}
