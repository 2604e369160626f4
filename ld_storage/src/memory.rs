//! ABOUTME: In-memory storage back end used for tests and single-process hosts
//! ABOUTME: HashMap tables behind an RwLock, with clone-on-read semantics

use crate::model::*;
use crate::Storage;
use async_trait::async_trait;
use chrono::Utc;
use ld_core::{id::fresh_token, Error, Id, Result, StorageError};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    control: Option<Control>,
    jobs: HashMap<String, Job>,
    /// Live (non-deleted) name -> job id.
    names: HashMap<String, String>,
    job_order: Vec<String>,
    runs: HashMap<String, JobRun>,
    run_order: Vec<String>,
}

/// Storage back end holding everything in process memory.
///
/// Entities are cloned on the way in and on the way out, so callers can
/// never mutate stored state through a read.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<StoreState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_control(&self) -> Result<Option<Control>> {
        Ok(self.state.read().await.control.clone())
    }

    async fn create_control(&self, data: NewControl) -> Result<Control> {
        let mut state = self.state.write().await;
        if state.control.is_some() {
            return Err(Error::conflict("control record already exists"));
        }

        let now = Utc::now();
        let control = Control {
            id: Id::new().into(),
            enabled: data.enabled,
            log_level: data.log_level,
            replicas: data.replicas,
            stale: data.stale,
            version: if data.version.is_empty() {
                fresh_token()
            } else {
                data.version
            },
            created_at: now,
            updated_at: now,
        };
        state.control = Some(control.clone());
        debug!(control_id = %control.id, "Created control record");
        Ok(control)
    }

    async fn update_control(&self, id: &str, patch: ControlPatch) -> Result<Control> {
        let mut state = self.state.write().await;
        let control = state
            .control
            .as_mut()
            .filter(|c| c.id == id)
            .ok_or_else(|| Error::not_found("Control", id))?;

        if let Some(expected) = &patch.version {
            if *expected != control.version {
                return Err(Error::conflict(format!(
                    "control version mismatch: expected {}, found {}",
                    expected, control.version
                )));
            }
        }

        if let Some(enabled) = patch.enabled {
            control.enabled = enabled;
        }
        if let Some(level) = patch.log_level {
            control.log_level = level;
        }
        if let Some(replicas) = patch.replicas {
            control.replicas = replicas;
        }
        if let Some(stale) = patch.stale {
            control.stale = stale;
        }
        if let Some(version) = patch.set_version {
            control.version = version;
        }
        // Invariant: stale is always a subset of the replica roster.
        let roster = control.replicas.clone();
        control.stale.retain(|r| roster.contains(r));
        control.updated_at = Utc::now();

        Ok(control.clone())
    }

    async fn find_jobs(&self, filter: JobFilter) -> Result<Paginated<Job>> {
        let state = self.state.read().await;
        let matches: Vec<Job> = state
            .job_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| !job.is_watch_job())
            .filter(|job| match filter.deleted {
                Some(DeletedFilter::Null) => !job.is_deleted(),
                Some(DeletedFilter::NotNull) => job.is_deleted(),
                None => true,
            })
            .filter(|job| filter.name.as_deref().map_or(true, |n| job.name == n))
            .filter(|job| filter.job_type.map_or(true, |t| job.job_type == t))
            .filter(|job| filter.enabled.map_or(true, |e| job.enabled == e))
            .cloned()
            .collect();

        Ok(paginate(matches, filter.page, filter.page_size))
    }

    async fn find_job(&self, id: &str) -> Result<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(id).filter(|j| !j.is_deleted()).cloned())
    }

    async fn find_job_by_name(&self, name: &str) -> Result<Option<Job>> {
        let state = self.state.read().await;
        let id = match state.names.get(name) {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(state.jobs.get(id).filter(|j| !j.is_deleted()).cloned())
    }

    async fn create_job(&self, data: NewJob) -> Result<Job> {
        let mut state = self.state.write().await;
        if state.names.contains_key(&data.name) {
            return Err(Error::conflict(format!(
                "job with name '{}' already exists",
                data.name
            )));
        }

        let now = Utc::now();
        let job = Job {
            id: Id::new().into(),
            name: data.name,
            job_type: data.job_type,
            enabled: data.enabled,
            cron: data.cron,
            query: data.query,
            context: data.context,
            persist: data.persist,
            silent: data.silent,
            deleted: None,
            created_at: now,
            updated_at: now,
        };
        state.names.insert(job.name.clone(), job.id.clone());
        state.job_order.push(job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, name = %job.name, "Created job");
        Ok(job)
    }

    async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let mut state = self.state.write().await;
        let current_name = state
            .jobs
            .get(id)
            .map(|j| j.name.clone())
            .ok_or_else(|| Error::not_found("Job", id))?;

        if let Some(new_name) = &patch.name {
            if *new_name != current_name {
                if let Some(other) = state.names.get(new_name) {
                    if other != id {
                        return Err(Error::conflict(format!(
                            "job with name '{}' already exists",
                            new_name
                        )));
                    }
                }
            }
        }

        let job = state.jobs.get_mut(id).ok_or_else(|| Error::not_found("Job", id))?;
        if let Some(name) = patch.name.clone() {
            job.name = name;
        }
        if let Some(job_type) = patch.job_type {
            job.job_type = job_type;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        if let Some(cron) = patch.cron {
            job.cron = cron;
        }
        if let Some(query) = patch.query {
            job.query = query;
        }
        if let Some(context) = patch.context {
            job.context = context;
        }
        if let Some(persist) = patch.persist {
            job.persist = persist;
        }
        if let Some(silent) = patch.silent {
            job.silent = silent;
        }
        job.updated_at = Utc::now();
        let updated = job.clone();

        // Keep the live-name index pointed at the right row.
        if updated.name != current_name {
            state.names.remove(&current_name);
            if !updated.is_deleted() {
                state.names.insert(updated.name.clone(), updated.id.clone());
            }
        }

        Ok(updated)
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(id)
            .filter(|j| !j.is_deleted())
            .ok_or_else(|| Error::not_found("Job", id))?;

        job.deleted = Some(Utc::now());
        job.updated_at = Utc::now();
        let name = job.name.clone();
        state.names.remove(&name);
        debug!(job_id = %id, name = %name, "Soft-deleted job");
        Ok(())
    }

    async fn create_job_run(&self, data: NewJobRun) -> Result<JobRun> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&data.job_id) {
            return Err(StorageError::invalid_reference(format!(
                "job run references unknown job: {}",
                data.job_id
            ))
            .into());
        }

        let now = Utc::now();
        let run = JobRun {
            id: Id::new().into(),
            job_id: data.job_id,
            started: data.started,
            completed: None,
            failed: None,
            result: None,
            created_at: now,
            updated_at: now,
        };
        state.run_order.push(run.id.clone());
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn update_job_run(&self, id: &str, patch: JobRunPatch) -> Result<JobRun> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("JobRun", id))?;

        let completed = patch.completed.or(run.completed);
        let failed = patch.failed.or(run.failed);
        if completed.is_some() && failed.is_some() {
            return Err(Error::validation(
                "a job run cannot be both completed and failed",
            ));
        }

        run.completed = completed;
        run.failed = failed;
        if let Some(result) = patch.result {
            run.result = Some(result);
        }
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn find_job_runs(&self, filter: JobRunFilter) -> Result<Paginated<JobRun>> {
        let state = self.state.read().await;
        let matches: Vec<JobRun> = state
            .run_order
            .iter()
            .filter_map(|id| state.runs.get(id))
            .filter(|run| filter.job_id.as_deref().map_or(true, |j| run.job_id == j))
            .filter(|run| filter.started_after.map_or(true, |t| run.started > t))
            .filter(|run| filter.started_before.map_or(true, |t| run.started < t))
            .filter(|run| match filter.status {
                Some(RunStatus::Completed) => run.completed.is_some(),
                Some(RunStatus::Failed) => run.failed.is_some(),
                Some(RunStatus::Running) => run.is_running(),
                None => true,
            })
            .cloned()
            .collect();

        Ok(paginate(matches, filter.page, filter.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ld_core::LogLevel;

    fn new_control() -> NewControl {
        NewControl {
            enabled: true,
            log_level: LogLevel::Info,
            replicas: vec!["replica-1".into()],
            stale: vec![],
            version: "v1".into(),
        }
    }

    #[tokio::test]
    async fn test_control_is_singleton() {
        let storage = MemoryStorage::new();
        storage.create_control(new_control()).await.unwrap();
        let err = storage.create_control(new_control()).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_control_version_guard() {
        let storage = MemoryStorage::new();
        let control = storage.create_control(new_control()).await.unwrap();

        let err = storage
            .update_control(
                &control.id,
                ControlPatch {
                    enabled: Some(false),
                    version: Some("stale-token".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let updated = storage
            .update_control(
                &control.id,
                ControlPatch {
                    enabled: Some(false),
                    version: Some("v1".into()),
                    set_version: Some("v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.version, "v2");
    }

    #[tokio::test]
    async fn test_control_update_without_guard_overwrites() {
        let storage = MemoryStorage::new();
        let control = storage.create_control(new_control()).await.unwrap();
        let updated = storage
            .update_control(
                &control.id,
                ControlPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
    }

    #[tokio::test]
    async fn test_stale_stays_subset_of_replicas() {
        let storage = MemoryStorage::new();
        let control = storage.create_control(new_control()).await.unwrap();
        let updated = storage
            .update_control(
                &control.id,
                ControlPatch {
                    replicas: Some(vec!["replica-1".into()]),
                    stale: Some(vec!["replica-1".into(), "replica-gone".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.stale, vec!["replica-1".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_job_name_conflicts() {
        let storage = MemoryStorage::new();
        storage
            .create_job(NewJob::new("sync-users", JobType::Inline))
            .await
            .unwrap();
        let err = storage
            .create_job(NewJob::new("sync-users", JobType::Method))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_deleted_name_can_be_reused() {
        let storage = MemoryStorage::new();
        let job = storage
            .create_job(NewJob::new("sync-users", JobType::Inline))
            .await
            .unwrap();
        storage.delete_job(&job.id).await.unwrap();
        storage
            .create_job(NewJob::new("sync-users", JobType::Inline))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_soft_delete_hides_job() {
        let storage = MemoryStorage::new();
        let job = storage
            .create_job(NewJob::new("reaper", JobType::Inline))
            .await
            .unwrap();
        storage.delete_job(&job.id).await.unwrap();

        assert!(storage.find_job(&job.id).await.unwrap().is_none());
        assert!(storage.find_job_by_name("reaper").await.unwrap().is_none());

        // Excluded by default-null filter, visible with not-null.
        let live = storage
            .find_jobs(JobFilter {
                deleted: Some(DeletedFilter::Null),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(live.data.is_empty());
        let tombstoned = storage
            .find_jobs(JobFilter {
                deleted: Some(DeletedFilter::NotNull),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tombstoned.data.len(), 1);

        let err = storage.delete_job(&job.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rename_updates_index_and_detects_collision() {
        let storage = MemoryStorage::new();
        let a = storage
            .create_job(NewJob::new("job-a", JobType::Inline))
            .await
            .unwrap();
        storage
            .create_job(NewJob::new("job-b", JobType::Inline))
            .await
            .unwrap();

        let err = storage
            .update_job(&a.id, JobPatch::default().with_name("job-b"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        storage
            .update_job(&a.id, JobPatch::default().with_name("job-c"))
            .await
            .unwrap();
        assert!(storage.find_job_by_name("job-a").await.unwrap().is_none());
        assert!(storage.find_job_by_name("job-c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_job_excluded_from_listing() {
        let storage = MemoryStorage::new();
        storage
            .create_job(NewJob::new(WATCH_JOB_NAME, JobType::Query))
            .await
            .unwrap();
        storage
            .create_job(NewJob::new("visible", JobType::Inline))
            .await
            .unwrap();

        let page = storage.find_jobs(JobFilter::default()).await.unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].name, "visible");
    }

    #[tokio::test]
    async fn test_find_jobs_filters_by_type_enabled_and_name() {
        let storage = MemoryStorage::new();
        storage
            .create_job(NewJob::new("inline-on", JobType::Inline))
            .await
            .unwrap();
        storage
            .create_job(NewJob::new("inline-off", JobType::Inline).with_enabled(false))
            .await
            .unwrap();
        storage
            .create_job(NewJob::new("query-on", JobType::Query).with_query("SELECT 1"))
            .await
            .unwrap();

        let inline = storage
            .find_jobs(JobFilter {
                job_type: Some(JobType::Inline),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(inline.data.len(), 2);

        let enabled_inline = storage
            .find_jobs(JobFilter {
                job_type: Some(JobType::Inline),
                enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(enabled_inline.data.len(), 1);
        assert_eq!(enabled_inline.data[0].name, "inline-on");

        let by_name = storage
            .find_jobs(JobFilter {
                name: Some("query-on".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_name.data.len(), 1);
        assert_eq!(by_name.data[0].job_type, JobType::Query);
    }

    #[tokio::test]
    async fn test_find_jobs_paginates_in_insertion_order() {
        let storage = MemoryStorage::new();
        for n in 0..5 {
            storage
                .create_job(NewJob::new(format!("job-{n}"), JobType::Inline))
                .await
                .unwrap();
        }

        let page = storage
            .find_jobs(JobFilter {
                page: Some(2),
                page_size: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.last_page, 3);
        let names: Vec<&str> = page.data.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["job-2", "job-3"]);
    }

    #[tokio::test]
    async fn test_job_run_requires_existing_job() {
        let storage = MemoryStorage::new();
        let err = storage
            .create_job_run(NewJobRun {
                job_id: "missing".into(),
                started: Utc::now(),
            })
            .await
            .unwrap_err();
        match err {
            Error::Storage(e) => assert_eq!(e.code, ld_core::StorageErrorCode::InvalidReference),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_job_run_terminal_states_are_exclusive() {
        let storage = MemoryStorage::new();
        let job = storage
            .create_job(NewJob::new("runner", JobType::Inline))
            .await
            .unwrap();
        let run = storage
            .create_job_run(NewJobRun {
                job_id: job.id.clone(),
                started: Utc::now(),
            })
            .await
            .unwrap();
        assert!(run.is_running());

        storage
            .update_job_run(
                &run.id,
                JobRunPatch {
                    completed: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = storage
            .update_job_run(
                &run.id,
                JobRunPatch {
                    failed: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_find_job_runs_filters() {
        let storage = MemoryStorage::new();
        let job = storage
            .create_job(NewJob::new("history", JobType::Inline))
            .await
            .unwrap();

        let early = Utc::now() - chrono::Duration::minutes(10);
        let late = Utc::now();
        let run_a = storage
            .create_job_run(NewJobRun {
                job_id: job.id.clone(),
                started: early,
            })
            .await
            .unwrap();
        storage
            .create_job_run(NewJobRun {
                job_id: job.id.clone(),
                started: late,
            })
            .await
            .unwrap();
        storage
            .update_job_run(
                &run_a.id,
                JobRunPatch {
                    failed: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let failed = storage
            .find_job_runs(JobRunFilter {
                job_id: Some(job.id.clone()),
                status: Some(RunStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.data.len(), 1);
        assert_eq!(failed.data[0].id, run_a.id);

        // Strict inequality: runs started exactly at the bound are excluded.
        let after = storage
            .find_job_runs(JobRunFilter {
                started_after: Some(early),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(after.data.len(), 1);
        assert_eq!(after.data[0].started, late);

        let running = storage
            .find_job_runs(JobRunFilter {
                status: Some(RunStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.data.len(), 1);
    }

    #[tokio::test]
    async fn test_reads_are_detached_copies() {
        let storage = MemoryStorage::new();
        let job = storage
            .create_job(NewJob::new("copy-safe", JobType::Inline))
            .await
            .unwrap();

        let mut read = storage.find_job(&job.id).await.unwrap().unwrap();
        read.name = "mutated".into();

        let again = storage.find_job(&job.id).await.unwrap().unwrap();
        assert_eq!(again.name, "copy-safe");
    }

    #[tokio::test]
    async fn test_execute_query_not_supported() {
        let storage = MemoryStorage::new();
        assert!(!storage.supports_queries());
        let err = storage.execute_query("SELECT 1").await.unwrap_err();
        match err {
            Error::Storage(e) => assert_eq!(e.code, ld_core::StorageErrorCode::NotSupported),
            other => panic!("unexpected error: {other}"),
        }
    }
}
