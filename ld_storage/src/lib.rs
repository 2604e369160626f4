//! ABOUTME: Storage contract for Control, Job, and JobRun persistence
//! ABOUTME: Typed CRUD with optimistic versioning on Control and soft-deleted jobs

use async_trait::async_trait;
use ld_core::{Result, StorageError};
use serde_json::Value;

pub mod memory;
pub mod model;

pub use memory::MemoryStorage;
pub use model::*;

/// Persistence contract consumed by the orchestration core.
///
/// Every read hands back a detached copy of persisted state: mutating a
/// returned entity never changes what the store holds.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the singleton Control record, if created.
    async fn get_control(&self) -> Result<Option<Control>>;

    /// Create the Control record. Conflicts if one already exists.
    async fn create_control(&self, data: NewControl) -> Result<Control>;

    /// Patch the Control record. When the patch carries a `version` guard
    /// that differs from the stored token, the update conflicts.
    async fn update_control(&self, id: &str, patch: ControlPatch) -> Result<Control>;

    /// Filtered, paginated job listing. The reserved watch job is always
    /// excluded from results.
    async fn find_jobs(&self, filter: JobFilter) -> Result<Paginated<Job>>;

    /// Fetch a job by id. Tombstoned rows read as absent.
    async fn find_job(&self, id: &str) -> Result<Option<Job>>;

    /// Fetch a job by name. Tombstoned rows read as absent.
    async fn find_job_by_name(&self, name: &str) -> Result<Option<Job>>;

    /// Create a job. Conflicts on a duplicate live name.
    async fn create_job(&self, data: NewJob) -> Result<Job>;

    /// Patch a job. Renaming onto another live job's name conflicts.
    async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job>;

    /// Soft-delete a job by stamping its tombstone.
    async fn delete_job(&self, id: &str) -> Result<()>;

    /// Record the start of an execution. Fails with `INVALID_REFERENCE`
    /// when `job_id` does not reference a stored job.
    async fn create_job_run(&self, data: NewJobRun) -> Result<JobRun>;

    /// Terminal update of an execution record.
    async fn update_job_run(&self, id: &str, patch: JobRunPatch) -> Result<JobRun>;

    /// Filtered, paginated run history.
    async fn find_job_runs(&self, filter: JobRunFilter) -> Result<Paginated<JobRun>>;

    /// Execute a raw query string. Back ends without query support keep the
    /// default, which fails with `NOT_SUPPORTED`.
    async fn execute_query(&self, query: &str) -> Result<Value> {
        let _ = query;
        Err(StorageError::not_supported("storage back end does not support raw queries").into())
    }

    /// Whether `execute_query` is implemented. Query-type jobs are refused
    /// when this is false.
    fn supports_queries(&self) -> bool {
        false
    }
}
