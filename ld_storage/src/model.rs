//! ABOUTME: Persistent entities for the orchestration core
//! ABOUTME: Control (fleet record), Job (definition), JobRun (execution history)

use chrono::{DateTime, Utc};
use ld_core::{ContextMap, LogLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the system-owned job whose firings drive reset detection.
/// Never surfaced through public listing or lookup.
pub const WATCH_JOB_NAME: &str = "__watch__";

/// Singleton record describing the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Control {
    pub id: String,

    /// Global kill-switch; when false no replica schedules anything.
    pub enabled: bool,

    pub log_level: LogLevel,

    /// Replica identifiers known to be alive.
    pub replicas: Vec<String>,

    /// Subset of `replicas` that must rebuild their schedulers.
    pub stale: Vec<String>,

    /// Opaque token for optimistic concurrency.
    pub version: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating the Control record.
#[derive(Debug, Clone, Default)]
pub struct NewControl {
    pub enabled: bool,
    pub log_level: LogLevel,
    pub replicas: Vec<String>,
    pub stale: Vec<String>,
    pub version: String,
}

/// Partial update of the Control record.
///
/// `version` is the optimistic guard: when present it must equal the stored
/// token or the update conflicts. `set_version` rotates the stored token,
/// forcing concurrent writers into conflict.
#[derive(Debug, Clone, Default)]
pub struct ControlPatch {
    pub enabled: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub replicas: Option<Vec<String>>,
    pub stale: Option<Vec<String>>,
    pub version: Option<String>,
    pub set_version: Option<String>,
}

/// Execution binding of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Function registered in this replica's inline registry, by job name.
    Inline,
    /// Named method dispatched on the host-provided handler.
    Method,
    /// Persisted SQL string executed through the storage back end.
    Query,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Method => "method",
            Self::Query => "query",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled or ad-hoc job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    /// Unique among non-deleted jobs.
    pub name: String,

    #[serde(rename = "type")]
    pub job_type: JobType,

    pub enabled: bool,

    /// Optional 5- or 6-field cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Query string; an encryption envelope when a query secret is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Static execution context merged into every firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextMap>,

    /// Record a JobRun per firing.
    pub persist: bool,

    /// Suppress job lifecycle log lines.
    pub silent: bool,

    /// Soft-deletion tombstone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn is_watch_job(&self) -> bool {
        self.name == WATCH_JOB_NAME
    }
}

/// Fields for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub job_type: JobType,
    pub enabled: bool,
    pub cron: Option<String>,
    pub query: Option<String>,
    pub context: Option<ContextMap>,
    pub persist: bool,
    pub silent: bool,
}

impl NewJob {
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            name: name.into(),
            job_type,
            enabled: true,
            cron: None,
            query: None,
            context: None,
            persist: false,
            silent: false,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// Partial update of a job. Doubled options distinguish "leave unchanged"
/// (outer `None`) from "clear the field" (inner `None`).
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub job_type: Option<JobType>,
    pub enabled: Option<bool>,
    pub cron: Option<Option<String>>,
    pub query: Option<Option<String>>,
    pub context: Option<Option<ContextMap>>,
    pub persist: Option<bool>,
    pub silent: Option<bool>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.job_type.is_none()
            && self.enabled.is_none()
            && self.cron.is_none()
            && self.query.is_none()
            && self.context.is_none()
            && self.persist.is_none()
            && self.silent.is_none()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(Some(cron.into()));
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(Some(query.into()));
        self
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = Some(Some(context));
        self
    }
}

/// One recorded execution of a job with `persist = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    pub started: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<DateTime<Utc>>,

    /// Arbitrary serializable value, or the serialized Lens frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    /// A run with neither terminal timestamp is still running.
    pub fn is_running(&self) -> bool {
        self.completed.is_none() && self.failed.is_none()
    }
}

/// Fields for creating a job run.
#[derive(Debug, Clone)]
pub struct NewJobRun {
    pub job_id: String,
    pub started: DateTime<Utc>,
}

/// Terminal update of a job run.
#[derive(Debug, Clone, Default)]
pub struct JobRunPatch {
    pub completed: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

/// Tri-state tombstone filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedFilter {
    /// Only rows without a tombstone.
    Null,
    /// Only tombstoned rows.
    NotNull,
}

/// Filter and pagination options for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub name: Option<String>,
    pub job_type: Option<JobType>,
    pub enabled: Option<bool>,
    /// Absent returns all rows, deleted or not.
    pub deleted: Option<DeletedFilter>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// Terminal-state filter for job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Running,
}

/// Filter and pagination options for job run listings.
#[derive(Debug, Clone, Default)]
pub struct JobRunFilter {
    pub job_id: Option<String>,
    /// Strict inequality.
    pub started_after: Option<DateTime<Utc>>,
    /// Strict inequality.
    pub started_before: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// One page of a filtered listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub last_page: u32,
}

/// Slice `items` into a 1-based page, clamping `page` to `[1, last_page]`.
pub fn paginate<T>(items: Vec<T>, page: Option<u32>, page_size: Option<u32>) -> Paginated<T> {
    let page_size = page_size.filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE);
    let total = items.len() as u64;
    let last_page = ((total + page_size as u64 - 1) / page_size as u64).max(1) as u32;
    let page = page.unwrap_or(1).clamp(1, last_page);

    let start = ((page - 1) * page_size) as usize;
    let data = items
        .into_iter()
        .skip(start)
        .take(page_size as usize)
        .collect();

    Paginated {
        data,
        total,
        page,
        page_size,
        last_page,
    }
}
