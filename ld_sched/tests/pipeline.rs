//! ABOUTME: Execution-pipeline scenarios: exclusion, context merging, gating, retries
//! ABOUTME: Exercises the Manager against shared in-memory collaborators

use async_trait::async_trait;
use ld_sched::{
    Job, JobFilter, JobOutput, JobPatch, JobRun, JobRunFilter, Logger, Manager, ManagerOptions,
    MemoryCache, MemoryStorage, NewJob, Paginated, Storage, TracingLogger,
};
use ld_core::ContextMap;
use ld_storage::{Control, ControlPatch, JobRunPatch, JobType, NewControl, NewJobRun};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn manager(storage: Arc<dyn Storage>, cache: Arc<MemoryCache>, replica: &str) -> Manager {
    let options = ManagerOptions::new(storage, Arc::new(TracingLogger))
        .with_cache(cache)
        .with_replica_id(replica)
        .with_enabled(true)
        .with_watch_interval(1);
    Manager::new(options).expect("manager options are valid")
}

/// Logger that captures emitted lines for assertions.
#[derive(Default)]
struct CapturingLogger {
    lines: Mutex<Vec<(String, String)>>,
}

impl CapturingLogger {
    fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().unwrap().clone()
    }

    fn push(&self, level: &str, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((level.to_string(), message.to_string()));
    }
}

impl Logger for CapturingLogger {
    fn error(&self, message: &str) {
        self.push("error", message);
    }
    fn warn(&self, message: &str) {
        self.push("warn", message);
    }
    fn log(&self, message: &str) {
        self.push("info", message);
    }
    fn debug(&self, message: &str) {
        self.push("debug", message);
    }
}

/// Storage wrapper that injects version conflicts into the first few
/// control updates, then behaves normally.
struct ConflictingStorage {
    inner: MemoryStorage,
    conflicts_left: Mutex<u32>,
}

impl ConflictingStorage {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStorage::new(),
            conflicts_left: Mutex::new(conflicts),
        }
    }
}

#[async_trait]
impl Storage for ConflictingStorage {
    async fn get_control(&self) -> ld_core::Result<Option<Control>> {
        self.inner.get_control().await
    }
    async fn create_control(&self, data: NewControl) -> ld_core::Result<Control> {
        self.inner.create_control(data).await
    }
    async fn update_control(&self, id: &str, patch: ControlPatch) -> ld_core::Result<Control> {
        {
            let mut left = self.conflicts_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ld_core::Error::conflict("control version mismatch"));
            }
        }
        self.inner.update_control(id, patch).await
    }
    async fn find_jobs(&self, filter: JobFilter) -> ld_core::Result<Paginated<Job>> {
        self.inner.find_jobs(filter).await
    }
    async fn find_job(&self, id: &str) -> ld_core::Result<Option<Job>> {
        self.inner.find_job(id).await
    }
    async fn find_job_by_name(&self, name: &str) -> ld_core::Result<Option<Job>> {
        self.inner.find_job_by_name(name).await
    }
    async fn create_job(&self, data: NewJob) -> ld_core::Result<Job> {
        self.inner.create_job(data).await
    }
    async fn update_job(&self, id: &str, patch: JobPatch) -> ld_core::Result<Job> {
        self.inner.update_job(id, patch).await
    }
    async fn delete_job(&self, id: &str) -> ld_core::Result<()> {
        self.inner.delete_job(id).await
    }
    async fn create_job_run(&self, data: NewJobRun) -> ld_core::Result<JobRun> {
        self.inner.create_job_run(data).await
    }
    async fn update_job_run(&self, id: &str, patch: JobRunPatch) -> ld_core::Result<JobRun> {
        self.inner.update_job_run(id, patch).await
    }
    async fn find_job_runs(&self, filter: JobRunFilter) -> ld_core::Result<Paginated<JobRun>> {
        self.inner.find_job_runs(filter).await
    }
}

// Property: for a distributed job, at most one of two racing replicas
// executes a given firing.
#[tokio::test]
async fn distributed_firings_are_mutually_exclusive() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let cache = Arc::new(MemoryCache::new());
    let r1 = manager(storage.clone(), cache.clone(), "replica-ex1");
    let r2 = manager(storage.clone(), cache.clone(), "replica-ex2");
    r1.initialize().await.unwrap();
    r2.initialize().await.unwrap();

    let executions = Arc::new(AtomicU32::new(0));
    for replica in [&r1, &r2] {
        let executions = executions.clone();
        replica
            .register_inline_job("exclusive-job", move |_ctx, _lens| {
                let executions = executions.clone();
                Box::pin(async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    // Hold the lock long enough for the loser to observe it.
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok(JobOutput::None)
                })
            })
            .await
            .unwrap();
    }

    let mut context = ContextMap::new();
    context.insert("distributed".into(), json!(true));
    context.insert("ttl".into(), json!(30));
    let job = r1
        .create_job(NewJob::new("exclusive-job", JobType::Inline).with_context(context))
        .await
        .unwrap();

    let (a, b) = tokio::join!(r1.run_job(&job.id), r2.run_job(&job.id));
    a.unwrap();
    b.unwrap();

    assert_eq!(
        executions.load(Ordering::SeqCst),
        1,
        "exactly one replica may execute a distributed firing"
    );

    r1.destroy().await;
    r2.destroy().await;
}

// Dynamic context merges over the static context, and the dynamic side
// wins on overlapping keys.
#[tokio::test]
async fn dynamic_context_overrides_static() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = Arc::new(MemoryCache::new());
    let mgr = manager(storage.clone(), cache, "replica-ctx");
    mgr.initialize().await.unwrap();

    let seen = Arc::new(Mutex::new(ContextMap::new()));
    let seen_in_job = seen.clone();
    mgr.register_inline_job("merger", move |ctx, _lens| {
        let seen = seen_in_job.clone();
        Box::pin(async move {
            *seen.lock().unwrap() = ctx;
            Ok(JobOutput::None)
        })
    })
    .await
    .unwrap();

    let mut static_ctx = ContextMap::new();
    static_ctx.insert("distributed".into(), json!(true));
    static_ctx.insert("region".into(), json!("us"));
    static_ctx.insert("cursor".into(), json!("start"));
    let job = mgr
        .create_job(NewJob::new("merger", JobType::Inline).with_context(static_ctx))
        .await
        .unwrap();

    let mut dynamic = ContextMap::new();
    dynamic.insert("cursor".into(), json!("page-9"));
    dynamic.insert("batch".into(), json!(3));
    mgr.set_job_context("merger", &dynamic, None).await.unwrap();

    mgr.run_job(&job.id).await.unwrap();

    let observed = seen.lock().unwrap().clone();
    assert_eq!(observed.get("region"), Some(&json!("us")));
    assert_eq!(observed.get("cursor"), Some(&json!("page-9")));
    assert_eq!(observed.get("batch"), Some(&json!(3)));

    mgr.delete_job_context("merger").await.unwrap();
    assert!(mgr.get_job_context("merger").await.unwrap().is_none());

    // Clearing the static context through an update also drops whatever
    // dynamic context the cache still holds for the job.
    mgr.set_job_context("merger", &dynamic, None).await.unwrap();
    mgr.update_job(
        &job.id,
        JobPatch {
            context: Some(None),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(mgr.get_job_context("merger").await.unwrap().is_none());

    mgr.destroy().await;
}

// Lifecycle lines respect the fleet log level and the per-job silent flag.
#[tokio::test]
async fn lifecycle_logging_is_gated() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = Arc::new(MemoryCache::new());
    let logger = Arc::new(CapturingLogger::default());
    let mgr = Manager::new(
        ManagerOptions::new(storage.clone(), logger.clone())
            .with_cache(cache)
            .with_replica_id("replica-logs")
            .with_enabled(true)
            .with_watch_interval(1),
    )
    .unwrap();
    mgr.initialize().await.unwrap();

    mgr.register_inline_job("loud-job", |_ctx, _lens| {
        Box::pin(async { Ok(JobOutput::None) })
    })
    .await
    .unwrap();
    mgr.register_inline_job("quiet-job", |_ctx, _lens| {
        Box::pin(async { Ok(JobOutput::None) })
    })
    .await
    .unwrap();

    let loud = mgr
        .create_job(NewJob::new("loud-job", JobType::Inline))
        .await
        .unwrap();
    let quiet = mgr
        .create_job(NewJob::new("quiet-job", JobType::Inline).with_silent(true))
        .await
        .unwrap();

    mgr.run_job(&loud.id).await.unwrap();
    mgr.run_job(&quiet.id).await.unwrap();

    let lines = logger.lines();
    assert!(lines
        .iter()
        .any(|(level, msg)| level == "info" && msg == "Job started: loud-job"));
    assert!(lines
        .iter()
        .any(|(level, msg)| level == "info" && msg == "Job completed: loud-job"));
    assert!(!lines.iter().any(|(_, msg)| msg.contains("quiet-job")));

    // Drop the fleet log level below info; lifecycle lines disappear.
    let control = storage.get_control().await.unwrap().unwrap();
    storage
        .update_control(
            &control.id,
            ControlPatch {
                log_level: Some(ld_core::LogLevel::Error),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    mgr.run_job(&loud.id).await.unwrap();
    let after: Vec<_> = logger
        .lines()
        .into_iter()
        .skip(lines.len())
        .filter(|(_, msg)| msg.contains("loud-job"))
        .collect();
    assert!(after.is_empty(), "info lines must be gated at error level");

    mgr.destroy().await;
}

// The control retry helper absorbs transient version conflicts.
#[tokio::test]
async fn purge_control_retries_through_conflicts() {
    let storage = Arc::new(ConflictingStorage::new(0));
    let cache = Arc::new(MemoryCache::new());
    let mgr = manager(storage.clone(), cache, "replica-retry");
    mgr.initialize().await.unwrap();

    // Two conflicts, then success: still inside the retry allowance.
    *storage.conflicts_left.lock().unwrap() = 2;
    mgr.purge_control().await.unwrap();

    let control = storage.get_control().await.unwrap().unwrap();
    assert_eq!(control.replicas, vec!["replica-retry".to_string()]);
    assert!(control.stale.is_empty());

    mgr.destroy().await;
}

// Batch counters pass through the manager surface.
#[tokio::test]
async fn batch_counters_round_trip() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = Arc::new(MemoryCache::new());
    let mgr = manager(storage, cache, "replica-batch");
    mgr.initialize().await.unwrap();

    assert_eq!(mgr.get_batch("importer").await.unwrap(), 0);
    assert_eq!(mgr.increment_batch("importer").await.unwrap(), 1);
    assert_eq!(mgr.increment_batch("importer").await.unwrap(), 2);
    assert_eq!(mgr.get_batch("importer").await.unwrap(), 2);
    mgr.reset_batch("importer").await.unwrap();
    assert_eq!(mgr.get_batch("importer").await.unwrap(), 0);

    mgr.destroy().await;
}

// A disabled or deleted job never reaches its execution.
#[tokio::test]
async fn disabled_and_deleted_jobs_do_not_execute() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = Arc::new(MemoryCache::new());
    let mgr = manager(storage.clone(), cache, "replica-gate");
    mgr.initialize().await.unwrap();

    let executions = Arc::new(AtomicU32::new(0));
    let executions_in_job = executions.clone();
    mgr.register_inline_job("gated", move |_ctx, _lens| {
        let executions = executions_in_job.clone();
        Box::pin(async move {
            executions.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutput::None)
        })
    })
    .await
    .unwrap();

    let job = mgr
        .create_job(NewJob::new("gated", JobType::Inline).with_persist(true))
        .await
        .unwrap();

    mgr.disable_job(&job.id).await.unwrap();
    mgr.run_job(&job.id).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 0);

    // No run record was created either: the pipeline bailed before persist.
    let runs = mgr
        .list_job_runs(JobRunFilter {
            job_id: Some(job.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(runs.data.is_empty());

    mgr.enable_job(&job.id).await.unwrap();
    mgr.run_job(&job.id).await.unwrap();
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    mgr.delete_job(&job.id).await.unwrap();
    let err = mgr.run_job(&job.id).await.unwrap_err();
    assert!(err.is_not_found());

    mgr.destroy().await;
}

// Deleting a job stops its local timer.
#[tokio::test]
async fn delete_job_stops_firing() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = Arc::new(MemoryCache::new());
    let mgr = manager(storage.clone(), cache, "replica-del");
    mgr.initialize().await.unwrap();

    let executions = Arc::new(AtomicU32::new(0));
    let executions_in_job = executions.clone();
    mgr.register_inline_job("short-lived", move |_ctx, _lens| {
        let executions = executions_in_job.clone();
        Box::pin(async move {
            executions.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutput::None)
        })
    })
    .await
    .unwrap();

    let job = mgr
        .create_job(NewJob::new("short-lived", JobType::Inline).with_cron("* * * * * *"))
        .await
        .unwrap();

    let mut fired = false;
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if executions.load(Ordering::SeqCst) > 0 {
            fired = true;
            break;
        }
    }
    assert!(fired);

    mgr.delete_job(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = executions.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(executions.load(Ordering::SeqCst), settled);

    mgr.destroy().await;
}

// Query results that are truthy persist verbatim in the run record.
#[tokio::test]
async fn truthy_results_persist_verbatim() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = Arc::new(MemoryCache::new());
    let mgr = manager(storage.clone(), cache, "replica-result");
    mgr.initialize().await.unwrap();

    mgr.register_inline_job("counter", |_ctx, _lens| {
        Box::pin(async { Ok(JobOutput::Value(json!({ "swept": 42 }))) })
    })
    .await
    .unwrap();

    let job = mgr
        .create_job(NewJob::new("counter", JobType::Inline).with_persist(true))
        .await
        .unwrap();
    mgr.run_job(&job.id).await.unwrap();

    let runs = mgr
        .list_job_runs(JobRunFilter {
            job_id: Some(job.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.data.len(), 1);
    assert_eq!(runs.data[0].result, Some(json!({ "swept": 42 })));

    mgr.destroy().await;
}
