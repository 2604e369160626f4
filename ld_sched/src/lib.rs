//! ABOUTME: Multi-replica cron job orchestration engine
//! ABOUTME: Manager lifecycle, fleet synchronization, scheduling, and execution

use futures_util::future::BoxFuture;
use std::sync::Arc;

pub mod context;
pub mod handler;
pub mod manager;
pub mod options;
pub mod output;

mod api;
mod control;
mod execute;
mod scheduler;
mod watchdog;

pub use handler::{HandlerRegistry, MethodHandler};
pub use manager::Manager;
pub use options::ManagerOptions;
pub use output::{serialize_result, JobOutput};

// Re-exported so hosts can depend on this crate alone.
pub use ld_cache::{Cache, LockAcquisition, LockOptions, MemoryCache};
pub use ld_core::{
    is_truthy, ContextMap, Error, Frame, FrameLevel, Lens, LogLevel, Logger, Result,
    TracingLogger,
};
pub use ld_storage::{
    DeletedFilter, Job, JobFilter, JobPatch, JobRun, JobRunFilter, JobType, MemoryStorage, NewJob,
    Paginated, RunStatus, Storage, WATCH_JOB_NAME,
};

/// Future returned by a job execution binding.
pub type JobFuture = BoxFuture<'static, Result<JobOutput>>;

/// An execution binding: inline functions, dispatched methods, and query
/// closures all share this shape.
pub type JobFn = Arc<dyn Fn(ContextMap, Lens) -> JobFuture + Send + Sync>;
