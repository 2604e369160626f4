//! ABOUTME: Core types, errors, IDs, logging, and the per-execution Lens
//! ABOUTME: Foundation crate used by all other ludari components

pub mod error;
pub mod id;
pub mod lens;
pub mod log;
pub mod telemetry;
pub mod time;
pub mod value;

pub use error::{Error, Result, StorageError, StorageErrorCode};
pub use id::Id;
pub use lens::{Frame, FrameLevel, Lens};
pub use log::{LogLevel, Logger, TracingLogger};
pub use time::{now, now_iso8601};
pub use value::{is_truthy, ContextMap};
