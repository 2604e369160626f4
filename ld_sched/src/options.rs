//! ABOUTME: Manager configuration record with construction-time validation
//! ABOUTME: Storage and logger are required; everything else has a safe default

use crate::handler::MethodHandler;
use ld_cache::Cache;
use ld_core::{Error, Logger, Result};
use ld_storage::Storage;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Environment variable consulted for a default replica identifier.
pub const REPLICA_ID_ENV: &str = "LUDARI_REPLICA_ID";

pub(crate) const MIN_WATCH_INTERVAL_SECS: u32 = 1;
pub(crate) const MAX_WATCH_INTERVAL_SECS: u32 = 5;
pub(crate) const DEFAULT_WATCH_INTERVAL_SECS: u32 = 5;

fn uuid_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("static regex")
    })
}

fn replica_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{8,}$").expect("static regex"))
}

pub(crate) fn is_valid_replica_id(id: &str) -> bool {
    uuid_pattern().is_match(id) || replica_id_pattern().is_match(id)
}

/// Where the effective replica identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicaIdSource {
    Configured,
    Environment,
    Generated,
}

/// Configuration for constructing a [`crate::Manager`].
pub struct ManagerOptions {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) cache: Option<Arc<dyn Cache>>,
    pub(crate) handler: Option<Arc<dyn MethodHandler>>,
    pub(crate) query_secret: Option<String>,
    pub(crate) replica_id: Option<String>,
    pub(crate) enabled: bool,
    pub(crate) watch_interval: u32,
    pub(crate) release_locks_on_shutdown: bool,
}

impl ManagerOptions {
    pub fn new(storage: Arc<dyn Storage>, logger: Arc<dyn Logger>) -> Self {
        Self {
            storage,
            logger,
            cache: None,
            handler: None,
            query_secret: None,
            replica_id: None,
            enabled: false,
            watch_interval: DEFAULT_WATCH_INTERVAL_SECS,
            release_locks_on_shutdown: true,
        }
    }

    /// Shared cache; the in-process [`ld_cache::MemoryCache`] when absent.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Host dispatcher for `method` jobs.
    pub fn with_handler(mut self, handler: Arc<dyn MethodHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Passphrase for the query envelope; validated at construction.
    pub fn with_query_secret(mut self, secret: impl Into<String>) -> Self {
        self.query_secret = Some(secret.into());
        self
    }

    pub fn with_replica_id(mut self, replica_id: impl Into<String>) -> Self {
        self.replica_id = Some(replica_id.into());
        self
    }

    /// Whether this replica schedules jobs at all. Defaults to false.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Watch-job cadence in seconds, clamped to `[1, 5]`.
    pub fn with_watch_interval(mut self, seconds: u32) -> Self {
        self.watch_interval = seconds;
        self
    }

    pub fn with_release_locks_on_shutdown(mut self, release: bool) -> Self {
        self.release_locks_on_shutdown = release;
        self
    }

    /// Resolve the replica identity: configured value, then the
    /// `LUDARI_REPLICA_ID` environment variable, then a generated
    /// `<hostname>-<pid>-<random>` identifier.
    pub(crate) fn resolve_replica_id(&self) -> Result<(String, ReplicaIdSource)> {
        if let Some(id) = &self.replica_id {
            if !is_valid_replica_id(id) {
                return Err(Error::validation(
                    "replica id must be a UUID or match [A-Za-z0-9_-]{8,}",
                ));
            }
            return Ok((id.clone(), ReplicaIdSource::Configured));
        }

        if let Ok(id) = std::env::var(REPLICA_ID_ENV) {
            if !id.is_empty() {
                if !is_valid_replica_id(&id) {
                    return Err(Error::validation(format!(
                        "{REPLICA_ID_ENV} must be a UUID or match [A-Za-z0-9_-]{{8,}}"
                    )));
                }
                return Ok((id, ReplicaIdSource::Environment));
            }
        }

        Ok((generate_replica_id(), ReplicaIdSource::Generated))
    }
}

/// `<hostname>-<pid>-<random8>`, squeezed into the allowed alphabet.
fn generate_replica_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "replica".to_string());
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}
