// ABOUTME: Timestamp helpers shared across the workspace.
// ABOUTME: Persisted times are chrono UTC; monotonic ages use Instant at call sites.
use chrono::{DateTime, Utc};

/// Current UTC time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current UTC time as an RFC3339 / ISO-8601 string
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}
