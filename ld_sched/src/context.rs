//! ABOUTME: Recognized execution-context keys and their coercion rules
//! ABOUTME: distributed (lock opt-in), ttl (lock seconds), runOnce (disable after firing)

use ld_core::{is_truthy, ContextMap};

/// Lock lease applied when a distributed context does not name one.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;

/// Whether this firing opted into cross-replica exclusion.
pub fn is_distributed(context: &ContextMap) -> bool {
    context.get("distributed").map_or(false, is_truthy)
}

/// Whether the job disables itself after this firing.
pub fn is_run_once(context: &ContextMap) -> bool {
    context.get("runOnce").map_or(false, is_truthy)
}

/// Lock lease in seconds; non-numeric or missing values use the default.
pub fn lock_ttl_secs(context: &ContextMap) -> u64 {
    context
        .get("ttl")
        .and_then(|v| v.as_f64())
        .filter(|ttl| *ttl > 0.0)
        .map(|ttl| ttl.round() as u64)
        .unwrap_or(DEFAULT_LOCK_TTL_SECS)
}

/// Merge the cached dynamic context over the static one; dynamic wins on
/// overlapping keys.
pub fn merge_dynamic(static_context: ContextMap, dynamic: ContextMap) -> ContextMap {
    let mut merged = static_context;
    for (key, value) in dynamic {
        merged.insert(key, value);
    }
    merged
}
