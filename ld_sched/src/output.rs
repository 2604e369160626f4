//! ABOUTME: Job return values and the rules for persisting them
//! ABOUTME: A Lens return or an empty-handed run falls back to the captured frames

use ld_core::{is_truthy, Lens};
use serde_json::Value;

/// What a job execution hands back.
#[derive(Debug, Clone)]
pub enum JobOutput {
    /// The execution produced nothing.
    None,
    /// An arbitrary serializable value.
    Value(Value),
    /// The execution returned its Lens directly.
    Lens(Lens),
}

impl From<Value> for JobOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Lens> for JobOutput {
    fn from(lens: Lens) -> Self {
        Self::Lens(lens)
    }
}

/// Decide what lands in the JobRun's `result` column.
///
/// A returned Lens always wins with its own frames. A truthy value is kept
/// verbatim. An empty-handed or falsy return falls back to the pipeline
/// lens when it captured anything; otherwise the value passes through
/// unchanged.
pub fn serialize_result(output: &JobOutput, lens: &Lens) -> Option<Value> {
    match output {
        JobOutput::Lens(returned) => Some(Value::String(returned.frames())),
        JobOutput::Value(value) if is_truthy(value) => Some(value.clone()),
        _ if !lens.is_empty() => Some(Value::String(lens.frames())),
        JobOutput::Value(value) => Some(value.clone()),
        JobOutput::None => None,
    }
}
