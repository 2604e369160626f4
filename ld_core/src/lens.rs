//! ABOUTME: Per-execution frame buffer for structured job logs and metrics
//! ABOUTME: Serialized frames become the persisted JobRun result when the job returns nothing

use crate::error::{Error, Result};
use crate::time::now_iso8601;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Severity attached to a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameLevel {
    Error,
    #[serde(alias = "warning")]
    Warn,
    Info,
    Debug,
    Metric,
}

/// One captured event. Only `title` is required; metric fields are set by
/// `capture_metric`, and unrecognized keys round-trip through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<FrameLevel>,

    #[serde(rename = "metricName", default, skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,

    #[serde(rename = "metricValue", default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,

    #[serde(rename = "metricUnit", default, skip_serializing_if = "Option::is_none")]
    pub metric_unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Frame {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_level(mut self, level: FrameLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Growable, thread-safe frame buffer shared between a running job and the
/// execution pipeline. Clones share the underlying buffer.
#[derive(Debug, Clone, Default)]
pub struct Lens {
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl Lens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a frame. The only failure mode is a missing or empty title.
    pub fn capture(&self, mut frame: Frame) -> Result<()> {
        if frame.title.trim().is_empty() {
            return Err(Error::validation("frame title must not be empty"));
        }
        if frame.timestamp.is_none() {
            frame.timestamp = Some(now_iso8601());
        }
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(frame);
        Ok(())
    }

    /// Capture a structured error: message, source chain, and type name.
    pub fn capture_error<E>(&self, title: impl Into<String>, error: &E) -> Result<()>
    where
        E: std::error::Error,
    {
        let mut stack = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }

        let mut frame = Frame::new(title)
            .with_message(error.to_string())
            .with_level(FrameLevel::Error)
            .with_extra("name", Value::String(std::any::type_name::<E>().to_string()));
        if !stack.is_empty() {
            frame = frame.with_extra("stack", Value::String(stack.join("\n")));
        }
        self.capture(frame)
    }

    /// Capture an error given only its message text.
    pub fn capture_error_text(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<()> {
        self.capture(
            Frame::new(title)
                .with_message(message)
                .with_level(FrameLevel::Error),
        )
    }

    pub fn capture_info(
        &self,
        message: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<()> {
        self.capture(
            Frame::new(title)
                .with_message(message)
                .with_level(FrameLevel::Info),
        )
    }

    pub fn capture_warn(
        &self,
        message: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<()> {
        self.capture(
            Frame::new(title)
                .with_message(message)
                .with_level(FrameLevel::Warn),
        )
    }

    pub fn capture_debug(
        &self,
        message: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<()> {
        self.capture(
            Frame::new(title)
                .with_message(message)
                .with_level(FrameLevel::Debug),
        )
    }

    /// Capture a metric sample. The frame title becomes `Metric: <name>`.
    pub fn capture_metric(
        &self,
        name: impl Into<String>,
        value: f64,
        unit: Option<&str>,
    ) -> Result<()> {
        let name = name.into();
        let mut frame = Frame::new(format!("Metric: {}", name)).with_level(FrameLevel::Metric);
        frame.metric_name = Some(name);
        frame.metric_value = Some(value);
        frame.metric_unit = unit.map(str::to_string);
        self.capture(frame)
    }

    /// Serialize the captured frames as a single JSON array.
    pub fn frames(&self) -> String {
        let frames = self
            .frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_string(&*frames).unwrap_or_else(|_| "[]".to_string())
    }

    /// Defensive copy of the frame sequence.
    pub fn frame_array(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    pub fn frame_count(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
