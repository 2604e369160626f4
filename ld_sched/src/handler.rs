//! ABOUTME: Method-dispatch contract for host applications and its registry form
//! ABOUTME: Dispatch is a table lookup; registration enforces the allow-list

use crate::{JobFn, JobFuture, JobOutput};
use async_trait::async_trait;
use ld_core::{ContextMap, Error, Lens, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::debug;

/// Identifiers a handler must never dispatch, in both the source dialect's
/// spelling and this crate's.
const RESERVED_METHOD_NAMES: &[&str] = &[
    "constructor",
    "executeMethod",
    "execute_method",
    "hasMethod",
    "has_method",
    "getAvailableMethods",
    "get_available_methods",
    "available_methods",
    "self",
    "super",
    "crate",
];

fn method_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,100}$").expect("static regex"))
}

/// Host-provided dispatcher for `method` jobs. The method name is the job
/// name; implementations restrict the dispatchable set to an explicit
/// whitelist and never expose private or framework methods.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn execute_method(
        &self,
        method: &str,
        context: &ContextMap,
        lens: &Lens,
    ) -> Result<JobOutput>;

    fn has_method(&self, method: &str) -> bool {
        let _ = method;
        false
    }

    fn available_methods(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Table-backed [`MethodHandler`]: registration inserts `(name, callable)`
/// and dispatch is a lookup, so the table itself is the whitelist.
#[derive(Default)]
pub struct HandlerRegistry {
    methods: RwLock<HashMap<String, JobFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named method. Rejects malformed names, names starting
    /// with `_`, and reserved identifiers.
    pub fn register<F>(&self, name: impl Into<String>, method: F) -> Result<()>
    where
        F: Fn(ContextMap, Lens) -> JobFuture + Send + Sync + 'static,
    {
        let name = name.into();
        validate_method_name(&name)?;
        self.methods
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.clone(), Arc::new(method));
        debug!(method = %name, "Registered handler method");
        Ok(())
    }

    /// Remove a method; true when something was removed.
    pub fn unregister(&self, name: &str) -> bool {
        self.methods
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some()
    }

    fn lookup(&self, name: &str) -> Option<JobFn> {
        self.methods
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl MethodHandler for HandlerRegistry {
    async fn execute_method(
        &self,
        method: &str,
        context: &ContextMap,
        lens: &Lens,
    ) -> Result<JobOutput> {
        let callable = self
            .lookup(method)
            .ok_or_else(|| Error::not_found("Method", method))?;
        callable(context.clone(), lens.clone()).await
    }

    fn has_method(&self, method: &str) -> bool {
        self.lookup(method).is_some()
    }

    fn available_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

fn validate_method_name(name: &str) -> Result<()> {
    if name.starts_with('_') {
        return Err(Error::validation(format!(
            "method name '{name}' must not start with an underscore"
        )));
    }
    if RESERVED_METHOD_NAMES.contains(&name) {
        return Err(Error::validation(format!(
            "method name '{name}' is reserved"
        )));
    }
    if !method_name_pattern().is_match(name) {
        return Err(Error::validation(
            "method name must match [A-Za-z0-9_-]{1,100}",
        ));
    }
    Ok(())
}
