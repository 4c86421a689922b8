//! Named units of work and hooks.
//!
//! Runs refer to their work function and hooks by key, and the persisted request
//! config stores only those keys. Resume resolves them again through the registry
//! the resuming factory was built with.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use batchforge_core::{Args, INDEX_KEY, RecordStatus};

use crate::state::SharedState;

/// One asynchronous unit of work. Produces zero or more payloads per call.
#[async_trait]
pub trait WorkFn: Send + Sync {
    async fn call(&self, args: Args) -> anyhow::Result<Vec<JsonValue>>;
}

#[async_trait]
impl<F, Fut> WorkFn for F
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<JsonValue>>> + Send + 'static,
{
    async fn call(&self, args: Args) -> anyhow::Result<Vec<JsonValue>> {
        (self)(args).await
    }
}

/// Runs once per produced payload. `Some(Duplicate)` or `Some(Filtered)` reclassify the
/// invocation; anything else leaves it completed.
pub type CompletionHook = Arc<dyn Fn(&JsonValue, &SharedState) -> Option<RecordStatus> + Send + Sync>;

/// Runs once per failed invocation with the error text.
pub type ErrorHook = Arc<dyn Fn(&str, &SharedState) + Send + Sync>;

/// A registered work function and its optional declared parameter list.
#[derive(Clone)]
pub struct WorkSpec {
    pub key: String,
    params: Option<BTreeSet<String>>,
    func: Arc<dyn WorkFn>,
}

impl WorkSpec {
    pub fn func(&self) -> Arc<dyn WorkFn> {
        self.func.clone()
    }

    pub fn params(&self) -> Option<impl Iterator<Item = &str>> {
        self.params.as_ref().map(|p| p.iter().map(String::as_str))
    }

    /// Reject records carrying arguments the work function did not declare.
    pub fn check_args(&self, record: &Args) -> Result<(), String> {
        let Some(params) = &self.params else {
            return Ok(());
        };
        let unknown: Vec<&str> = record
            .keys()
            .map(String::as_str)
            .filter(|k| *k != INDEX_KEY && !params.contains(*k))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "work '{}' does not accept argument(s): {}",
                self.key,
                unknown.join(", ")
            ))
        }
    }
}

impl fmt::Debug for WorkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkSpec")
            .field("key", &self.key)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Work function and hooks resolved for one run.
#[derive(Clone)]
pub struct Resolved {
    pub work: WorkSpec,
    pub on_complete: Vec<CompletionHook>,
    pub on_error: Vec<ErrorHook>,
}

#[derive(Clone, Default)]
pub struct Registry {
    work: HashMap<String, WorkSpec>,
    completion_hooks: HashMap<String, CompletionHook>,
    error_hooks: HashMap<String, ErrorHook>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a work function accepting any argument names.
    pub fn register_work<W>(&mut self, key: impl Into<String>, work: W) -> &mut Self
    where
        W: WorkFn + 'static,
    {
        let key = key.into();
        self.work.insert(
            key.clone(),
            WorkSpec {
                key,
                params: None,
                func: Arc::new(work),
            },
        );
        self
    }

    /// Register a work function with a declared parameter list; records with other
    /// argument names are rejected before dispatch.
    pub fn register_work_with_params<W, I, S>(
        &mut self,
        key: impl Into<String>,
        params: I,
        work: W,
    ) -> &mut Self
    where
        W: WorkFn + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        self.work.insert(
            key.clone(),
            WorkSpec {
                key,
                params: Some(params.into_iter().map(Into::into).collect()),
                func: Arc::new(work),
            },
        );
        self
    }

    pub fn register_completion_hook<F>(&mut self, key: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(&JsonValue, &SharedState) -> Option<RecordStatus> + Send + Sync + 'static,
    {
        self.completion_hooks.insert(key.into(), Arc::new(hook));
        self
    }

    pub fn register_error_hook<F>(&mut self, key: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(&str, &SharedState) + Send + Sync + 'static,
    {
        self.error_hooks.insert(key.into(), Arc::new(hook));
        self
    }

    pub fn work(&self, key: &str) -> Option<&WorkSpec> {
        self.work.get(key)
    }

    /// Look up the work function and every hook by key. The error names every
    /// unknown key.
    pub fn resolve(
        &self,
        work: &str,
        on_complete: &[String],
        on_error: &[String],
    ) -> Result<Resolved, String> {
        let mut missing = Vec::new();

        let spec = self.work.get(work).cloned();
        if spec.is_none() {
            missing.push(format!("work '{work}'"));
        }

        let mut completion = Vec::with_capacity(on_complete.len());
        for key in on_complete {
            match self.completion_hooks.get(key) {
                Some(hook) => completion.push(hook.clone()),
                None => missing.push(format!("completion hook '{key}'")),
            }
        }

        let mut error = Vec::with_capacity(on_error.len());
        for key in on_error {
            match self.error_hooks.get(key) {
                Some(hook) => error.push(hook.clone()),
                None => missing.push(format!("error hook '{key}'")),
            }
        }

        match spec {
            Some(work) if missing.is_empty() => Ok(Resolved {
                work,
                on_complete: completion,
                on_error: error,
            }),
            _ => Err(format!("unregistered {}", missing.join(", "))),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut work: Vec<_> = self.work.keys().collect();
        let mut completion: Vec<_> = self.completion_hooks.keys().collect();
        let mut error: Vec<_> = self.error_hooks.keys().collect();
        work.sort();
        completion.sort();
        error.sort();
        f.debug_struct("Registry")
            .field("work", &work)
            .field("completion_hooks", &completion)
            .field("error_hooks", &error)
            .finish()
    }
}
