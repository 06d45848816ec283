//! Named registries of workflow and activity functions.
//!
//! Functions are stored behind a JSON serialization adapter keyed by name,
//! so a restarted process can look up the function a stored instance was
//! started with (`WorkflowState::workflow_name`) and replay it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anchorage_types::error::EngineError;
use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::activity::{ActivityContext, NonRetryable};
use super::context::WorkflowContext;

/// Type-erased workflow function: JSON in, JSON out.
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

/// Type-erased activity function: JSON in, JSON out.
pub type ActivityFn =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Registry of workflow functions, built once and handed to the executor.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    entries: HashMap<String, WorkflowFn>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed workflow function under `name`.
    ///
    /// A later registration with the same name replaces the earlier one.
    pub fn register<F, Fut, I, O>(mut self, name: impl Into<String>, workflow: F) -> Self
    where
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, EngineError>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        let adapter: WorkflowFn = Arc::new(move |ctx: WorkflowContext, input: Value| {
            match serde_json::from_value::<I>(input) {
                Ok(input) => {
                    let fut = workflow(ctx, input);
                    async move {
                        let output = fut.await?;
                        Ok::<Value, EngineError>(serde_json::to_value(output)?)
                    }
                    .boxed()
                }
                Err(e) => future::ready(Err(EngineError::Serialization(format!(
                    "workflow input does not match the registered type: {e}"
                ))))
                .boxed(),
            }
        });
        self.entries.insert(name.into(), adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<WorkflowFn> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Registry of activity functions.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    entries: HashMap<String, ActivityFn>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity under `name`.
    ///
    /// Input that fails to decode is reported as a non-retryable failure.
    pub fn register<F, Fut, I, O>(mut self, name: impl Into<String>, activity: F) -> Self
    where
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        let adapter: ActivityFn = Arc::new(move |ctx: ActivityContext, input: Value| {
            match serde_json::from_value::<I>(input) {
                Ok(input) => {
                    let fut = activity(ctx, input);
                    async move {
                        let output = fut.await?;
                        Ok::<Value, anyhow::Error>(serde_json::to_value(output)?)
                    }
                    .boxed()
                }
                Err(e) => future::ready(Err(anyhow::Error::new(NonRetryable(format!(
                    "activity input does not match the registered type: {e}"
                )))))
                .boxed(),
            }
        });
        self.entries.insert(name.into(), adapter);
        self
    }

    pub fn get(&self, name: &str) -> Option<ActivityFn> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
