//! Type-erased executors and the middleware chain around them.
//!
//! Follows the blanket-impl pattern used for stores:
//! 1. `DurableExecutorDyn` is an object-safe mirror of `DurableExecutor`
//!    with boxed futures.
//! 2. Every `DurableExecutor` implements it.
//! 3. `BoxExecutor` wraps `Arc<dyn DurableExecutorDyn>`, implements
//!    `DurableExecutor` itself, and is what middleware consumes and returns.

use std::sync::Arc;
use std::time::Instant;

use anchorage_types::error::EngineError;
use anchorage_types::workflow::{Signal, WorkflowOptions};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tracing::Instrument;

use super::executor::DurableExecutor;
use super::handle::WorkflowHandle;

/// Object-safe version of [`DurableExecutor`] with boxed futures.
pub trait DurableExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        workflow: &'a str,
        options: WorkflowOptions,
    ) -> BoxFuture<'a, Result<WorkflowHandle, EngineError>>;

    fn signal_boxed<'a>(&'a self, workflow_id: &'a str, signal: Signal) -> BoxFuture<'a, Result<(), EngineError>>;

    fn query_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        query_type: &'a str,
    ) -> BoxFuture<'a, Result<Value, EngineError>>;

    fn cancel_boxed<'a>(&'a self, workflow_id: &'a str) -> BoxFuture<'a, Result<(), EngineError>>;
}

impl<T: DurableExecutor> DurableExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        workflow: &'a str,
        options: WorkflowOptions,
    ) -> BoxFuture<'a, Result<WorkflowHandle, EngineError>> {
        Box::pin(self.execute(workflow, options))
    }

    fn signal_boxed<'a>(&'a self, workflow_id: &'a str, signal: Signal) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.signal(workflow_id, signal))
    }

    fn query_boxed<'a>(
        &'a self,
        workflow_id: &'a str,
        query_type: &'a str,
    ) -> BoxFuture<'a, Result<Value, EngineError>> {
        Box::pin(self.query(workflow_id, query_type))
    }

    fn cancel_boxed<'a>(&'a self, workflow_id: &'a str) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.cancel(workflow_id))
    }
}

/// Type-erased, cheaply clonable executor.
#[derive(Clone)]
pub struct BoxExecutor {
    inner: Arc<dyn DurableExecutorDyn>,
}

impl BoxExecutor {
    pub fn new<T: DurableExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }
}

impl DurableExecutor for BoxExecutor {
    async fn execute(&self, workflow: &str, options: WorkflowOptions) -> Result<WorkflowHandle, EngineError> {
        self.inner.execute_boxed(workflow, options).await
    }

    async fn signal(&self, workflow_id: &str, signal: Signal) -> Result<(), EngineError> {
        self.inner.signal_boxed(workflow_id, signal).await
    }

    async fn query(&self, workflow_id: &str, query_type: &str) -> Result<Value, EngineError> {
        self.inner.query_boxed(workflow_id, query_type).await
    }

    async fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.inner.cancel_boxed(workflow_id).await
    }
}

/// Decorates an executor.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: BoxExecutor) -> BoxExecutor;
}

impl<F> Middleware for F
where
    F: Fn(BoxExecutor) -> BoxExecutor + Send + Sync,
{
    fn wrap(&self, next: BoxExecutor) -> BoxExecutor {
        self(next)
    }
}

/// Wrap `base` in `middleware`; the first entry ends up outermost.
pub fn apply_middleware(base: BoxExecutor, middleware: &[Arc<dyn Middleware>]) -> BoxExecutor {
    middleware
        .iter()
        .rev()
        .fold(base, |next, layer| layer.wrap(next))
}

/// Wraps every executor operation in a span and logs its latency and
/// outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn wrap(&self, next: BoxExecutor) -> BoxExecutor {
        BoxExecutor::new(TracedExecutor { next })
    }
}

struct TracedExecutor {
    next: BoxExecutor,
}

fn log_outcome<T>(operation: &str, started: Instant, result: &Result<T, EngineError>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(_) => tracing::debug!(operation, elapsed_ms, "executor call succeeded"),
        Err(e) => tracing::warn!(operation, elapsed_ms, kind = ?e.kind(), error = %e, "executor call failed"),
    }
}

impl DurableExecutor for TracedExecutor {
    async fn execute(&self, workflow: &str, options: WorkflowOptions) -> Result<WorkflowHandle, EngineError> {
        let span = tracing::info_span!("workflow.execute", workflow, workflow_id = %options.id);
        let started = Instant::now();
        let result = self.next.execute(workflow, options).instrument(span).await;
        log_outcome("execute", started, &result);
        result
    }

    async fn signal(&self, workflow_id: &str, signal: Signal) -> Result<(), EngineError> {
        let span = tracing::info_span!("workflow.signal", workflow_id, signal = %signal.name);
        let started = Instant::now();
        let result = self.next.signal(workflow_id, signal).instrument(span).await;
        log_outcome("signal", started, &result);
        result
    }

    async fn query(&self, workflow_id: &str, query_type: &str) -> Result<Value, EngineError> {
        let span = tracing::info_span!("workflow.query", workflow_id, query_type);
        let started = Instant::now();
        let result = self.next.query(workflow_id, query_type).instrument(span).await;
        log_outcome("query", started, &result);
        result
    }

    async fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        let span = tracing::info_span!("workflow.cancel", workflow_id);
        let started = Instant::now();
        let result = self.next.cancel(workflow_id).instrument(span).await;
        log_outcome("cancel", started, &result);
        result
    }
}
