//! Lifecycle hooks.
//!
//! Hooks are best-effort observers: an error returned from a hook is logged
//! at `warn` and never changes the workflow outcome.

use std::sync::Arc;

use anchorage_types::error::EngineError;
use anchorage_types::workflow::{WorkflowState, WorkflowStatus};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Observer of instance lifecycle transitions.
///
/// `on_workflow_start` fires on the first start and on every resume.
/// `on_workflow_fail` fires for every non-successful terminal state,
/// including cancellation, timeout, and a degraded store.
pub trait WorkflowHooks: Send + Sync {
    fn on_workflow_start(&self, _state: &WorkflowState) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_workflow_complete(&self, _state: &WorkflowState, _result: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_workflow_fail(&self, _state: &WorkflowState, _error: &EngineError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl WorkflowHooks for NoopHooks {}

type StartFn = Arc<dyn Fn(&WorkflowState) -> anyhow::Result<()> + Send + Sync>;
type CompleteFn = Arc<dyn Fn(&WorkflowState, &Value) -> anyhow::Result<()> + Send + Sync>;
type FailFn = Arc<dyn Fn(&WorkflowState, &EngineError) -> anyhow::Result<()> + Send + Sync>;

/// Closure-based hooks; unset callbacks are no-ops.
#[derive(Clone, Default)]
pub struct CallbackHooks {
    on_start: Option<StartFn>,
    on_complete: Option<CompleteFn>,
    on_fail: Option<FailFn>,
}

impl CallbackHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(
        mut self,
        f: impl Fn(&WorkflowState) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_complete(
        mut self,
        f: impl Fn(&WorkflowState, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_fail(
        mut self,
        f: impl Fn(&WorkflowState, &EngineError) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_fail = Some(Arc::new(f));
        self
    }
}

impl WorkflowHooks for CallbackHooks {
    fn on_workflow_start(&self, state: &WorkflowState) -> anyhow::Result<()> {
        self.on_start.as_ref().map_or(Ok(()), |f| f(state))
    }

    fn on_workflow_complete(&self, state: &WorkflowState, result: &Value) -> anyhow::Result<()> {
        self.on_complete.as_ref().map_or(Ok(()), |f| f(state, result))
    }

    fn on_workflow_fail(&self, state: &WorkflowState, error: &EngineError) -> anyhow::Result<()> {
        self.on_fail.as_ref().map_or(Ok(()), |f| f(state, error))
    }
}

/// Fans out to several hooks in registration order. Every hook runs even if
/// an earlier one fails; the first error is returned.
#[derive(Clone, Default)]
pub struct ComposedHooks {
    hooks: Vec<Arc<dyn WorkflowHooks>>,
}

impl ComposedHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hooks: impl WorkflowHooks + 'static) -> Self {
        self.hooks.push(Arc::new(hooks));
        self
    }

    pub fn push(&mut self, hooks: Arc<dyn WorkflowHooks>) {
        self.hooks.push(hooks);
    }

    fn each(&self, f: impl Fn(&dyn WorkflowHooks) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let mut first_error = None;
        for hooks in &self.hooks {
            if let Err(e) = f(hooks.as_ref()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl WorkflowHooks for ComposedHooks {
    fn on_workflow_start(&self, state: &WorkflowState) -> anyhow::Result<()> {
        self.each(|h| h.on_workflow_start(state))
    }

    fn on_workflow_complete(&self, state: &WorkflowState, result: &Value) -> anyhow::Result<()> {
        self.each(|h| h.on_workflow_complete(state, result))
    }

    fn on_workflow_fail(&self, state: &WorkflowState, error: &EngineError) -> anyhow::Result<()> {
        self.each(|h| h.on_workflow_fail(state, error))
    }
}

/// Logs lifecycle transitions with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl WorkflowHooks for TracingHooks {
    fn on_workflow_start(&self, state: &WorkflowState) -> anyhow::Result<()> {
        tracing::info!(
            workflow_id = %state.workflow_id,
            run_id = %state.run_id,
            workflow = %state.workflow_name,
            history_len = state.history.len(),
            "workflow started"
        );
        Ok(())
    }

    fn on_workflow_complete(&self, state: &WorkflowState, _result: &Value) -> anyhow::Result<()> {
        tracing::info!(
            workflow_id = %state.workflow_id,
            run_id = %state.run_id,
            status = %state.status,
            "workflow completed"
        );
        Ok(())
    }

    fn on_workflow_fail(&self, state: &WorkflowState, error: &EngineError) -> anyhow::Result<()> {
        tracing::warn!(
            workflow_id = %state.workflow_id,
            run_id = %state.run_id,
            status = %state.status,
            error = %error,
            "workflow did not complete"
        );
        Ok(())
    }
}

/// Lifecycle notification published by [`BroadcastHooks`].
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub status: WorkflowStatus,
    pub error: Option<EngineError>,
}

impl LifecycleEvent {
    fn from_state(state: &WorkflowState, error: Option<&EngineError>) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            run_id: state.run_id,
            status: state.status,
            error: error.cloned(),
        }
    }
}

/// Publishes lifecycle events on a `tokio::sync::broadcast` channel.
///
/// Publishing with no active subscribers is a no-op.
#[derive(Clone)]
pub struct BroadcastHooks {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastHooks {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for BroadcastHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHooks")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

impl WorkflowHooks for BroadcastHooks {
    fn on_workflow_start(&self, state: &WorkflowState) -> anyhow::Result<()> {
        self.publish(LifecycleEvent::from_state(state, None));
        Ok(())
    }

    fn on_workflow_complete(&self, state: &WorkflowState, _result: &Value) -> anyhow::Result<()> {
        self.publish(LifecycleEvent::from_state(state, None));
        Ok(())
    }

    fn on_workflow_fail(&self, state: &WorkflowState, error: &EngineError) -> anyhow::Result<()> {
        self.publish(LifecycleEvent::from_state(state, Some(error)));
        Ok(())
    }
}
