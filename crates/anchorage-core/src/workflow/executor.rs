//! Durable workflow executor: event-sourced execution with deterministic
//! replay.
//!
//! `ReplayExecutor` runs each active workflow instance as its own tokio task
//! (the driver). Every call the workflow function makes into its
//! `WorkflowContext` is journaled to the `WorkflowStore` before control
//! returns to the function. After a crash, the instance is re-run from the
//! top against its stored History; recorded calls are answered from History
//! until the function catches up, after which execution continues live.
//!
//! # Instance lifecycle
//!
//! 1. `execute` creates the state, journals `WorkflowStarted`, and spawns the
//!    driver (or resumes a stored non-terminal instance).
//! 2. The driver waits for a worker permit, moves to `Running`, fires
//!    `on_workflow_start`, and polls the workflow future.
//! 3. Cancellation, the workflow timeout, and engine faults all cancel the
//!    instance token; the driver drops the workflow future at that point.
//! 4. The terminal event and outcome are saved, hooks fire, the registry
//!    entry is released, and handles observe the outcome.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anchorage_types::config::EngineConfig;
use anchorage_types::error::EngineError;
use anchorage_types::workflow::{
    EventKind, Signal, WorkflowFilter, WorkflowOptions, WorkflowStartedPayload, WorkflowState,
    WorkflowStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

use crate::store::{SharedStore, WorkflowStore};

use super::activity::{AbortOnDrop, ActivityCall};
use super::context::WorkflowContext;
use super::handle::WorkflowHandle;
use super::hooks::{NoopHooks, WorkflowHooks};
use super::instance::{Instance, InstanceDeps, StopReason};
use super::registry::{ActivityRegistry, WorkflowFn, WorkflowRegistry};

// ---------------------------------------------------------------------------
// DurableExecutor trait
// ---------------------------------------------------------------------------

/// The caller-facing executor API.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods;
/// `BoxExecutor` provides the type-erased form used by middleware.
pub trait DurableExecutor: Send + Sync {
    /// Start (or resume, or look up) the instance `options.id` of `workflow`.
    fn execute(
        &self,
        workflow: &str,
        options: WorkflowOptions,
    ) -> impl Future<Output = Result<WorkflowHandle, EngineError>> + Send;

    /// Deliver a signal to a running instance.
    fn signal(
        &self,
        workflow_id: &str,
        signal: Signal,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Read-only inspection; never appends History.
    fn query(
        &self,
        workflow_id: &str,
        query_type: &str,
    ) -> impl Future<Output = Result<Value, EngineError>> + Send;

    /// Request cancellation. Idempotent.
    fn cancel(&self, workflow_id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// ReplayReport
// ---------------------------------------------------------------------------

/// Outcome of re-running a recorded History with [`ReplayExecutor::replay`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    pub result: Result<Value, EngineError>,
    /// Activity calls the workflow made, in call order.
    pub activity_calls: Vec<ActivityCall>,
}

// ---------------------------------------------------------------------------
// ReplayExecutor
// ---------------------------------------------------------------------------

struct ExecutorInner {
    store: SharedStore,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    hooks: Arc<dyn WorkflowHooks>,
    config: Arc<EngineConfig>,
    /// Live instances keyed by workflow ID. Never held across an await.
    live: DashMap<String, Arc<Instance>>,
    limiter: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    /// Number of driver tasks still running.
    drivers: watch::Sender<usize>,
}

impl ExecutorInner {
    fn deps(&self) -> InstanceDeps {
        InstanceDeps {
            store: Some(self.store.clone()),
            activities: self.activities.clone(),
            config: self.config.clone(),
        }
    }

    fn find_live(&self, workflow_id: &str) -> Option<Arc<Instance>> {
        self.live.get(workflow_id).map(|entry| entry.value().clone())
    }

    fn release(&self, instance: &Arc<Instance>) {
        self.live
            .remove_if(&instance.workflow_id, |_, live| Arc::ptr_eq(live, instance));
    }

    fn run_hook(&self, workflow_id: &str, hook: &str, result: anyhow::Result<()>) {
        if let Err(e) = result {
            tracing::warn!(workflow_id, hook, error = %e, "workflow hook failed");
        }
    }

    fn fire_terminal_hooks(&self, state: &WorkflowState, outcome: &Result<Value, EngineError>) {
        match outcome {
            Ok(result) => self.run_hook(
                &state.workflow_id,
                "on_workflow_complete",
                self.hooks.on_workflow_complete(state, result),
            ),
            Err(e) => self.run_hook(
                &state.workflow_id,
                "on_workflow_fail",
                self.hooks.on_workflow_fail(state, e),
            ),
        }
    }
}

/// Decrements the running-driver count when a driver task ends.
struct DriverGuard(Arc<ExecutorInner>);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.drivers.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// The durable executor. Cheap to clone; clones share one registry of live
/// instances.
#[derive(Clone)]
pub struct ReplayExecutor {
    inner: Arc<ExecutorInner>,
}

/// Builder for [`ReplayExecutor`].
pub struct ReplayExecutorBuilder {
    store: SharedStore,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    hooks: Arc<dyn WorkflowHooks>,
    config: EngineConfig,
}

impl ReplayExecutorBuilder {
    pub fn workflows(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn activities(mut self, activities: ActivityRegistry) -> Self {
        self.activities = activities;
        self
    }

    pub fn hooks(mut self, hooks: impl WorkflowHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ReplayExecutor, EngineError> {
        self.config.validate()?;
        let limiter = self
            .config
            .max_concurrent_workflows
            .map(|n| Arc::new(Semaphore::new(n)));
        Ok(ReplayExecutor {
            inner: Arc::new(ExecutorInner {
                store: self.store,
                workflows: self.workflows,
                activities: self.activities,
                hooks: self.hooks,
                config: Arc::new(self.config),
                live: DashMap::new(),
                limiter,
                shutdown: CancellationToken::new(),
                drivers: watch::Sender::new(0),
            }),
        })
    }
}

impl ReplayExecutor {
    pub fn builder(store: impl WorkflowStore + 'static) -> ReplayExecutorBuilder {
        Self::builder_shared(Arc::new(store))
    }

    pub fn builder_shared(store: SharedStore) -> ReplayExecutorBuilder {
        ReplayExecutorBuilder {
            store,
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            hooks: Arc::new(NoopHooks),
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of instances with a driver in this executor.
    pub fn live_count(&self) -> usize {
        self.inner.live.len()
    }

    /// Resume every stored `Pending`/`Running` instance that has no driver
    /// in this executor.
    ///
    /// Instances of workflows missing from the registry are skipped with a
    /// warning.
    pub async fn recover(&self) -> Result<Vec<WorkflowHandle>, EngineError> {
        let mut handles = Vec::new();
        for status in [WorkflowStatus::Pending, WorkflowStatus::Running] {
            let stored = self
                .inner
                .store
                .list_boxed(WorkflowFilter::with_status(status))
                .await?;
            for state in stored {
                if self.inner.live.contains_key(&state.workflow_id) {
                    continue;
                }
                let Some(workflow_fn) = self.inner.workflows.get(&state.workflow_name) else {
                    tracing::warn!(
                        workflow_id = %state.workflow_id,
                        workflow = %state.workflow_name,
                        "cannot recover instance of unregistered workflow"
                    );
                    continue;
                };
                tracing::info!(
                    workflow_id = %state.workflow_id,
                    run_id = %state.run_id,
                    history_len = state.history.len(),
                    "recovering workflow instance"
                );
                match self.launch(state, workflow_fn, false).await {
                    Ok(handle) => handles.push(handle),
                    Err(EngineError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(handles)
    }

    /// Re-run a recorded History without side effects.
    ///
    /// No activity body, timer, or live signal is used. A call that History
    /// cannot answer, or a call that differs from the recorded one, ends the
    /// replay with `EngineError::NonDeterministic`.
    pub async fn replay(&self, state: &WorkflowState) -> Result<ReplayReport, EngineError> {
        let workflow_fn = self.inner.workflows.get(&state.workflow_name).ok_or_else(|| {
            EngineError::NotFound(format!("workflow '{}' is not registered", state.workflow_name))
        })?;
        let deps = InstanceDeps {
            store: None,
            activities: ActivityRegistry::new(),
            config: self.inner.config.clone(),
        };
        let instance = Instance::new(state.clone(), deps, true)?;
        let token = instance.control.token.clone();
        let ctx = WorkflowContext::new(instance.clone());
        let mut workflow = AssertUnwindSafe(workflow_fn(ctx, state.input.clone())).catch_unwind();

        // Once every recorded resolution is consumed nothing else can arrive,
        // so parked signal receivers see a closed channel.
        let close_mailbox = async {
            if instance.gate.wait_drained(&token).await.is_ok() {
                instance.mailbox.close();
            }
            std::future::pending::<()>().await
        };

        let returned = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            returned = &mut workflow => Some(returned),
            _ = close_mailbox => None,
        };

        let result = match (instance.control.reason(), returned) {
            (Some(StopReason::Fault(e)), _) => Err(e),
            (_, Some(Ok(Ok(value)))) => unconsumed_history(&instance).map_or(Ok(value), Err),
            (_, Some(Ok(Err(e)))) => Err(e),
            (_, Some(Err(panic))) => Err(panicked(panic.as_ref())),
            (_, None) => Err(EngineError::Cancelled),
        };
        Ok(ReplayReport {
            result,
            activity_calls: instance.activity_calls(),
        })
    }

    /// Stop every driver without writing a terminal state, as if the
    /// process had crashed, and wait for the drivers to exit. Further
    /// `execute` calls are rejected.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.live.iter() {
            entry.value().control.stop(StopReason::Shutdown);
        }
        let mut drivers = self.inner.drivers.subscribe();
        let _ = drivers.wait_for(|n| *n == 0).await;
        tracing::info!("workflow executor shut down");
    }

    /// Register and spawn a driver for `state`.
    async fn launch(
        &self,
        state: WorkflowState,
        workflow_fn: WorkflowFn,
        persist_first: bool,
    ) -> Result<WorkflowHandle, EngineError> {
        let workflow_id = state.workflow_id.clone();
        let input = state.input.clone();
        let deadline = state.deadline();

        let instance = match Instance::new(state.clone(), self.inner.deps(), false) {
            Ok(instance) => instance,
            Err(e) => return self.fail_unreplayable(state, e).await,
        };

        match self.inner.live.entry(workflow_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(workflow_id)),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
            }
        }

        if persist_first {
            if let Err(e) = instance.journal.persist_current().await {
                self.inner.release(&instance);
                return Err(e);
            }
        }

        let handle = instance.handle();
        self.inner.drivers.send_modify(|n| *n += 1);
        let guard = DriverGuard(self.inner.clone());
        tokio::spawn(drive(guard, instance, workflow_fn, input, deadline));
        Ok(handle)
    }

    /// Mark a stored instance whose History cannot be replayed as `Failed`.
    async fn fail_unreplayable(
        &self,
        mut state: WorkflowState,
        err: EngineError,
    ) -> Result<WorkflowHandle, EngineError> {
        tracing::error!(
            workflow_id = %state.workflow_id,
            error = %err,
            "stored history cannot be replayed, failing instance"
        );
        state.settle(WorkflowStatus::Failed)?;
        state.append(EventKind::WorkflowFailed, None, json!({ "error": &err }));
        state.error = Some(err.clone());
        self.inner.store.save_boxed(&state).await?;
        self.inner.fire_terminal_hooks(&state, &Err(err));
        Ok(WorkflowHandle::settled(&state))
    }
}

impl DurableExecutor for ReplayExecutor {
    async fn execute(&self, workflow: &str, options: WorkflowOptions) -> Result<WorkflowHandle, EngineError> {
        options.validate()?;
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::Interrupted("executor is shut down".to_string()));
        }
        let workflow_fn = self
            .inner
            .workflows
            .get(workflow)
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{workflow}' is not registered")))?;
        if self.inner.live.contains_key(&options.id) {
            return Err(EngineError::AlreadyExists(options.id));
        }

        match self.inner.store.load_boxed(&options.id).await? {
            Some(stored) if stored.is_terminal() && !options.fresh => {
                tracing::debug!(
                    workflow_id = %stored.workflow_id,
                    status = %stored.status,
                    "instance already finished, returning stored outcome"
                );
                Ok(WorkflowHandle::settled(&stored))
            }
            Some(stored) if !stored.is_terminal() => {
                if stored.workflow_name != workflow {
                    return Err(EngineError::Validation(format!(
                        "instance '{}' belongs to workflow '{}', not '{workflow}'",
                        stored.workflow_id, stored.workflow_name
                    )));
                }
                tracing::info!(
                    workflow_id = %stored.workflow_id,
                    run_id = %stored.run_id,
                    history_len = stored.history.len(),
                    "resuming workflow instance from history"
                );
                self.launch(stored, workflow_fn, false).await
            }
            _ => {
                let mut state =
                    WorkflowState::new(options.id, workflow, options.input, options.timeout);
                let started = serde_json::to_value(WorkflowStartedPayload {
                    workflow: workflow.to_string(),
                    input: state.input.clone(),
                })?;
                state.append(EventKind::WorkflowStarted, None, started);
                tracing::info!(
                    workflow_id = %state.workflow_id,
                    run_id = %state.run_id,
                    workflow,
                    "starting workflow instance"
                );
                self.launch(state, workflow_fn, true).await
            }
        }
    }

    async fn signal(&self, workflow_id: &str, signal: Signal) -> Result<(), EngineError> {
        if signal.name.is_empty() {
            return Err(EngineError::Validation("signal name is required".to_string()));
        }
        let instance = self
            .inner
            .find_live(workflow_id)
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{workflow_id}' is not running")))?;
        tracing::debug!(workflow_id, signal = %signal.name, "delivering signal");
        instance.accept_signal(signal).await
    }

    async fn query(&self, workflow_id: &str, query_type: &str) -> Result<Value, EngineError> {
        if let Some(instance) = self.inner.find_live(workflow_id) {
            if let Some(handler) = instance.query_handler(query_type) {
                return handler();
            }
            return builtin_query(&instance.journal.snapshot(), query_type);
        }
        let state = self
            .inner
            .store
            .load_boxed(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{workflow_id}'")))?;
        builtin_query(&state, query_type)
    }

    async fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        if let Some(instance) = self.inner.find_live(workflow_id) {
            if instance.control.stop(StopReason::Cancelled) {
                tracing::info!(workflow_id, "cancellation requested");
            }
            return Ok(());
        }

        let Some(mut state) = self.inner.store.load_boxed(workflow_id).await? else {
            return Err(EngineError::NotFound(format!("workflow '{workflow_id}'")));
        };
        if state.is_terminal() {
            return Ok(());
        }
        state.settle(WorkflowStatus::Cancelled)?;
        state.append(EventKind::WorkflowCancelled, None, json!({}));
        state.error = Some(EngineError::Cancelled);
        self.inner.store.save_boxed(&state).await?;
        tracing::info!(workflow_id, "cancelled instance with no running driver");
        self.inner
            .fire_terminal_hooks(&state, &Err(EngineError::Cancelled));
        Ok(())
    }
}

fn builtin_query(state: &WorkflowState, query_type: &str) -> Result<Value, EngineError> {
    match query_type {
        "status" => Ok(Value::String(state.status.as_str().to_string())),
        "history" => Ok(serde_json::to_value(&state.history)?),
        "result" => Ok(state.result.clone().unwrap_or(Value::Null)),
        other => Err(EngineError::NotFound(format!(
            "query type '{other}' for workflow '{}'",
            state.workflow_id
        ))),
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum DriverExit {
    Stopped,
    Returned(Result<Result<Value, EngineError>, Box<dyn Any + Send>>),
}

fn panicked(panic: &(dyn Any + Send)) -> EngineError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    EngineError::workflow(format!("workflow panicked: {message}"))
}

/// A workflow that returns before making every recorded call diverged from
/// its History.
fn unconsumed_history(instance: &Instance) -> Option<EngineError> {
    let made = instance.calls_made();
    (made < instance.log.last_call()).then(|| EngineError::NonDeterministic {
        call_id: made + 1,
        detail: "workflow returned without making a call recorded in history".to_string(),
    })
}

fn arm_timeout(instance: &Arc<Instance>, deadline: DateTime<Utc>) -> AbortOnDrop<()> {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let instance = instance.clone();
    AbortOnDrop(tokio::spawn(async move {
        tokio::time::sleep(remaining).await;
        if instance.control.stop(StopReason::TimedOut) {
            tracing::info!(workflow_id = %instance.workflow_id, "workflow timeout elapsed");
        }
    }))
}

async fn drive(
    guard: DriverGuard,
    instance: Arc<Instance>,
    workflow: WorkflowFn,
    input: Value,
    deadline: Option<DateTime<Utc>>,
) {
    let inner = guard.0.clone();
    let token = instance.control.token.clone();
    let _timeout = deadline.map(|deadline| arm_timeout(&instance, deadline));

    let _permit = match &inner.limiter {
        Some(limiter) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = limiter.clone().acquire_owned() => permit.ok(),
        },
        None => None,
    };

    let exit = if token.is_cancelled() {
        DriverExit::Stopped
    } else {
        run(&inner, &instance, workflow, input).await
    };

    let reason = instance.control.reason();
    let (status, outcome) = match (exit, reason) {
        (_, Some(StopReason::Shutdown)) => {
            inner.release(&instance);
            instance.mailbox.close();
            let status = instance.journal.snapshot().status;
            tracing::debug!(workflow_id = %instance.workflow_id, "driver stopped by shutdown");
            instance.publish_outcome(
                status,
                Err(EngineError::Interrupted(format!(
                    "executor shut down before workflow '{}' finished",
                    instance.workflow_id
                ))),
            );
            return;
        }
        (_, Some(StopReason::Fault(e))) => (WorkflowStatus::Failed, Err(e)),
        (DriverExit::Returned(Ok(Ok(value))), _) => match unconsumed_history(&instance) {
            Some(e) => (WorkflowStatus::Failed, Err(e)),
            None => (WorkflowStatus::Completed, Ok(value)),
        },
        (DriverExit::Returned(Err(panic)), None) => (WorkflowStatus::Failed, Err(panicked(panic.as_ref()))),
        (_, Some(StopReason::Cancelled)) => (WorkflowStatus::Cancelled, Err(EngineError::Cancelled)),
        (_, Some(StopReason::TimedOut)) => (WorkflowStatus::TimedOut, Err(EngineError::TimedOut)),
        (DriverExit::Returned(Ok(Err(e))), None) => (WorkflowStatus::Failed, Err(e)),
        (DriverExit::Stopped, None) => (WorkflowStatus::Cancelled, Err(EngineError::Cancelled)),
    };

    finalize(&inner, &instance, status, outcome).await;
}

/// Move to `Running` and poll the workflow until it returns or the instance
/// is stopped.
async fn run(
    inner: &ExecutorInner,
    instance: &Arc<Instance>,
    workflow: WorkflowFn,
    input: Value,
) -> DriverExit {
    if let Err(e) = instance.journal.set_status(WorkflowStatus::Running).await {
        instance.fault(e);
        return DriverExit::Stopped;
    }
    instance.publish_status(WorkflowStatus::Running);
    let snapshot = instance.journal.snapshot();
    inner.run_hook(
        &instance.workflow_id,
        "on_workflow_start",
        inner.hooks.on_workflow_start(&snapshot),
    );

    let ctx = WorkflowContext::new(instance.clone());
    let mut fut = AssertUnwindSafe(workflow(ctx, input)).catch_unwind();
    let token = instance.control.token.clone();
    tokio::select! {
        biased;
        _ = token.cancelled() => DriverExit::Stopped,
        returned = &mut fut => DriverExit::Returned(returned),
    }
}

async fn finalize(
    inner: &ExecutorInner,
    instance: &Arc<Instance>,
    status: WorkflowStatus,
    outcome: Result<Value, EngineError>,
) {
    instance.mailbox.close();
    let (status, outcome) = match instance.journal.finish(status, &outcome).await {
        Ok(()) => (status, outcome),
        Err(e) => {
            tracing::error!(
                workflow_id = %instance.workflow_id,
                run_id = %instance.run_id,
                error = %e,
                "could not persist terminal state, marking instance degraded"
            );
            instance.journal.degrade(&e).await;
            (WorkflowStatus::Failed, Err(e))
        }
    };

    let snapshot = instance.journal.snapshot();
    inner.fire_terminal_hooks(&snapshot, &outcome);
    inner.release(instance);

    match &outcome {
        Ok(_) => tracing::info!(
            workflow_id = %instance.workflow_id,
            run_id = %instance.run_id,
            status = %status,
            "workflow finished"
        ),
        Err(e) => tracing::info!(
            workflow_id = %instance.workflow_id,
            run_id = %instance.run_id,
            status = %status,
            error = %e,
            "workflow finished"
        ),
    }
    instance.publish_outcome(status, outcome);
}
