//! Per-instance runtime state shared by the driver task, the workflow
//! context, and the executor's external API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anchorage_types::config::EngineConfig;
use anchorage_types::error::EngineError;
use anchorage_types::workflow::{
    EventKind, HistoryEvent, Signal, SignalPayload, WorkflowState, WorkflowStatus,
};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::SharedStore;

use super::activity::ActivityCall;
use super::handle::{HandleState, WorkflowHandle};
use super::registry::ActivityRegistry;
use super::replay::{Mailbox, ReplayGate, ReplayLog};

/// Query handler registered by workflow code.
pub type QueryFn = Arc<dyn Fn() -> Result<Value, EngineError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Why an instance was told to stop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StopReason {
    Cancelled,
    TimedOut,
    /// Engine-level fault: non-determinism or a store that keeps failing.
    Fault(EngineError),
    /// Executor shutdown; no terminal state is written.
    Shutdown,
}

/// Cancellation token plus the first reason it was cancelled for.
pub(crate) struct Control {
    pub token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
}

impl Control {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// Record `reason` and cancel. Only the first reason sticks; returns
    /// whether this call was the one that stopped the instance.
    pub(crate) fn stop(&self, reason: StopReason) -> bool {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        drop(current);
        self.token.cancel();
        true
    }

    pub(crate) fn reason(&self) -> Option<StopReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Single writer for an instance's `WorkflowState`.
///
/// Every append is saved before it is acknowledged; `snapshot` is what
/// queries read, so they never wait on an in-flight save.
pub(crate) struct Journal {
    state: tokio::sync::Mutex<WorkflowState>,
    snapshot: RwLock<Arc<WorkflowState>>,
    /// `None` in strict replay, where nothing is persisted.
    store: Option<SharedStore>,
    config: Arc<EngineConfig>,
}

impl Journal {
    fn new(state: WorkflowState, store: Option<SharedStore>, config: Arc<EngineConfig>) -> Self {
        let snapshot = RwLock::new(Arc::new(state.clone()));
        Self {
            state: tokio::sync::Mutex::new(state),
            snapshot,
            store,
            config,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<WorkflowState> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, state: &WorkflowState) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state.clone());
    }

    /// Save with bounded retries.
    async fn persist(&self, state: &WorkflowState) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let attempts = self.config.save_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match store.save_boxed(state).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        workflow_id = %state.workflow_id,
                        attempt,
                        error = %e,
                        "failed to save workflow state, retrying"
                    );
                    tokio::time::sleep(self.config.save_retry_interval * attempt).await;
                }
                Err(e) => return Err(EngineError::Store(e)),
            }
        }
    }

    /// Save the current state as-is (first save of a new run).
    pub(crate) async fn persist_current(&self) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        self.persist(&state).await
    }

    /// Append an event and save it. Fails `NotFound` once terminal.
    pub(crate) async fn append(
        &self,
        kind: EventKind,
        call_id: Option<u64>,
        payload: Value,
    ) -> Result<HistoryEvent, EngineError> {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return Err(EngineError::NotFound(format!(
                "workflow '{}' is no longer running",
                state.workflow_id
            )));
        }
        let event = state.append(kind, call_id, payload);
        tracing::debug!(
            workflow_id = %state.workflow_id,
            sequence = event.sequence,
            call_id = ?call_id,
            kind = %kind,
            "history event appended"
        );
        let saved = self.persist(&state).await;
        self.publish(&state);
        saved.map(|()| event)
    }

    /// Move to a non-terminal status and save it.
    pub(crate) async fn set_status(&self, status: WorkflowStatus) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.status == status {
            return Ok(());
        }
        state.transition(status)?;
        let saved = self.persist(&state).await;
        self.publish(&state);
        saved
    }

    /// Append the terminal event, record the outcome and save. A no-op if
    /// the state is already terminal.
    pub(crate) async fn finish(
        &self,
        status: WorkflowStatus,
        outcome: &Result<Value, EngineError>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return Ok(());
        }
        let (kind, payload) = match (status, outcome) {
            (WorkflowStatus::Completed, Ok(result)) => {
                (EventKind::WorkflowCompleted, json!({ "result": result }))
            }
            (WorkflowStatus::Cancelled, _) => (EventKind::WorkflowCancelled, json!({})),
            (WorkflowStatus::TimedOut, _) => (EventKind::WorkflowTimedOut, json!({})),
            (_, Err(err)) => (EventKind::WorkflowFailed, json!({ "error": err })),
            (_, Ok(_)) => {
                return Err(EngineError::Validation(format!(
                    "cannot finish workflow '{}' as {status}",
                    state.workflow_id
                )));
            }
        };
        state.settle(status)?;
        state.append(kind, None, payload);
        match outcome {
            Ok(result) => state.result = Some(result.clone()),
            Err(err) => state.error = Some(err.clone()),
        }
        let saved = self.persist(&state).await;
        self.publish(&state);
        saved
    }

    /// Force `Failed` after the terminal save could not be completed.
    pub(crate) async fn degrade(&self, err: &EngineError) -> Arc<WorkflowState> {
        let mut state = self.state.lock().await;
        state.status = WorkflowStatus::Failed;
        state.result = None;
        state.error = Some(err.clone());
        self.publish(&state);
        if let Some(store) = &self.store {
            if let Err(e) = store.save_boxed(&state).await {
                tracing::error!(
                    workflow_id = %state.workflow_id,
                    error = %e,
                    "workflow state is degraded and could not be saved"
                );
            }
        }
        self.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Collaborators an instance needs from its executor.
#[derive(Clone)]
pub(crate) struct InstanceDeps {
    pub store: Option<SharedStore>,
    pub activities: ActivityRegistry,
    pub config: Arc<EngineConfig>,
}

/// One live workflow instance.
pub(crate) struct Instance {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub control: Control,
    pub journal: Journal,
    pub log: ReplayLog,
    pub gate: ReplayGate,
    pub mailbox: Mailbox,
    pub activities: ActivityRegistry,
    pub config: Arc<EngineConfig>,
    /// Strict replay: every call must be answered from History.
    pub strict: bool,
    queries: RwLock<HashMap<String, QueryFn>>,
    status: watch::Sender<HandleState>,
    next_call: AtomicU64,
    calls: Mutex<Vec<ActivityCall>>,
}

impl Instance {
    pub(crate) fn new(
        state: WorkflowState,
        deps: InstanceDeps,
        strict: bool,
    ) -> Result<Arc<Self>, EngineError> {
        state.validate_history()?;
        let log = ReplayLog::from_history(&state.history)?;
        let mailbox = Mailbox::default();
        let gate = ReplayGate::from_history(&state.history, mailbox.clone())?;
        let status = watch::Sender::new(HandleState::pending(state.status));

        let instance = Self {
            workflow_id: state.workflow_id.clone(),
            run_id: state.run_id,
            control: Control::new(),
            journal: Journal::new(state, deps.store, deps.config.clone()),
            log,
            gate,
            mailbox,
            activities: deps.activities,
            config: deps.config,
            strict,
            queries: RwLock::new(HashMap::new()),
            status,
            next_call: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
        };
        Ok(Arc::new(instance))
    }

    pub(crate) fn handle(&self) -> WorkflowHandle {
        WorkflowHandle::new(self.workflow_id.clone(), self.run_id, self.status.subscribe())
    }

    /// Consume the next decision sequence.
    pub(crate) fn next_call_id(&self) -> u64 {
        self.next_call.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of decision sequences consumed so far.
    pub(crate) fn calls_made(&self) -> u64 {
        self.next_call.load(Ordering::SeqCst) - 1
    }

    /// Whether the next call will be answered from History.
    pub(crate) fn is_replaying(&self) -> bool {
        self.next_call.load(Ordering::SeqCst) <= self.log.last_call()
    }

    pub(crate) fn record_call(&self, activity: &str, input: &Value) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ActivityCall {
                activity: activity.to_string(),
                input: input.clone(),
            });
    }

    /// Activity calls made by the workflow function, in call order.
    pub(crate) fn activity_calls(&self) -> Vec<ActivityCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the instance with an engine fault and hand the error back.
    pub(crate) fn fault(&self, err: EngineError) -> EngineError {
        if self.control.stop(StopReason::Fault(err.clone())) {
            tracing::error!(
                workflow_id = %self.workflow_id,
                run_id = %self.run_id,
                error = %err,
                "workflow instance faulted"
            );
        }
        err
    }

    pub(crate) fn publish_status(&self, status: WorkflowStatus) {
        self.status.send_modify(|s| s.status = status);
    }

    pub(crate) fn publish_outcome(&self, status: WorkflowStatus, outcome: Result<Value, EngineError>) {
        self.status.send_modify(|s| {
            s.status = status;
            s.outcome = Some(outcome);
        });
    }

    /// Record a signal arrival and route it towards the mailbox.
    pub(crate) async fn accept_signal(&self, signal: Signal) -> Result<(), EngineError> {
        let payload = SignalPayload {
            name: signal.name,
            payload: signal.payload,
        };
        let event = serde_json::to_value(&payload)?;
        self.journal
            .append(EventKind::SignalReceived, None, event)
            .await
            .map_err(|e| if e.is_fatal() { self.fault(e) } else { e })?;
        self.gate.push_live_signal(payload);
        Ok(())
    }

    pub(crate) fn set_query_handler(&self, name: String, handler: QueryFn) {
        self.queries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, handler);
    }

    pub(crate) fn query_handler(&self, name: &str) -> Option<QueryFn> {
        self.queries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, WorkflowStore};

    fn deps(store: Option<SharedStore>) -> InstanceDeps {
        InstanceDeps {
            store,
            activities: ActivityRegistry::new(),
            config: Arc::new(EngineConfig::default()),
        }
    }

    #[test]
    fn test_first_stop_reason_wins() {
        let control = Control::new();
        assert!(control.stop(StopReason::Cancelled));
        assert!(!control.stop(StopReason::TimedOut));
        assert_eq!(control.reason(), Some(StopReason::Cancelled));
        assert!(control.token.is_cancelled());
    }

    #[tokio::test]
    async fn test_journal_appends_are_saved_and_snapshotted() {
        let store = InMemoryStore::new();
        let state = WorkflowState::new("wf-1", "order", Value::Null, None);
        let instance = Instance::new(state, deps(Some(Arc::new(store.clone()))), false).unwrap();

        instance.journal.set_status(WorkflowStatus::Running).await.unwrap();
        let event = instance
            .journal
            .append(EventKind::TimerStarted, Some(1), json!({"duration_ms": 5}))
            .await
            .unwrap();
        assert_eq!(event.sequence, 1);

        let stored = store.load("wf-1").await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.status, WorkflowStatus::Running);
        assert_eq!(instance.journal.snapshot().history, stored.history);
    }

    #[tokio::test]
    async fn test_finish_writes_terminal_event_once() {
        let state = WorkflowState::new("wf-1", "order", Value::Null, None);
        let instance = Instance::new(state, deps(None), false).unwrap();
        instance.journal.set_status(WorkflowStatus::Running).await.unwrap();

        let outcome = Ok(json!("shipped"));
        instance
            .journal
            .finish(WorkflowStatus::Completed, &outcome)
            .await
            .unwrap();
        instance
            .journal
            .finish(WorkflowStatus::Cancelled, &Err(EngineError::Cancelled))
            .await
            .unwrap();

        let snapshot = instance.journal.snapshot();
        assert_eq!(snapshot.status, WorkflowStatus::Completed);
        assert_eq!(snapshot.result, Some(json!("shipped")));
        assert_eq!(snapshot.history.last().unwrap().kind, EventKind::WorkflowCompleted);
        assert_eq!(snapshot.history.len(), 1);
    }

    #[tokio::test]
    async fn test_call_ids_are_sequential() {
        let state = WorkflowState::new("wf-1", "order", Value::Null, None);
        let instance = Instance::new(state, deps(None), false).unwrap();
        assert!(!instance.is_replaying());
        assert_eq!(instance.next_call_id(), 1);
        assert_eq!(instance.next_call_id(), 2);
        assert_eq!(instance.calls_made(), 2);
    }
}
