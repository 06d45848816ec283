//! Caller-facing handle to a workflow instance.

use anchorage_types::error::EngineError;
use anchorage_types::workflow::{WorkflowState, WorkflowStatus};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

/// Latest status of an instance plus its outcome once terminal.
#[derive(Debug, Clone)]
pub(crate) struct HandleState {
    pub status: WorkflowStatus,
    pub outcome: Option<Result<Value, EngineError>>,
}

impl HandleState {
    pub(crate) fn pending(status: WorkflowStatus) -> Self {
        Self {
            status,
            outcome: None,
        }
    }

    /// Outcome mirrored from a persisted terminal state.
    pub(crate) fn from_state(state: &WorkflowState) -> Self {
        let outcome = match state.status {
            WorkflowStatus::Completed => Some(Ok(state.result.clone().unwrap_or(Value::Null))),
            WorkflowStatus::Failed => Some(Err(state
                .error
                .clone()
                .unwrap_or_else(|| EngineError::workflow("failed without a recorded error")))),
            WorkflowStatus::Cancelled => Some(Err(state.error.clone().unwrap_or(EngineError::Cancelled))),
            WorkflowStatus::TimedOut => Some(Err(state.error.clone().unwrap_or(EngineError::TimedOut))),
            WorkflowStatus::Pending | WorkflowStatus::Running => None,
        };
        Self {
            status: state.status,
            outcome,
        }
    }
}

/// Handle bound to one run of a workflow instance. Not persisted; cheap to
/// clone.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    run_id: Uuid,
    state: watch::Receiver<HandleState>,
}

impl WorkflowHandle {
    pub(crate) fn new(workflow_id: String, run_id: Uuid, state: watch::Receiver<HandleState>) -> Self {
        Self {
            workflow_id,
            run_id,
            state,
        }
    }

    /// A handle for an instance that is already terminal in the store.
    pub(crate) fn settled(state: &WorkflowState) -> Self {
        let (_tx, rx) = watch::channel(HandleState::from_state(state));
        Self::new(state.workflow_id.clone(), state.run_id, rx)
    }

    pub fn id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Status as last published by the instance.
    pub fn status(&self) -> WorkflowStatus {
        self.state.borrow().status
    }

    /// Block until the instance is terminal and return its outcome.
    ///
    /// Mirrors the persisted result or error exactly. Resolves to
    /// `EngineError::Interrupted` if the executor shut down first.
    pub async fn result(&self) -> Result<Value, EngineError> {
        let mut rx = self.state.clone();
        match rx.wait_for(|s| s.outcome.is_some()).await {
            Ok(state) => state.outcome.clone().unwrap_or_else(|| {
                Err(EngineError::Interrupted("instance published no outcome".to_string()))
            }),
            Err(_) => Err(EngineError::Interrupted(format!(
                "executor dropped workflow '{}' before it finished",
                self.workflow_id
            ))),
        }
    }

    /// Like [`result`](Self::result), decoded into `T`.
    pub async fn result_as<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        let value = self.result().await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_settled_handle_returns_stored_result() {
        let mut state = WorkflowState::new("wf-1", "order", Value::Null, None);
        state.status = WorkflowStatus::Completed;
        state.result = Some(json!("shipped"));

        let handle = WorkflowHandle::settled(&state);
        assert_eq!(handle.id(), "wf-1");
        assert_eq!(handle.run_id(), state.run_id);
        assert_eq!(handle.status(), WorkflowStatus::Completed);
        assert_eq!(handle.result_as::<String>().await.unwrap(), "shipped");
    }

    #[tokio::test]
    async fn test_settled_handle_returns_stored_error() {
        let mut state = WorkflowState::new("wf-1", "order", Value::Null, None);
        state.status = WorkflowStatus::Failed;
        state.error = Some(EngineError::workflow("out of stock"));
        let handle = WorkflowHandle::settled(&state);
        assert_eq!(handle.result().await.unwrap_err(), EngineError::workflow("out of stock"));

        state.status = WorkflowStatus::TimedOut;
        state.error = None;
        let handle = WorkflowHandle::settled(&state);
        assert_eq!(handle.result().await.unwrap_err(), EngineError::TimedOut);
    }

    #[tokio::test]
    async fn test_result_waits_for_outcome() {
        let (tx, rx) = watch::channel(HandleState::pending(WorkflowStatus::Running));
        let handle = WorkflowHandle::new("wf-2".to_string(), Uuid::now_v7(), rx);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.result().await })
        };
        tx.send_modify(|s| {
            s.status = WorkflowStatus::Completed;
            s.outcome = Some(Ok(json!(7)));
        });
        assert_eq!(waiter.await.unwrap().unwrap(), json!(7));
        assert_eq!(handle.status(), WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_dropped_sender_interrupts() {
        let (tx, rx) = watch::channel(HandleState::pending(WorkflowStatus::Running));
        let handle = WorkflowHandle::new("wf-3".to_string(), Uuid::now_v7(), rx);
        drop(tx);
        let err = handle.result().await.unwrap_err();
        assert!(matches!(err, EngineError::Interrupted(_)));
    }
}
