//! In-memory implementation of `WorkflowStore`.
//!
//! Stores states in a `HashMap` behind a `RwLock`. Every call clones whole
//! states in and out, so a concurrent reader never observes a partially
//! written one. Useful for tests and as a reference implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anchorage_types::error::StoreError;
use anchorage_types::workflow::{WorkflowFilter, WorkflowState};

use super::WorkflowStore;

/// Thread-safe in-memory store. Cloning shares the underlying map, which is
/// how tests hand "the same disk" to a second executor after a crash.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    states: Arc<RwLock<HashMap<String, WorkflowState>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored states.
    pub fn len(&self) -> usize {
        self.states.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Connection(format!("lock poisoned: {err}"))
}

impl WorkflowStore for InMemoryStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        if state.workflow_id.is_empty() {
            return Err(StoreError::InvalidState(
                "workflow_id must not be empty".to_string(),
            ));
        }
        let mut states = self.states.write().map_err(lock_error)?;
        states.insert(state.workflow_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let states = self.states.read().map_err(lock_error)?;
        Ok(states.get(workflow_id).cloned())
    }

    /// Ordered by `created_at`, oldest first.
    async fn list(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowState>, StoreError> {
        let states = self.states.read().map_err(lock_error)?;
        let mut matching: Vec<WorkflowState> = states
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        drop(states);

        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        if let Some(limit) = filter.limit.filter(|l| *l > 0) {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        let mut states = self.states.write().map_err(lock_error)?;
        states.remove(workflow_id);
        Ok(())
    }
}
