//! Workflow store trait definition (the persistence port).
//!
//! The engine depends only on `WorkflowStore`; the infrastructure layer
//! (anchorage-infra) implements it with SQLite, and `InMemoryStore` is the
//! reference implementation used in tests.
//!
//! A backend needs no knowledge of replay, retries, or coroutines. It only
//! has to honour two rules:
//! - `save` is an idempotent upsert, atomic per `workflow_id` (no torn
//!   writes visible to a concurrent `load`/`list`).
//! - `load` of an absent ID is `Ok(None)`, never an error.

pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anchorage_types::error::StoreError;
use anchorage_types::workflow::{WorkflowFilter, WorkflowState};

pub use memory::InMemoryStore;

/// Storage interface for durable workflow state.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace the state for `state.workflow_id`.
    fn save(
        &self,
        state: &WorkflowState,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Load a state by ID; `Ok(None)` if absent.
    fn load(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Option<WorkflowState>, StoreError>> + Send;

    /// List states matching `filter`. Ordering is implementation-defined.
    fn list(
        &self,
        filter: WorkflowFilter,
    ) -> impl Future<Output = Result<Vec<WorkflowState>, StoreError>> + Send;

    /// Remove a state. Deleting an absent ID succeeds.
    fn delete(&self, workflow_id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Object-safe version of [`WorkflowStore`] with boxed futures.
///
/// Exists so the executor and workflow contexts can hold a type-erased
/// store. A blanket implementation covers every `WorkflowStore`.
pub trait WorkflowStoreDyn: Send + Sync {
    fn save_boxed<'a>(&'a self, state: &'a WorkflowState) -> StoreFuture<'a, ()>;

    fn load_boxed<'a>(&'a self, workflow_id: &'a str) -> StoreFuture<'a, Option<WorkflowState>>;

    fn list_boxed(&self, filter: WorkflowFilter) -> StoreFuture<'_, Vec<WorkflowState>>;

    fn delete_boxed<'a>(&'a self, workflow_id: &'a str) -> StoreFuture<'a, ()>;
}

impl<T: WorkflowStore> WorkflowStoreDyn for T {
    fn save_boxed<'a>(&'a self, state: &'a WorkflowState) -> StoreFuture<'a, ()> {
        Box::pin(self.save(state))
    }

    fn load_boxed<'a>(&'a self, workflow_id: &'a str) -> StoreFuture<'a, Option<WorkflowState>> {
        Box::pin(self.load(workflow_id))
    }

    fn list_boxed(&self, filter: WorkflowFilter) -> StoreFuture<'_, Vec<WorkflowState>> {
        Box::pin(self.list(filter))
    }

    fn delete_boxed<'a>(&'a self, workflow_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.delete(workflow_id))
    }
}

/// Type-erased, shareable workflow store.
pub type SharedStore = Arc<dyn WorkflowStoreDyn>;
