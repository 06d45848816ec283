//! Durable workflow execution for Anchorage.
//!
//! This crate holds the engine and the persistence port (`WorkflowStore`)
//! it depends on. It depends only on `anchorage-types` -- never on
//! `anchorage-infra` or any database crate.

pub mod store;
pub mod workflow;

pub use store::{InMemoryStore, SharedStore, WorkflowStore, WorkflowStoreDyn};
pub use workflow::{
    ActivityContext, ActivityRegistry, DurableExecutor, ReplayExecutor, WorkflowContext,
    WorkflowHandle, WorkflowRegistry,
};
