//! Durable workflow engine: registries, the deterministic workflow context,
//! activity retries, replay, and the executor that drives instances.
//!
//! - `registry` -- named workflow and activity functions behind a JSON adapter
//! - `context` -- `WorkflowContext`, the only API workflow code may suspend on
//! - `activity` -- activity attempt loop (timeouts, retries, cancellation)
//! - `retry` -- backoff and jitter arithmetic
//! - `replay` -- History index, ordered resolution gate, signal mailbox
//! - `instance` -- per-instance journal and stop control
//! - `executor` -- `DurableExecutor` and the `ReplayExecutor` implementation
//! - `handle` -- caller-facing `WorkflowHandle`
//! - `hooks` -- lifecycle observers
//! - `middleware` -- type-erased executors and decorator chains

pub mod activity;
pub mod context;
pub mod executor;
pub mod handle;
pub mod hooks;
pub(crate) mod instance;
pub mod middleware;
pub mod registry;
pub(crate) mod replay;
pub mod retry;

pub use activity::{ActivityCall, ActivityContext, NonRetryable};
pub use context::{BUILTIN_QUERIES, SignalChannel, WorkflowContext};
pub use executor::{DurableExecutor, ReplayExecutor, ReplayExecutorBuilder, ReplayReport};
pub use handle::WorkflowHandle;
pub use hooks::{
    BroadcastHooks, CallbackHooks, ComposedHooks, LifecycleEvent, NoopHooks, TracingHooks,
    WorkflowHooks,
};
pub use middleware::{BoxExecutor, DurableExecutorDyn, Middleware, TracingMiddleware, apply_middleware};
pub use registry::{ActivityFn, ActivityRegistry, WorkflowFn, WorkflowRegistry};
