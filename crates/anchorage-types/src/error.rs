use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error category so callers can branch without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AlreadyExists,
    NotFound,
    NonDeterministic,
    Activity,
    Cancelled,
    TimedOut,
    Workflow,
    Serialization,
    Store,
}

/// Errors from `WorkflowStore` implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store query error: {0}")]
    Query(String),

    #[error("store serialization error: {0}")]
    Serialization(String),

    #[error("invalid workflow state: {0}")]
    InvalidState(String),
}

/// The single error type surfaced by the engine.
///
/// Terminal failures are persisted verbatim in `WorkflowState::error`, which
/// is why this type is `Clone` and serde-enabled.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    /// Bad options, rejected before any state is created.
    #[error("validation error: {0}")]
    Validation(String),

    /// A live instance with this ID already exists.
    #[error("workflow '{0}' already exists")]
    AlreadyExists(String),

    /// Unknown workflow instance, workflow/activity name, or query type.
    #[error("not found: {0}")]
    NotFound(String),

    /// The workflow made a different call than the one recorded in History.
    #[error("non-deterministic replay at call {call_id}: {detail}")]
    NonDeterministic { call_id: u64, detail: String },

    /// An activity failed after its retry policy gave up.
    #[error("activity '{activity}' failed after {attempts} attempt(s): {message}")]
    Activity {
        activity: String,
        attempts: u32,
        message: String,
    },

    #[error("workflow cancelled")]
    Cancelled,

    #[error("workflow timed out")]
    TimedOut,

    /// Application-level failure returned by workflow code.
    #[error("workflow failed: {0}")]
    Workflow(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The executor stopped before the instance reached a terminal state.
    #[error("workflow interrupted: {0}")]
    Interrupted(String),
}

impl EngineError {
    /// Convenience constructor for application failures.
    pub fn workflow(message: impl std::fmt::Display) -> Self {
        Self::Workflow(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NonDeterministic { .. } => ErrorKind::NonDeterministic,
            Self::Activity { .. } => ErrorKind::Activity,
            Self::Cancelled | Self::Interrupted(_) => ErrorKind::Cancelled,
            Self::TimedOut => ErrorKind::TimedOut,
            Self::Workflow(_) => ErrorKind::Workflow,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// Engine-level faults force the instance to `Failed` and are never
    /// handed back to workflow code as a recoverable value.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::NonDeterministic | ErrorKind::Store)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
