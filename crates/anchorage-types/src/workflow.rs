//! Workflow domain types for Anchorage.
//!
//! Defines the event-sourced record of a workflow execution (`WorkflowState`
//! and its append-only `HistoryEvent` log), the caller-facing option types,
//! and the `RetryPolicy` value object.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::duration;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
///
/// Transitions run `Pending -> Running -> {Completed, Failed, Cancelled,
/// TimedOut}`; every terminal state is a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether `self -> next` is a legal lifecycle transition:
    /// `Pending -> Running -> {terminal}`.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        match self {
            Self::Pending => next == Self::Running,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// The kind of a recorded decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    TimerStarted,
    TimerFired,
    SignalReceived,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    WorkflowTimedOut,
}

impl EventKind {
    /// Events that resolve a pending call or feed the signal mailbox. Replay
    /// releases these strictly in History order.
    pub fn is_resolution(self) -> bool {
        matches!(
            self,
            Self::ActivityCompleted | Self::ActivityFailed | Self::TimerFired | Self::SignalReceived
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::ActivityScheduled => "activity_scheduled",
            Self::ActivityCompleted => "activity_completed",
            Self::ActivityFailed => "activity_failed",
            Self::TimerStarted => "timer_started",
            Self::TimerFired => "timer_fired",
            Self::SignalReceived => "signal_received",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::WorkflowTimedOut => "workflow_timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "workflow_started" => Self::WorkflowStarted,
            "activity_scheduled" => Self::ActivityScheduled,
            "activity_completed" => Self::ActivityCompleted,
            "activity_failed" => Self::ActivityFailed,
            "timer_started" => Self::TimerStarted,
            "timer_fired" => Self::TimerFired,
            "signal_received" => Self::SignalReceived,
            "workflow_completed" => Self::WorkflowCompleted,
            "workflow_failed" => Self::WorkflowFailed,
            "workflow_cancelled" => Self::WorkflowCancelled,
            "workflow_timed_out" => Self::WorkflowTimedOut,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry in a workflow's History.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Contiguous per-instance index, starting at 1.
    pub sequence: u64,
    /// Decision sequence of the workflow call this event belongs to. `None`
    /// for lifecycle and signal-arrival events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u64>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Serialized input/result/error; shape depends on `kind`.
    #[serde(default)]
    pub payload: Value,
}

impl HistoryEvent {
    /// Decode the payload into one of the typed payload structs below.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EngineError::Serialization(format!(
                "event {} ({}) has a malformed payload: {e}",
                self.sequence, self.kind
            ))
        })
    }
}

/// Payload of `WorkflowStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartedPayload {
    pub workflow: String,
    pub input: Value,
}

/// Payload of `ActivityScheduled`. Name and input form the call signature
/// that replay validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityScheduledPayload {
    pub activity: String,
    pub input: Value,
}

/// Payload of `ActivityCompleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCompletedPayload {
    pub result: Value,
    pub attempts: u32,
}

/// Payload of `ActivityFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFailedPayload {
    pub error: String,
    pub attempts: u32,
}

/// Payload of `TimerStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerStartedPayload {
    #[serde(rename = "duration_ms", with = "duration::millis")]
    pub duration: Duration,
}

/// Payload of `SignalReceived`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// The durable record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Caller-supplied unique ID.
    pub workflow_id: String,
    /// UUIDv7 identifying this particular run of `workflow_id`.
    pub run_id: Uuid,
    /// Registry name of the workflow function.
    pub workflow_name: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    /// Append-only, strictly ordered by `sequence`.
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, rename = "timeout_ms", with = "duration::millis_opt")]
    pub timeout: Option<Duration>,
}

impl WorkflowState {
    /// Create a `Pending` state with an empty History.
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        input: Value,
        timeout: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            run_id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            status: WorkflowStatus::Pending,
            input,
            result: None,
            error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            timeout,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn next_sequence(&self) -> u64 {
        self.history.last().map_or(1, |e| e.sequence + 1)
    }

    /// Append a new event with the next sequence number and return a copy.
    pub fn append(&mut self, kind: EventKind, call_id: Option<u64>, payload: Value) -> HistoryEvent {
        let now = Utc::now();
        let event = HistoryEvent {
            sequence: self.next_sequence(),
            call_id,
            kind,
            timestamp: now,
            payload,
        };
        self.history.push(event.clone());
        self.updated_at = now;
        event
    }

    /// Move to `next`, rejecting transitions out of a terminal state.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), EngineError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Validation(format!(
                "illegal status transition {} -> {} for workflow '{}'",
                self.status, next, self.workflow_id
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to the terminal status `terminal`. An instance that never left
    /// `Pending` (stopped while waiting for a worker slot, or an orphan that
    /// never ran) passes through `Running` first.
    pub fn settle(&mut self, terminal: WorkflowStatus) -> Result<(), EngineError> {
        if !terminal.is_terminal() {
            return Err(EngineError::Validation(format!(
                "{terminal} is not a terminal status"
            )));
        }
        if self.status == WorkflowStatus::Pending {
            self.transition(WorkflowStatus::Running)?;
        }
        self.transition(terminal)
    }

    /// Check that History sequences form a contiguous run starting at 1.
    pub fn validate_history(&self) -> Result<(), EngineError> {
        for (idx, event) in self.history.iter().enumerate() {
            let expected = idx as u64 + 1;
            if event.sequence != expected {
                return Err(EngineError::Validation(format!(
                    "history of '{}' has a gap: expected sequence {expected}, found {}",
                    self.workflow_id, event.sequence
                )));
            }
        }
        Ok(())
    }

    /// The instant at which the workflow-level timeout expires, if any.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(self.timeout?).ok()?;
        self.created_at.checked_add_signed(timeout)
    }
}

// ---------------------------------------------------------------------------
// Caller-facing options
// ---------------------------------------------------------------------------

/// Options for `DurableExecutor::execute`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Required, non-empty instance ID.
    pub id: String,
    #[serde(default)]
    pub input: Value,
    /// Workflow-level timeout measured from creation.
    #[serde(default, rename = "timeout_ms", with = "duration::millis_opt")]
    pub timeout: Option<Duration>,
    /// Replace a terminal instance with a new run instead of returning its
    /// stored result.
    #[serde(default)]
    pub fresh: bool,
}

impl WorkflowOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fresh(mut self) -> Self {
        self.fresh = true;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Validation("workflow id is required".to_string()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(EngineError::Validation(
                "workflow timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded exponential backoff parameters for activity retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 means unbounded.
    pub max_attempts: u32,
    #[serde(rename = "initial_interval_ms", with = "duration::millis")]
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    /// Upper bound for a single delay; zero means uncapped.
    #[serde(default, rename = "max_interval_ms", with = "duration::millis")]
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs an activity exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(EngineError::Validation(format!(
                "backoff coefficient must be >= 1.0, got {}",
                self.backoff_coefficient
            )));
        }
        if !self.max_interval.is_zero() && self.max_interval < self.initial_interval {
            return Err(EngineError::Validation(
                "max interval must not be smaller than the initial interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-call options for `WorkflowContext::execute_activity`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityOptions {
    /// Bounds a single attempt.
    pub timeout: Option<Duration>,
    /// Bounds the whole retry loop, measured from the first attempt.
    pub schedule_to_close: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

impl ActivityOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_schedule_to_close(mut self, timeout: Duration) -> Self {
        self.schedule_to_close = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
            if policy.max_attempts == 0 && self.schedule_to_close.is_none() {
                return Err(EngineError::Validation(
                    "unbounded retries (max_attempts = 0) require a schedule-to-close timeout"
                        .to_string(),
                ));
            }
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(EngineError::Validation(
                "activity timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A named payload delivered to a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Signal {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Filter for `WorkflowStore::list`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    /// Maximum number of results; `None` or 0 means no limit.
    pub limit: Option<usize>,
}

impl WorkflowFilter {
    pub fn with_status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, state: &WorkflowState) -> bool {
        self.status.is_none_or(|s| s == state.status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_states_are_sinks() {
        for terminal in [
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
            WorkflowStatus::TimedOut,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(WorkflowStatus::Running));
            assert!(!terminal.can_transition_to(WorkflowStatus::Completed));
        }
        assert!(WorkflowStatus::Pending.can_transition_to(WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Completed));
        assert!(!WorkflowStatus::Running.can_transition_to(WorkflowStatus::Pending));
    }

    #[test]
    fn test_pending_cannot_skip_running() {
        for terminal in [
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
            WorkflowStatus::TimedOut,
        ] {
            assert!(!WorkflowStatus::Pending.can_transition_to(terminal));
        }
        let mut state = WorkflowState::new("wf-1", "order", Value::Null, None);
        let err = state.transition(WorkflowStatus::Cancelled).unwrap_err();
        assert!(err.to_string().contains("pending -> cancelled"));
        assert_eq!(state.status, WorkflowStatus::Pending);
    }

    #[test]
    fn test_settle_routes_pending_through_running() {
        let mut state = WorkflowState::new("wf-1", "order", Value::Null, None);
        state.settle(WorkflowStatus::Cancelled).unwrap();
        assert_eq!(state.status, WorkflowStatus::Cancelled);

        let mut state = WorkflowState::new("wf-2", "order", Value::Null, None);
        assert!(state.settle(WorkflowStatus::Running).is_err());
        state.settle(WorkflowStatus::Failed).unwrap();
        assert!(state.settle(WorkflowStatus::Completed).is_err());
    }

    #[test]
    fn test_transition_rejects_leaving_terminal_state() {
        let mut state = WorkflowState::new("wf-1", "order", Value::Null, None);
        state.transition(WorkflowStatus::Running).unwrap();
        state.transition(WorkflowStatus::Completed).unwrap();
        let err = state.transition(WorkflowStatus::Failed).unwrap_err();
        assert!(err.to_string().contains("completed -> failed"));
        assert_eq!(state.status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let mut state = WorkflowState::new("wf-1", "order", json!({"amount": 10}), None);
        let first = state.append(EventKind::WorkflowStarted, None, json!({}));
        let second = state.append(EventKind::ActivityScheduled, Some(1), json!({}));
        let third = state.append(EventKind::ActivityCompleted, Some(1), json!({}));
        assert_eq!((first.sequence, second.sequence, third.sequence), (1, 2, 3));
        assert_eq!(state.next_sequence(), 4);
        state.validate_history().unwrap();

        state.history.remove(1);
        assert!(state.validate_history().is_err());
    }

    #[test]
    fn test_status_and_kind_string_forms_round_trip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
            WorkflowStatus::TimedOut,
        ] {
            assert_eq!(WorkflowStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                Value::String(status.as_str().to_string())
            );
        }
        assert_eq!(EventKind::parse("timer_fired"), Some(EventKind::TimerFired));
        assert_eq!(EventKind::parse("bogus"), None);
    }

    #[test]
    fn test_workflow_options_validation() {
        assert!(WorkflowOptions::new("").validate().is_err());
        assert!(WorkflowOptions::new("  ").validate().is_err());
        assert!(
            WorkflowOptions::new("wf")
                .with_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        WorkflowOptions::new("wf")
            .with_input(json!("hello"))
            .with_timeout(Duration::from_secs(5))
            .validate()
            .unwrap();
    }

    #[test]
    fn test_unbounded_retries_need_schedule_to_close() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        let opts = ActivityOptions::default().with_retry(policy);
        assert!(opts.validate().is_err());
        opts.with_schedule_to_close(Duration::from_secs(30))
            .validate()
            .unwrap();
    }

    #[test]
    fn test_retry_policy_rejects_shrinking_backoff() {
        let policy = RetryPolicy {
            backoff_coefficient: 0.5,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
        RetryPolicy::default().validate().unwrap();
    }

    #[test]
    fn test_deadline_is_measured_from_creation() {
        let state = WorkflowState::new("wf", "order", Value::Null, Some(Duration::from_secs(60)));
        let deadline = state.deadline().unwrap();
        assert_eq!((deadline - state.created_at).num_seconds(), 60);
        assert!(WorkflowState::new("wf", "order", Value::Null, None).deadline().is_none());
    }

    #[test]
    fn test_filter_matches_status() {
        let state = WorkflowState::new("wf", "order", Value::Null, None);
        assert!(WorkflowFilter::default().matches(&state));
        assert!(WorkflowFilter::with_status(WorkflowStatus::Pending).matches(&state));
        assert!(!WorkflowFilter::with_status(WorkflowStatus::Running).matches(&state));
    }

    #[test]
    fn test_state_json_round_trip_preserves_history() {
        let mut state = WorkflowState::new("wf-9", "order", json!({"amount": 10}), Some(Duration::from_millis(1500)));
        state.append(
            EventKind::TimerStarted,
            Some(1),
            serde_json::to_value(TimerStartedPayload {
                duration: Duration::from_millis(250),
            })
            .unwrap(),
        );
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);

        let timer: TimerStartedPayload = back.history[0].decode().unwrap();
        assert_eq!(timer.duration, Duration::from_millis(250));
        assert_eq!(back.history[0].payload["duration_ms"], 250);
    }
}
