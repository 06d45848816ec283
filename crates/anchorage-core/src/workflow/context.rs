//! The deterministic API handed to workflow functions.
//!
//! `execute_activity`, `sleep` and `receive_signal` are the only legal
//! suspension points inside workflow code. Each `execute_activity` and
//! `sleep` call consumes the next decision sequence (`call_id`) when it is
//! made, not when it is first polled, so concurrently launched calls are
//! numbered in program order.
//!
//! A call whose `call_id` is recorded in History is answered from History
//! after validating that the workflow made the same call; anything else runs
//! live and appends new events.

use std::sync::Arc;
use std::time::Duration;

use anchorage_types::duration::ceil_millis;
use anchorage_types::error::EngineError;
use anchorage_types::workflow::{
    ActivityCompletedPayload, ActivityFailedPayload, ActivityOptions, ActivityScheduledPayload,
    EventKind, HistoryEvent, TimerStartedPayload,
};
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use super::activity::{ActivityInvocation, ActivityOutcome};
use super::instance::{Instance, QueryFn};

/// Query types answered by the executor itself.
pub const BUILTIN_QUERIES: [&str; 3] = ["status", "history", "result"];

/// Handle given to a workflow function. Cheap to clone; clones share the
/// same instance and call counter.
#[derive(Clone)]
pub struct WorkflowContext {
    instance: Arc<Instance>,
}

impl WorkflowContext {
    pub(crate) fn new(instance: Arc<Instance>) -> Self {
        Self { instance }
    }

    pub fn workflow_id(&self) -> &str {
        &self.instance.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.instance.run_id
    }

    /// Whether the next call will be answered from History.
    pub fn is_replaying(&self) -> bool {
        self.instance.is_replaying()
    }

    pub fn is_cancelled(&self) -> bool {
        self.instance.control.token.is_cancelled()
    }

    /// Run an activity and wait for its final result.
    ///
    /// Retries follow `options.retry_policy` (or the engine default). A
    /// failure after retries is returned as `EngineError::Activity`; the
    /// workflow decides what to do with it.
    pub fn execute_activity<I, O>(
        &self,
        activity: &str,
        input: &I,
        options: ActivityOptions,
    ) -> BoxFuture<'static, Result<O, EngineError>>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + Send + 'static,
    {
        let instance = self.instance.clone();
        let call_id = instance.next_call_id();
        let activity = activity.to_string();
        let input = serde_json::to_value(input);
        async move {
            let input = input?;
            instance.record_call(&activity, &input);
            options.validate()?;
            let value = activity_call(&instance, call_id, activity, input, options).await?;
            Ok(serde_json::from_value(value)?)
        }
        .boxed()
    }

    /// Durable timer. Survives restarts: a resumed instance waits only for
    /// the remaining time.
    ///
    /// History keeps millisecond precision, so sub-millisecond parts of
    /// `duration` are rounded up.
    pub fn sleep(&self, duration: Duration) -> BoxFuture<'static, Result<(), EngineError>> {
        let duration = ceil_millis(duration);
        let instance = self.instance.clone();
        let call_id = instance.next_call_id();
        async move { timer_call(&instance, call_id, duration).await }.boxed()
    }

    /// Receiver for signals named `name`, in arrival order.
    pub fn receive_signal(&self, name: impl Into<String>) -> SignalChannel {
        SignalChannel {
            instance: self.instance.clone(),
            name: name.into(),
        }
    }

    /// Expose a custom query. The built-in query types cannot be replaced.
    pub fn set_query_handler<F, T>(&self, query_type: impl Into<String>, handler: F) -> Result<(), EngineError>
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Serialize,
    {
        let query_type = query_type.into();
        if BUILTIN_QUERIES.contains(&query_type.as_str()) {
            return Err(EngineError::Validation(format!(
                "query type '{query_type}' is reserved"
            )));
        }
        let handler: QueryFn =
            Arc::new(move || -> Result<Value, EngineError> { Ok(serde_json::to_value(handler())?) });
        self.instance.set_query_handler(query_type, handler);
        Ok(())
    }
}

/// Per-name signal stream.
pub struct SignalChannel {
    instance: Arc<Instance>,
    name: String,
}

impl SignalChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next payload, or `None` once the instance is stopping.
    pub async fn recv(&mut self) -> Option<Value> {
        self.instance
            .mailbox
            .recv(&self.name, &self.instance.control.token)
            .await
    }

    /// Next payload decoded into `T`.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>, EngineError> {
        match self.recv().await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Payloads already buffered for this name.
    pub fn pending(&self) -> usize {
        self.instance.mailbox.pending(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Activities
// ---------------------------------------------------------------------------

fn mismatch(call_id: u64, detail: String) -> EngineError {
    EngineError::NonDeterministic { call_id, detail }
}

async fn activity_call(
    instance: &Instance,
    call_id: u64,
    activity: String,
    input: Value,
    options: ActivityOptions,
) -> Result<Value, EngineError> {
    let Some(recorded) = instance.log.get(call_id) else {
        if instance.strict {
            return Err(instance.fault(mismatch(
                call_id,
                format!("history has no record of activity '{activity}'"),
            )));
        }
        return live_activity(instance, call_id, activity, input, options, false).await;
    };

    if recorded.scheduled.kind != EventKind::ActivityScheduled {
        return Err(instance.fault(mismatch(
            call_id,
            format!(
                "workflow called activity '{activity}' but history recorded {}",
                recorded.scheduled.kind
            ),
        )));
    }
    let scheduled: ActivityScheduledPayload = recorded
        .scheduled
        .decode()
        .map_err(|e| instance.fault(e))?;
    if scheduled.activity != activity || scheduled.input != input {
        return Err(instance.fault(mismatch(
            call_id,
            format!(
                "workflow called activity '{activity}' with input {input} but history recorded '{}' with input {}",
                scheduled.activity, scheduled.input
            ),
        )));
    }

    match &recorded.resolution {
        Some(resolution) => {
            let mut turn = instance.gate.claim(resolution.sequence);
            turn.wait(&instance.control.token).await?;
            turn.complete();
            tracing::debug!(
                workflow_id = %instance.workflow_id,
                call_id,
                activity = %activity,
                "activity replayed from history"
            );
            recorded_activity_result(instance, &activity, resolution)
        }
        None if instance.strict => Err(instance.fault(mismatch(
            call_id,
            format!("history ends before activity '{activity}' resolved"),
        ))),
        None => {
            tracing::debug!(
                workflow_id = %instance.workflow_id,
                call_id,
                activity = %activity,
                "re-executing activity scheduled before restart"
            );
            live_activity(instance, call_id, activity, input, options, true).await
        }
    }
}

fn recorded_activity_result(
    instance: &Instance,
    activity: &str,
    resolution: &HistoryEvent,
) -> Result<Value, EngineError> {
    if resolution.kind == EventKind::ActivityCompleted {
        let done: ActivityCompletedPayload = resolution.decode().map_err(|e| instance.fault(e))?;
        Ok(done.result)
    } else {
        let failed: ActivityFailedPayload = resolution.decode().map_err(|e| instance.fault(e))?;
        Err(EngineError::Activity {
            activity: activity.to_string(),
            attempts: failed.attempts,
            message: failed.error,
        })
    }
}

async fn live_activity(
    instance: &Instance,
    call_id: u64,
    activity: String,
    input: Value,
    options: ActivityOptions,
    already_scheduled: bool,
) -> Result<Value, EngineError> {
    let func = instance
        .activities
        .get(&activity)
        .ok_or_else(|| EngineError::NotFound(format!("activity '{activity}' is not registered")))?;

    if !already_scheduled {
        let payload = serde_json::to_value(ActivityScheduledPayload {
            activity: activity.clone(),
            input: input.clone(),
        })?;
        instance
            .journal
            .append(EventKind::ActivityScheduled, Some(call_id), payload)
            .await
            .map_err(|e| instance.fault(e))?;
    }

    let invocation = ActivityInvocation {
        workflow_id: instance.workflow_id.clone(),
        activity: activity.clone(),
        call_id,
        input,
        func,
        policy: options
            .retry_policy
            .unwrap_or(instance.config.default_retry_policy),
        timeout: options.timeout.or(instance.config.default_activity_timeout),
        schedule_to_close: options.schedule_to_close,
        jitter: instance.config.retry_jitter,
    };
    let outcome = invocation.run(&instance.control.token).await;
    if outcome == ActivityOutcome::Cancelled {
        return Err(EngineError::Cancelled);
    }
    instance.gate.wait_drained(&instance.control.token).await?;

    match outcome {
        ActivityOutcome::Completed { result, attempts } => {
            let payload = serde_json::to_value(ActivityCompletedPayload {
                result: result.clone(),
                attempts,
            })?;
            instance
                .journal
                .append(EventKind::ActivityCompleted, Some(call_id), payload)
                .await
                .map_err(|e| instance.fault(e))?;
            Ok(result)
        }
        ActivityOutcome::Failed { error, attempts } => {
            let payload = serde_json::to_value(ActivityFailedPayload {
                error: error.clone(),
                attempts,
            })?;
            instance
                .journal
                .append(EventKind::ActivityFailed, Some(call_id), payload)
                .await
                .map_err(|e| instance.fault(e))?;
            Err(EngineError::Activity {
                activity,
                attempts,
                message: error,
            })
        }
        ActivityOutcome::Cancelled => Err(EngineError::Cancelled),
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

async fn timer_call(instance: &Instance, call_id: u64, duration: Duration) -> Result<(), EngineError> {
    let Some(recorded) = instance.log.get(call_id) else {
        if instance.strict {
            return Err(instance.fault(mismatch(call_id, "history has no record of this timer".to_string())));
        }
        let payload = serde_json::to_value(TimerStartedPayload { duration })?;
        instance
            .journal
            .append(EventKind::TimerStarted, Some(call_id), payload)
            .await
            .map_err(|e| instance.fault(e))?;
        return live_timer(instance, call_id, duration).await;
    };

    if recorded.scheduled.kind != EventKind::TimerStarted {
        return Err(instance.fault(mismatch(
            call_id,
            format!("workflow started a timer but history recorded {}", recorded.scheduled.kind),
        )));
    }
    let started: TimerStartedPayload = recorded
        .scheduled
        .decode()
        .map_err(|e| instance.fault(e))?;
    if started.duration != duration {
        return Err(instance.fault(mismatch(
            call_id,
            format!(
                "timer duration changed from {}ms to {}ms",
                started.duration.as_millis(),
                duration.as_millis()
            ),
        )));
    }

    match &recorded.resolution {
        Some(fired) => {
            let mut turn = instance.gate.claim(fired.sequence);
            turn.wait(&instance.control.token).await?;
            turn.complete();
            tracing::debug!(workflow_id = %instance.workflow_id, call_id, "timer replayed from history");
            Ok(())
        }
        None if instance.strict => Err(instance.fault(mismatch(
            call_id,
            "history ends before the timer fired".to_string(),
        ))),
        None => {
            let remaining = chrono::Duration::from_std(duration)
                .ok()
                .and_then(|d| recorded.scheduled.timestamp.checked_add_signed(d))
                .map_or(duration, |fire_at| {
                    (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                });
            tracing::debug!(
                workflow_id = %instance.workflow_id,
                call_id,
                remaining_ms = remaining.as_millis() as u64,
                "resuming timer started before restart"
            );
            live_timer(instance, call_id, remaining).await
        }
    }
}

async fn live_timer(instance: &Instance, call_id: u64, wait: Duration) -> Result<(), EngineError> {
    tokio::select! {
        biased;
        _ = instance.control.token.cancelled() => return Err(EngineError::Cancelled),
        _ = tokio::time::sleep(wait) => {}
    }
    instance.gate.wait_drained(&instance.control.token).await?;
    instance
        .journal
        .append(EventKind::TimerFired, Some(call_id), json!({}))
        .await
        .map_err(|e| instance.fault(e))?;
    Ok(())
}
