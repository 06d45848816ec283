//! Activity invocation: the attempt loop behind `WorkflowContext::execute_activity`.
//!
//! Each attempt runs on its own tokio task so a panic or a hung body is
//! contained to that attempt. The loop applies the retry policy, bounds each
//! attempt by the per-attempt timeout, bounds the whole loop by the
//! schedule-to-close timeout, and stops as soon as the instance is cancelled.

use std::time::Duration;

use anchorage_types::workflow::RetryPolicy;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::ActivityFn;
use super::retry::{apply_jitter, backoff_delay, should_retry};

/// Information handed to an activity body on every attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub workflow_id: String,
    pub activity: String,
    /// Decision sequence of the `execute_activity` call.
    pub call_id: u64,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Cancelled when the attempt times out or the instance stops.
    pub cancellation: CancellationToken,
}

impl ActivityContext {
    /// Key that stays the same across retries and process restarts.
    ///
    /// Activities run at least once; side-effecting bodies should
    /// deduplicate on this key.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.workflow_id, self.call_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// One `execute_activity` call as made by workflow code.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCall {
    pub activity: String,
    pub input: Value,
}

/// Marks an activity error as permanent: the retry loop stops immediately.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct NonRetryable(pub String);

impl NonRetryable {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Aborts the wrapped task when dropped.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One pending activity call, alive only until it resolves.
pub(crate) struct ActivityInvocation {
    pub workflow_id: String,
    pub activity: String,
    pub call_id: u64,
    pub input: Value,
    pub func: ActivityFn,
    pub policy: RetryPolicy,
    pub timeout: Option<Duration>,
    pub schedule_to_close: Option<Duration>,
    pub jitter: f64,
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ActivityOutcome {
    Completed { result: Value, attempts: u32 },
    Failed { error: String, attempts: u32 },
    Cancelled,
}

enum AttemptError {
    Retryable(String),
    Permanent(String),
}

impl ActivityInvocation {
    pub(crate) async fn run(self, token: &CancellationToken) -> ActivityOutcome {
        let deadline = self.schedule_to_close.map(|d| Instant::now() + d);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match self.attempt(attempt, deadline, token).await {
                Ok(result) => {
                    tracing::debug!(
                        workflow_id = %self.workflow_id,
                        activity = %self.activity,
                        call_id = self.call_id,
                        attempt,
                        "activity attempt succeeded"
                    );
                    return ActivityOutcome::Completed {
                        result,
                        attempts: attempt,
                    };
                }
                Err(None) => return ActivityOutcome::Cancelled,
                Err(Some(AttemptError::Permanent(error))) => {
                    return ActivityOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
                Err(Some(AttemptError::Retryable(error))) => error,
            };

            if !should_retry(attempt, &self.policy) {
                return ActivityOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }

            let delay = apply_jitter(
                backoff_delay(attempt, &self.policy),
                self.jitter,
                self.policy.max_interval,
                &mut rand::thread_rng(),
            );
            if let Some(deadline) = deadline {
                // A delay too large to represent lands past any deadline.
                let retry_at = Instant::now().checked_add(delay);
                if retry_at.is_none_or(|at| at >= deadline) {
                    tracing::debug!(
                        workflow_id = %self.workflow_id,
                        activity = %self.activity,
                        attempt,
                        "schedule-to-close deadline reached, giving up"
                    );
                    return ActivityOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
            }

            tracing::warn!(
                workflow_id = %self.workflow_id,
                activity = %self.activity,
                call_id = self.call_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "activity attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return ActivityOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run a single attempt. `Err(None)` means the instance was cancelled.
    async fn attempt(
        &self,
        attempt: u32,
        deadline: Option<Instant>,
        token: &CancellationToken,
    ) -> Result<Value, Option<AttemptError>> {
        let attempt_token = token.child_token();
        let ctx = ActivityContext {
            workflow_id: self.workflow_id.clone(),
            activity: self.activity.clone(),
            call_id: self.call_id,
            attempt,
            cancellation: attempt_token.clone(),
        };
        let mut task = AbortOnDrop(tokio::spawn((self.func)(ctx, self.input.clone())));

        let limit = match (self.timeout, deadline) {
            (Some(t), Some(d)) => Some(t.min(d.saturating_duration_since(Instant::now()))),
            (Some(t), None) => Some(t),
            (None, Some(d)) => Some(d.saturating_duration_since(Instant::now())),
            (None, None) => None,
        };

        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(None),
            joined = async {
                match limit {
                    Some(limit) => tokio::time::timeout(limit, &mut task.0).await.ok(),
                    None => Some((&mut task.0).await),
                }
            } => joined,
        };
        attempt_token.cancel();

        match joined {
            Some(Ok(Ok(value))) => Ok(value),
            Some(Ok(Err(e))) => {
                let message = format!("{e:#}");
                if e.chain().any(|cause| cause.is::<NonRetryable>()) {
                    Err(Some(AttemptError::Permanent(message)))
                } else {
                    Err(Some(AttemptError::Retryable(message)))
                }
            }
            Some(Err(join_error)) => Err(Some(AttemptError::Retryable(format!(
                "activity panicked: {join_error}"
            )))),
            None => Err(Some(AttemptError::Retryable(format!(
                "attempt timed out after {}ms",
                limit.unwrap_or_default().as_millis()
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_util::FutureExt;
    use serde_json::json;

    fn invocation(func: ActivityFn, policy: RetryPolicy) -> ActivityInvocation {
        ActivityInvocation {
            workflow_id: "wf-1".to_string(),
            activity: "flaky".to_string(),
            call_id: 1,
            input: json!(null),
            func,
            policy,
            timeout: None,
            schedule_to_close: None,
            jitter: 0.0,
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(5),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_millis(20),
        }
    }

    /// Fails `failures` times, then returns the attempt number.
    fn failing(failures: u32, calls: Arc<AtomicU32>) -> ActivityFn {
        Arc::new(move |ctx: ActivityContext, _input: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt <= failures {
                    anyhow::bail!("attempt {} failed", ctx.attempt);
                }
                Ok(json!(ctx.attempt))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invocation(failing(2, calls.clone()), fast_policy(3));
        let outcome = inv.run(&CancellationToken::new()).await;
        assert_eq!(
            outcome,
            ActivityOutcome::Completed {
                result: json!(3),
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let calls = Arc::new(AtomicU32::new(0));
        let inv = invocation(failing(u32::MAX, calls.clone()), fast_policy(4));
        match inv.run(&CancellationToken::new()).await {
            ActivityOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 4);
                assert!(error.contains("attempt 4 failed"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let func: ActivityFn = Arc::new(move |_ctx: ActivityContext, _input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(anyhow::Error::new(NonRetryable::new("card declined")))
            }
            .boxed()
        });
        let outcome = invocation(func, fast_policy(5))
            .run(&CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            ActivityOutcome::Failed {
                error: "card declined".to_string(),
                attempts: 1
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_attempt_timeout_counts_as_failure() {
        let func: ActivityFn = Arc::new(|ctx: ActivityContext, _input: Value| {
            async move {
                if ctx.attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, anyhow::Error>(json!("done"))
            }
            .boxed()
        });
        let mut inv = invocation(func, fast_policy(2));
        inv.timeout = Some(Duration::from_millis(30));
        let outcome = inv.run(&CancellationToken::new()).await;
        assert_eq!(
            outcome,
            ActivityOutcome::Completed {
                result: json!("done"),
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn test_schedule_to_close_bounds_unbounded_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut inv = invocation(failing(u32::MAX, calls.clone()), fast_policy(0));
        inv.schedule_to_close = Some(Duration::from_millis(60));
        let started = Instant::now();
        let outcome = inv.run(&CancellationToken::new()).await;
        assert!(matches!(outcome, ActivityOutcome::Failed { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_retried() {
        let func: ActivityFn = Arc::new(|ctx: ActivityContext, _input: Value| {
            async move {
                if ctx.attempt == 1 {
                    panic!("boom");
                }
                Ok::<_, anyhow::Error>(json!(ctx.attempt))
            }
            .boxed()
        });
        let outcome = invocation(func, fast_policy(2))
            .run(&CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            ActivityOutcome::Completed {
                result: json!(2),
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_attempt() {
        let token = CancellationToken::new();
        let func: ActivityFn = Arc::new(|_ctx: ActivityContext, _input: Value| {
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, anyhow::Error>(Value::Null)
            }
            .boxed()
        });
        let inv = invocation(func, fast_policy(3));
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert_eq!(inv.run(&token).await, ActivityOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_overflowing_backoff_gives_up_at_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_millis(1),
            backoff_coefficient: 1e300,
            max_interval: Duration::ZERO,
        };
        let mut inv = invocation(failing(u32::MAX, calls.clone()), policy);
        inv.schedule_to_close = Some(Duration::from_secs(5));
        inv.jitter = 0.2;
        let started = Instant::now();
        match inv.run(&CancellationToken::new()).await {
            ActivityOutcome::Failed { attempts, .. } => assert!(attempts >= 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_idempotency_key_ignores_attempt() {
        let mut ctx = ActivityContext {
            workflow_id: "order-7".to_string(),
            activity: "pay".to_string(),
            call_id: 2,
            attempt: 1,
            cancellation: CancellationToken::new(),
        };
        let first = ctx.idempotency_key();
        ctx.attempt = 3;
        assert_eq!(ctx.idempotency_key(), first);
        assert_eq!(first, "order-7-2");
    }
}
