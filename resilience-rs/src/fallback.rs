//! # Fallback Orchestration
//!
//! Runs an operation under a retry policy and, once attempts are exhausted,
//! invokes a fallback exactly once. Every failed attempt is recorded as a
//! WARNING, exhaustion as ERROR (CRITICAL for critical calls), and the id of
//! the exhaustion record travels with the degraded result.
//!
//! A call may carry a deadline and a cancellation token. Both interrupt an
//! in-flight attempt as well as the backoff sleep between attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::taxonomy::{Component, Severity};
use crate::tracker::{ErrorRecord, ErrorTracker};
use crate::types::{Error, ErrorKind, Result};

/// Result of an orchestrated call
#[derive(Debug)]
pub enum FallbackResult<T> {
    /// The primary operation succeeded
    Primary(T),
    /// Retries were exhausted and the fallback produced a degraded value
    Fallback { value: T, error_id: String },
    /// The deadline passed or the caller cancelled; no fallback was run
    Cancelled { error_id: String },
    /// Both the operation and its fallback failed
    Failure(Error),
}

impl<T> FallbackResult<T> {
    /// Converts to a standard Result
    pub fn into_result(self) -> Result<T> {
        match self {
            FallbackResult::Primary(value) => Ok(value),
            FallbackResult::Fallback { value, .. } => Ok(value),
            FallbackResult::Cancelled { error_id } => Err(Error::new(
                ErrorKind::Cancelled,
                "operation cancelled before completion",
            )
            .with_error_id(error_id)),
            FallbackResult::Failure(error) => Err(error),
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, FallbackResult::Primary(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, FallbackResult::Fallback { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FallbackResult::Cancelled { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FallbackResult::Failure(_))
    }

    /// Id of the record explaining why the primary result is missing
    pub fn error_id(&self) -> Option<&str> {
        match self {
            FallbackResult::Primary(_) => None,
            FallbackResult::Fallback { error_id, .. } | FallbackResult::Cancelled { error_id } => {
                Some(error_id)
            }
            FallbackResult::Failure(error) => error.error_id.as_deref(),
        }
    }

    /// The produced value, primary or degraded
    pub fn value(&self) -> Option<&T> {
        match self {
            FallbackResult::Primary(value) | FallbackResult::Fallback { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Describes one orchestrated call
#[derive(Debug, Clone)]
pub struct Call {
    pub operation: String,
    pub component: Component,
    /// Exhaustion is recorded as CRITICAL instead of ERROR
    pub critical: bool,
    /// Absolute deadline shared by every execution of this call
    pub deadline: Option<Instant>,
    /// Budget measured from the start of each execution
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Overrides the orchestrator's default policy
    pub policy: Option<RetryPolicy>,
}

impl Call {
    pub fn new<S: Into<String>>(operation: S, component: Component) -> Self {
        Self {
            operation: operation.into(),
            component,
            critical: false,
            deadline: None,
            timeout: None,
            cancel: None,
            policy: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    // Earlier of the absolute deadline and the timeout counted from now
    fn deadline_from_now(&self) -> Option<Instant> {
        let relative = self.timeout.map(|timeout| Instant::now() + timeout);
        match (self.deadline, relative) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Runs operations with retries and a single fallback
#[derive(Debug, Clone)]
pub struct FallbackOrchestrator {
    tracker: Arc<ErrorTracker>,
    default_policy: RetryPolicy,
}

impl FallbackOrchestrator {
    pub fn new(tracker: Arc<ErrorTracker>, default_policy: RetryPolicy) -> Self {
        Self {
            tracker,
            default_policy,
        }
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Runs `operation` under the call's policy, then `fallback` at most once.
    ///
    /// Non-transient failures skip the remaining attempts. Cancellation and
    /// deadline expiry end the call without running the fallback.
    pub async fn execute<T, Op, OpFut, Fb, FbFut>(
        &self,
        call: &Call,
        mut operation: Op,
        fallback: Fb,
    ) -> FallbackResult<T>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = Result<T>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        let policy = call.policy.as_ref().unwrap_or(&self.default_policy);
        let scope = Scope {
            deadline: call.deadline_from_now(),
            cancel: call.cancel.as_ref(),
        };
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;

        let last_error = loop {
            attempt += 1;
            counter!(
                "resilience.retry.attempts",
                1,
                "component" => call.component.as_str()
            );

            let outcome = match guarded(&scope, operation()).await {
                Some(outcome) => outcome,
                None => return self.cancelled(call, attempt).await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = %call.operation,
                            attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    return FallbackResult::Primary(value);
                }
                Err(error) => error,
            };

            self.tracker
                .record(
                    call.component,
                    Severity::Warning,
                    format!(
                        "{} failed (attempt {}/{}): {}",
                        call.operation, attempt, max_attempts, error.message
                    ),
                    attempt_details(&error, attempt),
                )
                .await;

            if !policy.should_retry(&error, attempt) {
                break error;
            }

            let delay = policy.backoff_for(attempt);
            debug!(
                operation = %call.operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            if guarded(&scope, tokio::time::sleep(delay)).await.is_none() {
                return self.cancelled(call, attempt).await;
            }
        };

        let severity = if call.critical {
            Severity::Critical
        } else {
            Severity::Error
        };
        let exhausted = self
            .tracker
            .record(
                call.component,
                severity,
                format!(
                    "{} failed after {} attempt(s): {}",
                    call.operation, attempt, last_error.message
                ),
                attempt_details(&last_error, attempt),
            )
            .await;

        counter!(
            "resilience.retry.exhausted",
            1,
            "component" => call.component.as_str()
        );
        counter!(
            "resilience.fallback.invoked",
            1,
            "component" => call.component.as_str()
        );
        warn!(
            operation = %call.operation,
            error_id = %exhausted.id,
            "Retries exhausted, using fallback"
        );

        match guarded(&scope, fallback()).await {
            None => self.cancelled(call, attempt).await,
            Some(Ok(value)) => FallbackResult::Fallback {
                value,
                error_id: exhausted.id,
            },
            Some(Err(fallback_error)) => self.fallback_failed(call, &exhausted, fallback_error).await,
        }
    }

    /// Packages `operation` and `fallback` into a reusable callable that
    /// runs [`FallbackOrchestrator::execute`] on every invocation
    pub fn wrap<T, Op, OpFut, Fb, FbFut>(
        self: Arc<Self>,
        call: Call,
        operation: Op,
        fallback: Fb,
    ) -> impl Fn() -> BoxFuture<'static, FallbackResult<T>> + Send + Sync
    where
        T: Send + 'static,
        Op: Fn() -> OpFut + Clone + Send + Sync + 'static,
        OpFut: Future<Output = Result<T>> + Send + 'static,
        Fb: Fn() -> FbFut + Clone + Send + Sync + 'static,
        FbFut: Future<Output = Result<T>> + Send + 'static,
    {
        move || {
            let orchestrator = Arc::clone(&self);
            let call = call.clone();
            let operation = operation.clone();
            let fallback = fallback.clone();
            Box::pin(async move { orchestrator.execute(&call, operation, fallback).await })
        }
    }

    async fn cancelled<T>(&self, call: &Call, attempt: u32) -> FallbackResult<T> {
        let reason = if call.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            "cancelled"
        } else {
            "deadline exceeded"
        };
        counter!(
            "resilience.fallback.cancelled",
            1,
            "component" => call.component.as_str()
        );

        let record = self
            .tracker
            .record(
                call.component,
                Severity::Warning,
                format!("{} {} during attempt {}", call.operation, reason, attempt),
                vec![format!("operation: {}", call.operation)],
            )
            .await;

        FallbackResult::Cancelled { error_id: record.id }
    }

    async fn fallback_failed<T>(
        &self,
        call: &Call,
        exhausted: &ErrorRecord,
        error: Error,
    ) -> FallbackResult<T> {
        counter!(
            "resilience.fallback.failed",
            1,
            "component" => call.component.as_str()
        );

        let mut details = vec![format!("retry exhaustion: {}", exhausted.id)];
        details.extend(error.chain());
        let record = self
            .tracker
            .record(
                call.component,
                Severity::Critical,
                format!("Fallback for {} failed: {}", call.operation, error.message),
                details,
            )
            .await;

        let component = error.component.unwrap_or(call.component);
        FallbackResult::Failure(error.component(component).with_error_id(record.id))
    }
}

// Deadline and token in force for one execution
struct Scope<'a> {
    deadline: Option<Instant>,
    cancel: Option<&'a CancellationToken>,
}

// Races `future` against the scope's cancellation token and deadline
async fn guarded<F: Future>(scope: &Scope<'_>, future: F) -> Option<F::Output> {
    let cancelled = async {
        match scope.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let expired = async {
        match scope.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => None,
        _ = expired => None,
        output = future => Some(output),
    }
}

fn attempt_details(error: &Error, attempt: u32) -> Vec<String> {
    let mut details = vec![
        format!("attempt: {}", attempt),
        format!("kind: {}", error.kind),
        format!("transient: {}", error.is_transient()),
    ];
    details.extend(error.details.iter().cloned());
    details.extend(error.chain().into_iter().skip(1));
    details
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::retry::RetryConfig;
    use crate::tracker::TrackerConfig;

    fn orchestrator(max_attempts: u32) -> FallbackOrchestrator {
        let policy = RetryPolicy::new(
            "test",
            RetryConfig {
                max_attempts,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                jitter_fraction: 0.0,
            },
        );
        FallbackOrchestrator::new(Arc::new(ErrorTracker::new(TrackerConfig::default())), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_success_records_nothing() {
        let orchestrator = orchestrator(3);
        let call = Call::new("search_flights", Component::Search);

        let result = orchestrator
            .execute(&call, || async { Ok::<_, Error>(7) }, || async { Ok(0) })
            .await;

        assert!(result.is_primary());
        assert_eq!(result.value(), Some(&7));
        assert!(orchestrator.tracker().recent(10).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_second_attempt() {
        let orchestrator = orchestrator(3);
        let call = Call::new("complete", Component::Llm);
        let attempts = AtomicU32::new(0);

        let result = orchestrator
            .execute(
                &call,
                || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n == 1 {
                            Err(Error::llm("timeout"))
                        } else {
                            Ok("answer")
                        }
                    }
                },
                || async { Ok("canned") },
            )
            .await;

        assert!(result.is_primary());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let recent = orchestrator.tracker().recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].severity, Severity::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_skips_retries() {
        let orchestrator = orchestrator(5);
        let call = Call::new("complete", Component::Llm);
        let attempts = AtomicU32::new(0);

        let result = orchestrator
            .execute(
                &call,
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<&str, _>(Error::llm("invalid api key").permanent()) }
                },
                || async { Ok("canned") },
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(result.is_fallback());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_call_exhaustion_is_critical() {
        let orchestrator = orchestrator(2);
        let call = Call::new("store_session", Component::Store).critical();

        let result = orchestrator
            .execute(
                &call,
                || async { Err::<u8, _>(Error::store("connection refused")) },
                || async { Ok(0) },
            )
            .await;

        let error_id = result.error_id().unwrap().to_string();
        let record = orchestrator.tracker().get(&error_id).await.unwrap();
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.component, Component::Store);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_is_terminal() {
        let orchestrator = orchestrator(2);
        let call = Call::new("search_hotels", Component::Search);

        let result = orchestrator
            .execute(
                &call,
                || async { Err::<u8, _>(Error::search("503")) },
                || async { Err(Error::internal("no canned data")) },
            )
            .await;

        assert!(result.is_failure());
        let error_id = result.error_id().unwrap().to_string();
        let record = orchestrator.tracker().get(&error_id).await.unwrap();
        assert_eq!(record.severity, Severity::Critical);

        let err = result.into_result().unwrap_err();
        assert_eq!(err.error_id.as_deref(), Some(error_id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_backoff() {
        let orchestrator = orchestrator(3);
        let token = CancellationToken::new();
        let call = Call::new("complete", Component::Llm).cancel_on(token.clone());
        let fallback_runs = AtomicU32::new(0);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let result = orchestrator
            .execute(
                &call,
                || async { Err::<u8, _>(Error::llm("timeout")) },
                || {
                    fallback_runs.fetch_add(1, Ordering::SeqCst);
                    async { Ok(0) }
                },
            )
            .await;
        canceller.await.unwrap();

        assert!(result.is_cancelled());
        assert_eq!(fallback_runs.load(Ordering::SeqCst), 0);
        let err = result.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_is_reusable() {
        let orchestrator = Arc::new(orchestrator(1));
        let wrapped = orchestrator.clone().wrap(
            Call::new("search_flights", Component::Search),
            || async { Err::<u8, _>(Error::search("503")) },
            || async { Ok(1) },
        );

        let first = wrapped().await;
        let second = wrapped().await;
        assert!(first.is_fallback());
        assert!(second.is_fallback());
        assert_ne!(first.error_id(), second.error_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapped_timeout_restarts_per_invocation() {
        let orchestrator = Arc::new(orchestrator(1));
        let wrapped = orchestrator.clone().wrap(
            Call::new("complete", Component::Llm).timeout(Duration::from_secs(5)),
            || async { Ok::<_, Error>("answer") },
            || async { Ok("canned") },
        );

        assert!(wrapped().await.is_primary());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(wrapped().await.is_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_still_bounds_each_invocation() {
        let orchestrator = Arc::new(orchestrator(1));
        let wrapped = orchestrator.clone().wrap(
            Call::new("complete", Component::Llm).timeout(Duration::from_secs(5)),
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, Error>("late")
            },
            || async { Ok("canned") },
        );

        let started = Instant::now();
        assert!(wrapped().await.is_cancelled());
        assert!(wrapped().await.is_cancelled());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
    }
}
