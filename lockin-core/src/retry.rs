//! Resilient call executor — classification-aware retry for outbound calls
//!
//! The executor knows nothing about what a call does. Each attempt's failure is
//! classified into a [`FailureKind`]; the kind picks the backoff:
//! - **Timeout** / **OtherApiError** — fixed `base_delay` on every retry
//! - **RateLimit** — `base_delay * 2^n`, where `n` is the retry number (first retry = 1)
//! - **NonRetryable** — propagated immediately, no delay
//!
//! At most `max_retries` retries follow the initial attempt. Attempts are
//! strictly sequential and every backoff is an async sleep. With a
//! `call_timeout` set, an attempt that outlives it counts as a **Timeout**.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_retry::strategy::FixedInterval;

use crate::config::RetryConfig;

// ============================================================================
// Classification
// ============================================================================

/// Failure taxonomy used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The call exceeded its per-call deadline.
    Timeout,
    /// The remote endpoint signalled throttling.
    RateLimit,
    /// Any other remote error carrying a recognised error envelope.
    OtherApiError,
    /// Everything else; never retried.
    NonRetryable,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        self.backoff_kind().is_some()
    }

    /// How retries after this kind of failure are spaced. `None` for non-retryable.
    pub fn backoff_kind(self) -> Option<BackoffKind> {
        match self {
            FailureKind::Timeout | FailureKind::OtherApiError => Some(BackoffKind::Fixed),
            FailureKind::RateLimit => Some(BackoffKind::Exponential),
            FailureKind::NonRetryable => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::OtherApiError => "api_error",
            FailureKind::NonRetryable => "non_retryable",
        }
    }
}

/// An attempt ran past the executor's per-call deadline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("call exceeded its {}ms deadline", .limit.as_millis())]
pub struct CallTimedOut {
    pub limit: Duration,
}

/// Errors the executor can retry must be able to say what kind of failure they are.
pub trait Classify {
    fn classify(&self) -> FailureKind;
}

/// Pure classification entry point.
pub fn classify<E: Classify>(error: &E) -> FailureKind {
    error.classify()
}

/// Tagged result of a single attempt.
#[derive(Debug)]
pub enum CallOutcome<T, E> {
    Success(T),
    TransientFailure { kind: FailureKind, error: E },
    FatalFailure(E),
}

impl<T, E: Classify> CallOutcome<T, E> {
    pub fn from_result(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => CallOutcome::Success(value),
            Err(error) => {
                let kind = classify(&error);
                if kind.is_retryable() {
                    CallOutcome::TransientFailure { kind, error }
                } else {
                    CallOutcome::FatalFailure(error)
                }
            }
        }
    }
}

// ============================================================================
// Policy + backoff table
// ============================================================================

/// Delay shape between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// `base_delay` before every retry.
    Fixed,
    /// `base_delay * 2^n` before retry `n`.
    Exponential,
}

impl BackoffKind {
    /// Delay before retry number `retry` (1-based). Saturates at `Duration::MAX`.
    pub fn delay(self, retry: u32, base_delay: Duration) -> Duration {
        match self {
            BackoffKind::Fixed => FixedInterval::new(base_delay)
                .next()
                .unwrap_or(base_delay),
            BackoffKind::Exponential => 2u32
                .checked_pow(retry)
                .and_then(|factor| base_delay.checked_mul(factor))
                .unwrap_or(Duration::MAX),
        }
    }
}

/// Immutable retry policy, built once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Deadline for a single attempt; `None` leaves it to the call itself.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            call_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    /// Total attempts allowed, initial attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (1-based) after a failure of `kind`.
    pub fn delay_for(&self, kind: FailureKind, retry: u32) -> Option<Duration> {
        backoff_delay(kind, retry, self.base_delay)
    }
}

/// Backoff table, independent of the executor. `None` means "do not retry".
pub fn backoff_delay(kind: FailureKind, retry: u32, base_delay: Duration) -> Option<Duration> {
    kind.backoff_kind()
        .map(|backoff| backoff.delay(retry, base_delay))
}

// ============================================================================
// Executor state machine
// ============================================================================

enum State<T, E> {
    Attempting { attempt: u32 },
    BackingOff { next_attempt: u32, delay: Duration },
    Succeeded(T),
    /// Terminal failure: retry budget spent, or the failure was non-retryable.
    Exhausted(E),
}

/// Everything one executor run did, for callers that want more than the result.
#[derive(Debug)]
pub struct Execution<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

/// Runs a zero-argument async call under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResilientExecutor {
    policy: RetryPolicy,
}

impl ResilientExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` to success or terminal failure and return its result.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, call: F) -> Result<T, E>
    where
        E: Classify + Display + From<CallTimedOut>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, call).await.result
    }

    /// Like [`execute`](Self::execute) but also reports attempts and backoffs.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Execution<T, E>
    where
        E: Classify + Display + From<CallTimedOut>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0;
        let mut delays = Vec::new();
        let mut state = State::Attempting { attempt: 1 };

        loop {
            state = match state {
                State::Attempting { attempt } => {
                    attempts = attempt;
                    let result = match self.policy.call_timeout {
                        Some(limit) => match tokio::time::timeout(limit, call()).await {
                            Ok(result) => result,
                            Err(_) => Err(E::from(CallTimedOut { limit })),
                        },
                        None => call().await,
                    };
                    match CallOutcome::from_result(result) {
                        CallOutcome::Success(value) => {
                            if attempt > 1 {
                                tracing::info!(operation, attempt, "Call succeeded after retry");
                            }
                            State::Succeeded(value)
                        }
                        CallOutcome::TransientFailure { kind, error } => {
                            tracing::warn!(
                                operation,
                                attempt,
                                max_attempts,
                                kind = kind.as_str(),
                                error = %error,
                                "Transient call failure"
                            );
                            match self.policy.delay_for(kind, attempt) {
                                Some(delay) if attempt < max_attempts => {
                                    tracing::info!(
                                        operation,
                                        attempt,
                                        kind = kind.as_str(),
                                        delay_ms = delay.as_millis() as u64,
                                        "Retrying after backoff"
                                    );
                                    State::BackingOff {
                                        next_attempt: attempt + 1,
                                        delay,
                                    }
                                }
                                _ => {
                                    tracing::error!(
                                        operation,
                                        attempts = attempt,
                                        kind = kind.as_str(),
                                        error = %error,
                                        "Retry budget exhausted"
                                    );
                                    State::Exhausted(error)
                                }
                            }
                        }
                        CallOutcome::FatalFailure(error) => {
                            tracing::error!(
                                operation,
                                attempt,
                                error = %error,
                                "Non-retryable call failure"
                            );
                            State::Exhausted(error)
                        }
                    }
                }
                State::BackingOff {
                    next_attempt,
                    delay,
                } => {
                    tokio::time::sleep(delay).await;
                    delays.push(delay);
                    State::Attempting {
                        attempt: next_attempt,
                    }
                }
                State::Succeeded(value) => {
                    return Execution {
                        result: Ok(value),
                        attempts,
                        delays,
                    }
                }
                State::Exhausted(error) => {
                    return Execution {
                        result: Err(error),
                        attempts,
                        delays,
                    }
                }
            };
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
