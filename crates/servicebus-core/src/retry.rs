//! Bounded, constant-delay retry around fallible asynchronous operations.
//!
//! Attempt 1 is the first try. An error whose [`ErrorKind`] is not declared
//! retryable propagates immediately. Operations with non-idempotent side
//! effects must only be retried when the caller guarantees idempotence; the
//! executor does not enforce this.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use thiserror::Error;
use tracing::warn;

use crate::error::{ConfigurationError, DomainError, ErrorKind};

/// Retry configuration: total attempts, constant delay, retryable kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    retryable: Vec<ErrorKind>,
}

impl RetryPolicy {
    /// Creates a policy with no retryable kinds declared yet.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidRetryPolicy` if `max_attempts` is 0.
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, ConfigurationError> {
        if max_attempts == 0 {
            return Err(ConfigurationError::InvalidRetryPolicy(
                "max_attempts must be a positive integer".to_owned(),
            ));
        }
        Ok(Self {
            max_attempts,
            delay,
            retryable: Vec::new(),
        })
    }

    /// A policy that never retries.
    #[must_use]
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            retryable: Vec::new(),
        }
    }

    /// Declares `kind` as retryable.
    #[must_use]
    pub fn retry_on(mut self, kind: ErrorKind) -> Self {
        if !self.retryable.contains(&kind) {
            self.retryable.push(kind);
        }
        self
    }

    /// Total attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Kinds eligible for another attempt.
    #[must_use]
    pub fn retryable(&self) -> &[ErrorKind] {
        &self.retryable
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// A successful result and the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// The operation's result.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// The last error of an operation, annotated with the attempts made.
#[derive(Debug, Error)]
#[error("failed after {attempts} attempt(s): {source}")]
pub struct RetryError {
    /// Attempts made before giving up.
    pub attempts: u32,
    /// The last error.
    #[source]
    pub source: DomainError,
}

impl RetryError {
    /// Drops the attempt count, keeping the last error.
    #[must_use]
    pub fn into_inner(self) -> DomainError {
        self.source
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The executor's policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` using the retryable kinds declared on the policy.
    ///
    /// # Errors
    ///
    /// See [`RetryExecutor::execute`].
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, DomainError>> + Send,
        T: Send,
    {
        self.execute(self.policy.retryable(), operation).await
    }

    /// Runs `operation`, retrying failures whose kind is in `retryable`.
    ///
    /// The operation receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error with the attempt count once attempts are
    /// exhausted, or the first non-retryable error.
    pub async fn execute<T, F, Fut>(
        &self,
        retryable: &[ErrorKind],
        mut operation: F,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, DomainError>> + Send,
        T: Send,
    {
        let attempts = AtomicU32::new(0);
        let retries = usize::try_from(self.policy.max_attempts.saturating_sub(1))
            .unwrap_or(usize::MAX);
        let backoff = ConstantBuilder::default()
            .with_delay(self.policy.delay)
            .with_max_times(retries);

        let result = (|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            operation(attempt)
        })
        .retry(backoff)
        .when(|err: &DomainError| retryable.contains(&err.kind()))
        .notify(|err: &DomainError, delay: Duration| {
            warn!(
                attempt = attempts.load(Ordering::SeqCst),
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis(),
                error = %err,
                "Retryable failure, retrying"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(value) => Ok(Attempted { value, attempts }),
            Err(source) => Err(RetryError { attempts, source }),
        }
    }
}
