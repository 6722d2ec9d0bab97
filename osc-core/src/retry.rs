//! Retry - Bounded retry of a single API call
//!
//! Wraps one call with a fixed-interval retry loop. Which errors are worth retrying
//! is decided by the caller's [`RetryPolicy`] over [`ErrorClass`], never here.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::provider::{ErrorClass, ProviderError, ProviderResult};

/// Which error classes to retry, for how long, and how often
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total time allowed for retries, measured from the first call
    pub budget: Duration,
    /// Fixed pause between attempts
    pub interval: Duration,
    retryable: Vec<ErrorClass>,
}

impl RetryPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    /// Retry transient errors for up to `budget`
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            interval: Self::DEFAULT_INTERVAL,
            retryable: vec![ErrorClass::Transient],
        }
    }

    /// Retry every error except validation failures for up to `budget`
    pub fn any(budget: Duration) -> Self {
        Self {
            budget,
            interval: Self::DEFAULT_INTERVAL,
            retryable: vec![
                ErrorClass::Transient,
                ErrorClass::NotFound,
                ErrorClass::Conflict,
                ErrorClass::Api,
            ],
        }
    }

    /// Single attempt, nothing retried
    pub fn none() -> Self {
        Self {
            budget: Duration::ZERO,
            interval: Self::DEFAULT_INTERVAL,
            retryable: Vec::new(),
        }
    }

    /// Also retry errors of `class`
    pub fn retrying(mut self, class: ErrorClass) -> Self {
        if !self.retryable.contains(&class) {
            self.retryable.push(class);
        }
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        self.retryable.contains(&error.class)
    }
}

/// Call `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's budget runs out
///
/// Budget exhaustion yields an [`ErrorClass::Timeout`] error whose cause is the
/// last error observed.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let deadline = Instant::now() + policy.budget;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !policy.is_retryable(&err) => return Err(err),
            Err(err) => err,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(ProviderError::timeout(format!(
                "still failing after {} attempts over {:?}: {}",
                attempts, policy.budget, err.message
            ))
            .with_cause(err));
        }

        debug!(
            "retrying after {} error (attempt {}): {}",
            err.class, attempts, err.message
        );
        tokio::time::sleep(policy.interval.min(deadline - now)).await;
    }
}
