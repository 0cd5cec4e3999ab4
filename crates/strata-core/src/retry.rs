//! Retry with capped, randomized exponential backoff.
//!
//! [`retry`] runs an async operation until it succeeds, fails with an error that
//! is not [`Retryable`], or the policy's overall timeout would be exceeded by the
//! next sleep. The timeout is measured from the first attempt.
//!
//! After each failure the delay is multiplied by a random factor in
//! `[1.5, 3.0)` and capped at [`RetryPolicy::max_delay`].
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use strata_core::retry::{retry, RetryPolicy, Retryable};
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         f.write_str("flaky")
//!     }
//! }
//! impl std::error::Error for Flaky {}
//! impl Retryable for Flaky {
//!     fn is_retryable(&self) -> bool { true }
//! }
//!
//! # tokio_test_block_on(async {
//! let policy = RetryPolicy::within(Duration::from_secs(5));
//! let value = retry(&policy, "answer", || async { Ok::<_, Flaky>(42) }).await.unwrap();
//! assert_eq!(value, 42);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Classifies errors into transient (worth retrying) and fatal.
pub trait Retryable {
    /// Returns true if the failed operation may succeed when repeated.
    fn is_retryable(&self) -> bool;
}

/// Backoff and timeout configuration for [`retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Overall budget from the first attempt.
    ///
    /// `None` retries forever; `Some(Duration::ZERO)` never retries.
    pub timeout: Option<Duration>,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Default delay before the second attempt.
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(150);

    /// Default cap on a single delay.
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

    /// Retries until `timeout` has elapsed since the first attempt.
    #[must_use]
    pub const fn within(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }

    /// Retries transient failures forever.
    #[must_use]
    pub const fn forever() -> Self {
        Self {
            timeout: None,
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }

    /// Fails on the first error.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::within(Duration::ZERO)
    }

    /// Overrides the backoff delays.
    #[must_use]
    pub const fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    fn allows(&self, elapsed: Duration, next_delay: Duration) -> bool {
        self.timeout
            .is_none_or(|timeout| elapsed.saturating_add(next_delay) < timeout)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::within(Duration::from_secs(30 * 60))
    }
}

/// Failure of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with an error that retrying cannot fix.
    #[error(transparent)]
    Fatal(E),

    /// The retry budget ran out; wraps the last failure.
    #[error("{operation} timed out after {attempts} attempts: {source}")]
    TimedOut {
        /// Name of the retried operation.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// The last failure.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Returns the underlying error, discarding retry context.
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(e) | Self::TimedOut { source: e, .. } => e,
        }
    }
}

/// Runs `operation` under `policy`.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] for a non-retryable failure and
/// [`RetryError::TimedOut`] once the policy's budget is exhausted.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    name: &'static str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() => return Err(RetryError::Fatal(error)),
            Err(error) => error,
        };

        if !policy.allows(started.elapsed(), delay) {
            tracing::warn!(
                operation = name,
                attempts = attempt,
                error = %error,
                "operation failed and timed out"
            );
            return Err(RetryError::TimedOut {
                operation: name,
                attempts: attempt,
                source: error,
            });
        }

        tracing::info!(
            operation = name,
            attempt = attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
        delay = next_delay(delay, policy.max_delay);
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.5..3.0);
    current.mul_f64(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl std::error::Error for TestError {}

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Transient)
        }
    }

    fn failing_until(
        calls: &Arc<AtomicU32>,
        succeed_on: u32,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, TestError>> + use<> {
        let calls = Arc::clone(calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n >= succeed_on {
                Ok(n)
            } else {
                Err(TestError::Transient)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::within(Duration::from_secs(60));

        let value = retry(&policy, "test", failing_until(&calls, 4))
            .await
            .expect("eventually succeeds");

        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let policy = RetryPolicy::forever();

        let err = retry(&policy, "test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Fatal) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Fatal(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));

        let err = retry(&RetryPolicy::no_retry(), "test", failing_until(&calls, 2))
            .await
            .unwrap_err();

        match err {
            RetryError::TimedOut {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(source, TestError::Transient);
            }
            RetryError::Fatal(e) => panic!("unexpected fatal error: {e}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_timeout_gives_up_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::within(Duration::from_secs(10))
            .with_delays(Duration::from_secs(1), Duration::from_secs(2));

        let err = retry(&policy, "test", failing_until(&calls, u32::MAX))
            .await
            .unwrap_err();

        let attempts = calls.load(Ordering::SeqCst);
        // 1s, then at most 2s per sleep: between 5 and 10 attempts fit in 10s
        assert!((5..=10).contains(&attempts), "attempts = {attempts}");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_policy_keeps_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::forever()
            .with_delays(Duration::from_secs(60), Duration::from_secs(300));

        let value = retry(&policy, "test", failing_until(&calls, 50))
            .await
            .expect("succeeds without a deadline");
        assert_eq!(value, 50);
    }

    #[test]
    fn delay_growth_is_capped() {
        let max = Duration::from_secs(300);
        let mut delay = RetryPolicy::DEFAULT_INITIAL_DELAY;
        for _ in 0..64 {
            let next = next_delay(delay, max);
            assert!(next >= delay.min(max));
            assert!(next <= max);
            delay = next;
        }
        assert_eq!(delay, max);
    }
}
