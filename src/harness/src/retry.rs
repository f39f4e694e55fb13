//! Sequential retry loop with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};

/// Outcome of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum ProbeResult<T, E> {
    Success(T),
    /// Transient failure; the loop may try again.
    Retryable(E),
    /// Retrying cannot help; the loop stops immediately.
    Fatal(E),
}

impl<T, E> ProbeResult<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProbeResult<U, E> {
        match self {
            ProbeResult::Success(value) => ProbeResult::Success(f(value)),
            ProbeResult::Retryable(e) => ProbeResult::Retryable(e),
            ProbeResult::Fatal(e) => ProbeResult::Fatal(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("either max_attempts or max_elapsed must be set")]
    Unbounded,
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("multiplier must be a finite number >= 1.0, got {0}")]
    Multiplier(f64),
    #[error("jitter must be within 0.0..=1.0, got {0}")]
    Jitter(f64),
}

/// Budget and pacing of a retry loop. Immutable once the loop starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of probe invocations, including the first.
    pub max_attempts: Option<u32>,
    /// Maximum time spent in the loop, sleeps included.
    #[serde(with = "humantime_serde")]
    pub max_elapsed: Option<Duration>,
    /// Delay after the first failed attempt.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay, before jitter.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Fraction by which a delay is randomly stretched or shrunk.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_elapsed: Some(Duration::from_secs(180)),
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay, bounded by attempt count only.
    pub fn attempts(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            max_elapsed: None,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    pub fn with_backoff(mut self, initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts.is_none() && self.max_elapsed.is_none() {
            return Err(PolicyError::Unbounded);
        }
        if self.max_attempts == Some(0) {
            return Err(PolicyError::ZeroAttempts);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PolicyError::Multiplier(self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(PolicyError::Jitter(self.jitter));
        }
        Ok(())
    }

    /// Un-jittered delay after the failed attempt with the given 0-based index.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let max_secs = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(max_secs).max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + (fastrand::f64() * 2.0 - 1.0) * self.jitter;
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts in {elapsed:?}: {last_error}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: E,
    },
    #[error("attempt {attempts} failed permanently: {error}")]
    Fatal { attempts: u32, error: E },
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(#[from] PolicyError),
}

impl<E> RetryError<E> {
    /// Number of probe invocations made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Fatal { attempts, .. } => *attempts,
            RetryError::InvalidPolicy(_) => 0,
        }
    }

    /// The error returned by the last probe invocation, if any.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::InvalidPolicy(_) => None,
        }
    }
}

/// Runs `probe` until it succeeds, fails fatally or the budget runs out.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, probe: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProbeResult<T, E>>,
    E: fmt::Display,
{
    retry_notify(policy, probe, |err: &E, delay| {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "retrying after: {err}");
    })
    .await
}

/// Like [`retry`], calling `notify` with the error and the upcoming delay
/// right before every sleep.
///
/// The probe receives the 1-based attempt number. Attempts never overlap, and
/// the loop never sleeps after its final attempt.
pub async fn retry_notify<T, E, F, Fut, N>(
    policy: &RetryPolicy,
    mut probe: F,
    mut notify: N,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProbeResult<T, E>>,
    N: FnMut(&E, Duration),
{
    policy.validate()?;

    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let error = match probe(attempt).await {
            ProbeResult::Success(value) => return Ok(value),
            ProbeResult::Fatal(error) => {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error,
                });
            }
            ProbeResult::Retryable(error) => error,
        };

        let elapsed = started.elapsed();
        let attempts_spent = policy.max_attempts.is_some_and(|max| attempt >= max);
        let time_spent = policy.max_elapsed.is_some_and(|max| elapsed >= max);
        if attempts_spent || time_spent {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                elapsed,
                last_error: error,
            });
        }

        let mut delay = policy.jittered(policy.backoff_delay(attempt - 1));
        if let Some(max) = policy.max_elapsed {
            delay = delay.min(max.saturating_sub(elapsed));
        }

        notify(&error, delay);
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::attempts(max_attempts, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_nth_attempt_after_n_minus_one_sleeps() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut sleeps = Vec::new();
        let started = Instant::now();

        let counter = calls.clone();
        let result = retry_notify(
            &fast_policy(5),
            move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 4 {
                        ProbeResult::Retryable(TestError("not yet"))
                    } else {
                        ProbeResult::Success(attempt)
                    }
                }
            },
            |_: &TestError, delay| sleeps.push(delay),
        )
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeps, vec![Duration::from_millis(100); 3]);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_retryable_exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut sleeps = 0;

        let counter = calls.clone();
        let result: Result<(), _> = retry_notify(
            &fast_policy(3),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ProbeResult::Retryable(TestError("refused"))
                }
            },
            |_: &TestError, _| sleeps += 1,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeps, 2);
        match result {
            Err(RetryError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, TestError("refused"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_after_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut sleeps = 0;

        let counter = calls.clone();
        let result: Result<(), _> = retry_notify(
            &fast_policy(10),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ProbeResult::Fatal(TestError("bad credentials"))
                }
            },
            |_: &TestError, _| sleeps += 1,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleeps, 0);
        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.last_error(), Some(&TestError("bad credentials")));
        assert!(err.to_string().contains("bad credentials"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget_bounds_the_loop() {
        let policy = RetryPolicy {
            max_attempts: None,
            max_elapsed: Some(Duration::from_secs(1)),
            initial_delay: Duration::from_millis(300),
            multiplier: 1.0,
            max_delay: Duration::from_millis(300),
            jitter: 0.0,
        };
        let started = Instant::now();
        let mut calls = 0;

        let result: Result<(), _> = retry(&policy, |_| {
            calls += 1;
            async { ProbeResult::Retryable(TestError("starting")) }
        })
        .await;

        // Attempts at 0, 300, 600, 900 and a final one at the 1s deadline.
        assert_eq!(calls, 5);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 5, .. })));
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_never_sleeps() {
        let mut sleeps = 0;
        let result = retry_notify(
            &fast_policy(3),
            |_| async { ProbeResult::<_, TestError>::Success("up") },
            |_, _| sleeps += 1,
        )
        .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(sleeps, 0);
    }

    #[tokio::test]
    async fn test_invalid_policy_never_invokes_probe() {
        let policy = RetryPolicy {
            max_attempts: None,
            max_elapsed: None,
            ..RetryPolicy::default()
        };
        let mut calls = 0;

        let result: Result<(), RetryError<TestError>> = retry(&policy, |_| {
            calls += 1;
            async { ProbeResult::Success(()) }
        })
        .await;

        assert_eq!(calls, 0);
        assert!(matches!(
            result,
            Err(RetryError::InvalidPolicy(PolicyError::Unbounded))
        ));
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default().with_backoff(
            Duration::from_secs(1),
            1.6,
            Duration::from_secs(20),
        );

        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1600));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2560));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(20));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(20));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default().with_jitter(0.2);
        let base = Duration::from_secs(10);

        for _ in 0..1000 {
            let delay = policy.jittered(base);
            assert!(delay >= Duration::from_secs(8), "{delay:?} below bound");
            assert!(delay <= Duration::from_secs(12), "{delay:?} above bound");
        }
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        assert_eq!(
            RetryPolicy::attempts(0, Duration::ZERO).validate(),
            Err(PolicyError::ZeroAttempts)
        );
        assert_eq!(
            RetryPolicy::default().with_jitter(1.5).validate(),
            Err(PolicyError::Jitter(1.5))
        );
        assert!(matches!(
            RetryPolicy::default()
                .with_backoff(Duration::from_secs(1), 0.5, Duration::from_secs(1))
                .validate(),
            Err(PolicyError::Multiplier(_))
        ));
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_probe_result_map() {
        let ok: ProbeResult<u32, TestError> = ProbeResult::Success(2);
        assert_eq!(ok.map(|v| v * 2), ProbeResult::Success(4));

        let retry: ProbeResult<u32, TestError> = ProbeResult::Retryable(TestError("x"));
        assert!(!retry.clone().is_success());
        assert_eq!(retry.map(|v| v + 1), ProbeResult::Retryable(TestError("x")));
    }
}
