//! Hedged Retry
//!
//! Turns a fallible async operation into a self-retrying one. Each retry
//! round races every outstanding attempt against a budget timer; when the
//! timer wins, an additional attempt is launched **in parallel** instead of
//! cancelling the slow one (hedging). A slow-but-eventually-successful
//! attempt is still allowed to win, trading extra load for latency.
//!
//! # Budget schedule
//!
//! The budget for the round following attempt `k` is
//! `delay(k) = k² * delay_square + k * delay_multiple + delay_offset`,
//! capped at `max_delay`. With defaults (`delay_square = 0`,
//! `delay_multiple = delay_offset = 100ms`) attempt 0 gets 100ms and
//! attempt 2 gets 300ms.
//!
//! # Attempt pool
//!
//! Attempts are spawned tasks tracked in an id-keyed pool; settled attempts
//! leave the pool without disturbing the entries still racing. When the
//! combinator itself settles, attempts still in flight are aborted: an
//! abandoned attempt here holds a real task and usually a socket, which is
//! not a cost worth keeping after the outcome is decided.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{AbortHandle, JoinError, JoinHandle};

// =============================================================================
// Configuration
// =============================================================================

/// Backoff and bounding knobs for [`Resilient`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Constant term of the round budget.
    pub delay_offset: Duration,
    /// Linear term, multiplied by the attempt number.
    pub delay_multiple: Duration,
    /// Quadratic term, multiplied by the attempt number squared.
    pub delay_square: Duration,
    /// Upper bound on any single round budget.
    pub max_delay: Duration,
    /// Maximum number of attempts to launch (`None` = unbounded).
    pub max_attempts: Option<u32>,
    /// When `false`, the first settled error is returned without retrying.
    pub retry_on_error: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_offset: Duration::from_millis(100),
            delay_multiple: Duration::from_millis(100),
            delay_square: Duration::ZERO,
            max_delay: Duration::from_secs(120),
            max_attempts: None,
            retry_on_error: true,
        }
    }
}

impl RetryConfig {
    /// Budget for the round that follows launching attempt `attempt`.
    #[must_use]
    pub fn round_budget(&self, attempt: u32) -> Duration {
        let k = u128::from(attempt);
        let millis = k * k * self.delay_square.as_millis()
            + k * self.delay_multiple.as_millis()
            + self.delay_offset.as_millis();
        let capped = millis.min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Whether an attempt numbered `attempt` (0-based) may still launch.
    #[must_use]
    pub fn may_launch(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Terminal outcomes of a [`Resilient`] run.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The attempt bound was reached and every outstanding attempt failed.
    #[error("retries exhausted after {attempts} attempts")]
    MaxAttempts {
        /// Number of attempts launched.
        attempts: u32,
        /// The most recent attempt error, when one was observed.
        last_error: Option<E>,
    },

    /// `retry_on_error` is off and the operation failed.
    #[error("operation failed and retry is disabled")]
    Rejected(#[source] E),
}

impl<E> RetryError<E>
where
    E: std::error::Error,
{
    /// The most recent underlying error, if any was captured.
    #[must_use]
    pub const fn last_error(&self) -> Option<&E> {
        match self {
            Self::MaxAttempts { last_error, .. } => last_error.as_ref(),
            Self::Rejected(error) => Some(error),
        }
    }
}

// =============================================================================
// Hooks
// =============================================================================

type AcceptFn<T, E> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type ErrorObserver<E> = Arc<dyn Fn(&E, u32) + Send + Sync>;

// =============================================================================
// Attempt pool
// =============================================================================

/// Aborts every registered attempt when dropped.
///
/// Abort after completion is a no-op, so settled attempts need no cleanup.
#[derive(Default)]
struct AbortOnSettle {
    handles: Vec<AbortHandle>,
}

impl Drop for AbortOnSettle {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

enum RoundStep<T, E> {
    BudgetElapsed,
    Settled(Option<Result<Result<T, E>, JoinError>>),
}

// =============================================================================
// Resilient
// =============================================================================

/// Hedged retry combinator.
///
/// # Example
///
/// ```rust,no_run
/// use stream_runtime::application::retry::{Resilient, RetryConfig};
///
/// # async fn example() {
/// let outcome: Result<u32, _> = Resilient::new(RetryConfig::default())
///     .run(|attempt| async move {
///         if attempt < 2 {
///             Err("still warming up")
///         } else {
///             Ok(attempt)
///         }
///     })
///     .await;
/// # let _ = outcome;
/// # }
/// ```
pub struct Resilient<T, E> {
    config: RetryConfig,
    accept: Option<AcceptFn<T, E>>,
    on_error: Option<ErrorObserver<E>>,
}

impl<T, E> Resilient<T, E>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    /// Create a combinator with the given configuration and no hooks.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        Self {
            config,
            accept: None,
            on_error: None,
        }
    }

    /// Install a domain-level acceptance check.
    ///
    /// Run against each transport-successful value before it may win; an
    /// `Err` demotes the attempt to a failure (dropped from the pool, racing
    /// continues), an `Ok` (possibly carrying an enriched value) ends the
    /// run successfully.
    #[must_use]
    pub fn with_acceptance<A, Fut>(mut self, accept: A) -> Self
    where
        A: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.accept = Some(Arc::new(move |value| Box::pin(accept(value))));
        self
    }

    /// Observe every attempt error as it settles, with its attempt number.
    #[must_use]
    pub fn with_error_observer(mut self, observer: impl Fn(&E, u32) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(observer));
        self
    }

    /// Run `operation` until an attempt wins or the attempt bound is hit.
    ///
    /// `operation` is invoked with the 0-based attempt number each time a
    /// new attempt launches. Attempts run as spawned tasks; a panicking
    /// attempt counts as a failed one.
    pub async fn run<F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut pool: FuturesUnordered<JoinHandle<Result<T, E>>> = FuturesUnordered::new();
        let mut aborts = AbortOnSettle::default();
        let mut launched: u32 = 0;
        let mut last_error: Option<E> = None;

        let handle = tokio::spawn(operation(launched));
        aborts.handles.push(handle.abort_handle());
        pool.push(handle);
        launched += 1;

        'rounds: loop {
            // Budget of the round opened by the most recently launched attempt.
            let budget = self.config.round_budget(launched - 1);
            let round = tokio::time::sleep(budget);
            tokio::pin!(round);
            let mut hedging_open = true;

            loop {
                if pool.is_empty() {
                    // Everything settled with errors: fresh attempt, fresh round.
                    if self.config.may_launch(launched) {
                        let handle = tokio::spawn(operation(launched));
                        aborts.handles.push(handle.abort_handle());
                        pool.push(handle);
                        launched += 1;
                        continue 'rounds;
                    }
                    return Err(RetryError::MaxAttempts {
                        attempts: launched,
                        last_error,
                    });
                }

                let step = tokio::select! {
                    () = &mut round, if hedging_open => RoundStep::BudgetElapsed,
                    settled = pool.next() => RoundStep::Settled(settled),
                };

                match step {
                    RoundStep::BudgetElapsed => {
                        // Budget elapsed: hedge with one more attempt without
                        // cancelling the ones already racing.
                        if self.config.may_launch(launched) {
                            tracing::debug!(
                                attempt = launched,
                                budget_ms = budget.as_millis(),
                                "retry round budget elapsed, hedging"
                            );
                            let handle = tokio::spawn(operation(launched));
                            aborts.handles.push(handle.abort_handle());
                            pool.push(handle);
                            launched += 1;
                            continue 'rounds;
                        }
                        // Bound reached: ride out the attempts still in flight.
                        hedging_open = false;
                    }
                    RoundStep::Settled(Some(Ok(Ok(value)))) => {
                        match self.check_acceptance(value).await {
                            Ok(value) => return Ok(value),
                            Err(error) => {
                                if !self.config.retry_on_error {
                                    return Err(RetryError::Rejected(error));
                                }
                                self.observe(&error, launched);
                                last_error = Some(error);
                            }
                        }
                    }
                    RoundStep::Settled(Some(Ok(Err(error)))) => {
                        if !self.config.retry_on_error {
                            return Err(RetryError::Rejected(error));
                        }
                        self.observe(&error, launched);
                        last_error = Some(error);
                    }
                    RoundStep::Settled(Some(Err(join_error))) => {
                        // A panicked attempt is just a failed attempt.
                        tracing::warn!(error = %join_error, "retry attempt panicked");
                    }
                    RoundStep::Settled(None) => {}
                }
            }
        }
    }

    async fn check_acceptance(&self, value: T) -> Result<T, E> {
        match &self.accept {
            Some(accept) => accept(value).await,
            None => Ok(value),
        }
    }

    fn observe(&self, error: &E, attempt: u32) {
        tracing::debug!(attempt, error = %error, "retry attempt failed");
        if let Some(observer) = &self.on_error {
            observer(error, attempt);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use test_case::test_case;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("attempt failed: {0}")]
    struct AttemptError(String);

    #[test_case(0, 100 ; "attempt 0 gets the offset")]
    #[test_case(1, 200 ; "attempt 1 adds one multiple")]
    #[test_case(2, 300 ; "attempt 2 adds two multiples")]
    #[test_case(5, 600 ; "linear growth continues")]
    fn default_budget_schedule(attempt: u32, expected_ms: u64) {
        let config = RetryConfig::default();
        assert_eq!(
            config.round_budget(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn quadratic_term_contributes() {
        let config = RetryConfig {
            delay_square: Duration::from_millis(10),
            ..RetryConfig::default()
        };
        // 3²·10 + 3·100 + 100 = 490ms
        assert_eq!(config.round_budget(3), Duration::from_millis(490));
    }

    #[test]
    fn budget_is_capped_at_max_delay() {
        let config = RetryConfig {
            max_delay: Duration::from_millis(250),
            ..RetryConfig::default()
        };
        assert_eq!(config.round_budget(50), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn immediate_success_wins_first_round() {
        let result: Result<u32, RetryError<AttemptError>> =
            Resilient::new(RetryConfig::default())
                .run(|_| async { Ok(99) })
                .await;

        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn retries_until_an_attempt_succeeds() {
        let config = RetryConfig {
            delay_offset: Duration::from_millis(10),
            delay_multiple: Duration::from_millis(10),
            ..RetryConfig::default()
        };

        let result: Result<u32, RetryError<AttemptError>> = Resilient::new(config)
            .run(|attempt| async move {
                if attempt < 3 {
                    Err(AttemptError(format!("attempt {attempt}")))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn slow_first_attempt_still_wins_over_hedges() {
        // Attempt 0 is slow but succeeds; hedged attempts never resolve.
        // The hedge must not cancel attempt 0.
        let config = RetryConfig {
            delay_offset: Duration::from_millis(20),
            delay_multiple: Duration::from_millis(20),
            ..RetryConfig::default()
        };

        let result: Result<&str, RetryError<AttemptError>> = Resilient::new(config)
            .run(|attempt| async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_millis(120)).await;
                    Ok("slow but steady")
                } else {
                    futures::future::pending::<Result<&str, AttemptError>>().await
                }
            })
            .await;

        assert_eq!(result.unwrap(), "slow but steady");
    }

    #[tokio::test]
    async fn first_ok_wins_while_others_pend() {
        let config = RetryConfig {
            delay_offset: Duration::from_millis(10),
            delay_multiple: Duration::from_millis(10),
            ..RetryConfig::default()
        };

        let result: Result<u32, RetryError<AttemptError>> = Resilient::new(config)
            .run(|attempt| async move {
                if attempt == 2 {
                    Ok(attempt)
                } else {
                    futures::future::pending::<Result<u32, AttemptError>>().await
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn max_attempts_is_honored() {
        let config = RetryConfig {
            delay_offset: Duration::from_millis(5),
            delay_multiple: Duration::from_millis(5),
            max_attempts: Some(3),
            ..RetryConfig::default()
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);

        let result: Result<u32, RetryError<AttemptError>> = Resilient::new(config)
            .run(move |attempt| {
                seen.fetch_add(1, Ordering::SeqCst);
                async move { Err(AttemptError(format!("attempt {attempt}"))) }
            })
            .await;

        match result {
            Err(RetryError::MaxAttempts {
                attempts: launched,
                last_error,
            }) => {
                assert_eq!(launched, 3);
                assert!(last_error.is_some());
            }
            other => panic!("expected MaxAttempts, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_disabled_returns_first_error() {
        let config = RetryConfig {
            retry_on_error: false,
            ..RetryConfig::default()
        };

        let result: Result<u32, RetryError<AttemptError>> = Resilient::new(config)
            .run(|_| async { Err(AttemptError("no second chances".to_owned())) })
            .await;

        assert!(matches!(result, Err(RetryError::Rejected(_))));
    }

    #[tokio::test]
    async fn acceptance_check_demotes_ok_to_retry() {
        let config = RetryConfig {
            delay_offset: Duration::from_millis(5),
            delay_multiple: Duration::from_millis(5),
            ..RetryConfig::default()
        };

        let result: Result<u32, RetryError<AttemptError>> = Resilient::new(config)
            .with_acceptance(|value| async move {
                if value < 2 {
                    Err(AttemptError(format!("value {value} rejected")))
                } else {
                    Ok(value * 10)
                }
            })
            .run(|attempt| async move { Ok(attempt) })
            .await;

        // Attempts 0 and 1 are transport-successful but domain-rejected;
        // attempt 2 passes and the acceptance payload is kept.
        assert_eq!(result.unwrap(), 20);
    }

    #[tokio::test]
    async fn error_observer_sees_every_failure() {
        let config = RetryConfig {
            delay_offset: Duration::from_millis(5),
            delay_multiple: Duration::from_millis(5),
            ..RetryConfig::default()
        };

        let observed = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&observed);

        let result: Result<u32, RetryError<AttemptError>> = Resilient::new(config)
            .with_error_observer(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(AttemptError("not yet".to_owned()))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicked_attempt_counts_as_failure() {
        let config = RetryConfig {
            delay_offset: Duration::from_millis(5),
            delay_multiple: Duration::from_millis(5),
            ..RetryConfig::default()
        };

        let result: Result<u32, RetryError<AttemptError>> = Resilient::new(config)
            .run(|attempt| async move {
                assert!(attempt != 0, "attempt 0 panics");
                Ok(attempt)
            })
            .await;

        assert!(result.is_ok());
    }
}
