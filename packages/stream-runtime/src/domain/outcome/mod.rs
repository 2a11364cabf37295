//! Outcome Combinators
//!
//! Expected failures travel as `Result` values in this crate; nothing panics
//! across a public boundary. `Result` already ships the sequential
//! combinators (`map`, `and_then`, `or_else`), so this module only adds the
//! concurrent operations std lacks:
//!
//! - [`wrap`]: run an async operation and convert a panic into a typed
//!   [`Fault`] instead of unwinding through the caller,
//! - [`await_all`]: run a batch concurrently and collect **all** errors
//!   rather than short-circuiting on the first, for callers that need to
//!   know which of several requests failed,
//! - [`race`]: first future to settle, paired with its source index and the
//!   still-pending remainder so the caller can keep racing a shrinking pool.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::{join_all, select_all};

// =============================================================================
// Fault
// =============================================================================

/// An unexpected failure captured at an async boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Fault {
    /// The operation panicked; the payload is the panic message when one
    /// could be extracted.
    #[error("operation panicked: {0}")]
    Panic(String),
}

// =============================================================================
// Combinators
// =============================================================================

/// Await `future`, converting a panic into [`Fault::Panic`].
///
/// Guarantee: never panics outward; every failure of the wrapped operation
/// is representable in the return value.
pub async fn wrap<F, T>(future: F) -> Result<T, Fault>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = payload.downcast_ref::<&str>().map_or_else(
                || {
                    payload
                        .downcast_ref::<String>()
                        .cloned()
                        .unwrap_or_else(|| "unknown panic payload".to_owned())
                },
                |s| (*s).to_owned(),
            );
            Err(Fault::Panic(message))
        }
    }
}

/// Run every future concurrently and wait for all of them.
///
/// Returns `Ok` with the values in input order only when every future
/// succeeded; otherwise returns `Err` with **every** error, in the input
/// order of the futures that produced them. Unlike `try_join_all` this never
/// short-circuits: slow successes still run to completion and all failures
/// are reported together.
pub async fn await_all<I, F, T, E>(futures: I) -> Result<Vec<T>, Vec<E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let settled = join_all(futures).await;

    let mut values = Vec::with_capacity(settled.len());
    let mut errors = Vec::new();
    for outcome in settled {
        match outcome {
            Ok(value) => values.push(value),
            Err(error) => errors.push(error),
        }
    }

    if errors.is_empty() {
        Ok(values)
    } else {
        Err(errors)
    }
}

/// Result of [`race`]: the first settled output, the index it came from,
/// and the futures still pending.
pub struct Raced<F: Future> {
    /// Output of the first future to settle.
    pub output: F::Output,
    /// Index of that future in the input vector.
    pub index: usize,
    /// The remaining futures, input order preserved minus the settled one.
    pub remaining: Vec<F>,
}

/// Race a pool of futures; the first to settle wins.
///
/// The winner's index lets the caller account for exactly which pool entry
/// settled, and `remaining` can be raced again without disturbing the
/// relative order of the survivors. Returns `None` for an empty pool.
pub async fn race<F>(futures: Vec<F>) -> Option<Raced<F>>
where
    F: Future + Unpin,
{
    if futures.is_empty() {
        return None;
    }

    let (output, index, remaining) = select_all(futures).await;
    Some(Raced {
        output,
        index,
        remaining,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;

    #[tokio::test]
    async fn wrap_passes_values_through() {
        let result = wrap(async { 41 + 1 }).await;
        assert_eq!(tokio_test::assert_ok!(result), 42);
    }

    #[tokio::test]
    async fn wrap_captures_panic_message() {
        let result: Result<(), Fault> = wrap(async {
            panic!("boom");
        })
        .await;

        match result {
            Err(Fault::Panic(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected panic fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_all_preserves_value_order() {
        let futs = vec![
            async { Ok::<_, String>(1) }.boxed(),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(2)
            }
            .boxed(),
            async { Ok(3) }.boxed(),
        ];

        let values = tokio_test::assert_ok!(await_all(futs).await);
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn await_all_collects_every_error() {
        let futs = vec![
            async { Err::<u32, _>("first") }.boxed(),
            async { Ok(7) }.boxed(),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err("second")
            }
            .boxed(),
        ];

        let errors = await_all(futs).await.unwrap_err();
        assert_eq!(errors, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn race_returns_first_settled_with_index() {
        let futs = vec![
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                "slow"
            }
            .boxed(),
            async { "fast" }.boxed(),
        ];

        let raced = race(futs).await.unwrap();
        assert_eq!(raced.output, "fast");
        assert_eq!(raced.index, 1);
        assert_eq!(raced.remaining.len(), 1);

        // The remainder is still a live pool.
        let rest = race(raced.remaining).await.unwrap();
        assert_eq!(rest.output, "slow");
        assert_eq!(rest.index, 0);
        assert!(rest.remaining.is_empty());
    }

    #[tokio::test]
    async fn race_on_empty_pool_is_none() {
        let futs: Vec<futures::future::BoxFuture<'static, ()>> = vec![];
        assert!(race(futs).await.is_none());
    }
}
