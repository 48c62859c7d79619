use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Time between the first predicate evaluation and the successful one.
    pub elapsed: Duration,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum PollError<E> {
    /// The predicate did not return `true` before the timeout has elapsed.
    Timeout { elapsed: Duration, attempts: u32 },
    /// The predicate could not be evaluated. This is never retried.
    Predicate(E),
}

/// Repeatedly evaluates `predicate` until it returns `true`.
///
/// The first evaluation happens immediately, the following ones are spaced by `interval`
/// (measured from the start of the previous evaluation). If `timeout` elapses before the
/// predicate returns `true`, [`PollError::Timeout`] is returned; an evaluation that is still
/// running at the deadline is dropped.
///
/// All waiting goes through [`tokio::time`], so the function follows a paused test clock.
pub async fn poll_until<F, Fut, E>(
    mut predicate: F,
    interval: Duration,
    timeout: Duration,
) -> Result<PollOutcome, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0;

    loop {
        let attempt_start = Instant::now();
        attempts += 1;

        match tokio::time::timeout_at(deadline, predicate()).await {
            Ok(Ok(true)) => {
                return Ok(PollOutcome {
                    elapsed: start.elapsed(),
                    attempts,
                });
            }
            Ok(Ok(false)) => {}
            Ok(Err(error)) => return Err(PollError::Predicate(error)),
            Err(_) => {
                return Err(PollError::Timeout {
                    elapsed: start.elapsed(),
                    attempts,
                });
            }
        }

        if Instant::now() >= deadline {
            return Err(PollError::Timeout {
                elapsed: start.elapsed(),
                attempts,
            });
        }
        log::debug!("Condition not met after attempt {attempts}, retrying");
        tokio::time::sleep_until((attempt_start + interval).min(deadline)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{PollError, poll_until};

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_call() {
        let calls = Cell::new(0);
        let start = Instant::now();
        let outcome = poll_until(
            || {
                calls.set(calls.get() + 1);
                let ready = calls.get() == 3;
                async move { Ok::<_, ()>(ready) }
            },
            SECOND,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let elapsed = start.elapsed();
        assert_eq!(outcome.attempts, 3);
        assert!(elapsed >= 2 * SECOND);
        assert!(elapsed < 4 * SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_happens_immediately() {
        let start = Instant::now();
        let outcome = poll_until(|| async { Ok::<_, ()>(true) }, SECOND, 5 * SECOND)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_timeout() {
        let start = Instant::now();
        let result = poll_until(|| async { Ok::<_, ()>(false) }, SECOND, 5 * SECOND).await;

        let elapsed = start.elapsed();
        match result {
            Err(PollError::Timeout { attempts, .. }) => assert_eq!(attempts, 6),
            other => panic!("Unexpected result {other:?}"),
        }
        assert!(elapsed >= 5 * SECOND);
        assert!(elapsed < 6 * SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_error_is_not_retried() {
        let calls = Cell::new(0);
        let start = Instant::now();
        let result = poll_until(
            || {
                calls.set(calls.get() + 1);
                async { Err::<bool, _>("cannot list nodes") }
            },
            SECOND,
            5 * SECOND,
        )
        .await;

        assert!(matches!(result, Err(PollError::Predicate("cannot list nodes"))));
        assert_eq!(calls.get(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_predicate_is_cut_by_timeout() {
        let start = Instant::now();
        let result = poll_until(
            || futures::future::pending::<Result<bool, ()>>(),
            SECOND,
            3 * SECOND,
        )
        .await;

        assert!(matches!(
            result,
            Err(PollError::Timeout { attempts: 1, .. })
        ));
        assert_eq!(start.elapsed(), 3 * SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_longer_than_timeout() {
        let start = Instant::now();
        let result = poll_until(|| async { Ok::<_, ()>(false) }, 10 * SECOND, 3 * SECOND).await;

        assert!(matches!(
            result,
            Err(PollError::Timeout { attempts: 2, .. })
        ));
        assert_eq!(start.elapsed(), 3 * SECOND);
    }
}
