//! First-success combinator.
//!
//! Every task receives a child of the caller's token. That child is cancelled
//! the moment `race` returns, whether with a winner, a failure or because the
//! caller's context fired. Tasks are expected to watch it; `race` itself never
//! waits for stragglers, their futures are simply dropped.

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Run `task` for every arg concurrently and return the first `Ok`.
pub async fn race<A, R, F, Fut>(
    ctx: &CancellationToken,
    args: impl IntoIterator<Item = A>,
    task: F,
) -> Result<R>
where
    F: Fn(A, CancellationToken) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let scope = ctx.child_token();
    let _cancel_on_return = scope.clone().drop_guard();

    let mut running: FuturesUnordered<Fut> =
        args.into_iter().map(|arg| task(arg, scope.clone())).collect();
    let attempted = running.len();
    if attempted == 0 {
        return Err(Error::AllTargetsFailed { attempted: 0 });
    }

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            next = running.next() => match next {
                Some(Ok(value)) => return Ok(value),
                Some(Err(e)) => debug!("race attempt failed: {e}"),
                None => return Err(Error::AllTargetsFailed { attempted }),
            },
        }
    }
}

/// [`race`] bounded by `deadline`. Running out of time is `Error::Timeout`.
pub async fn race_within<A, R, F, Fut>(
    ctx: &CancellationToken,
    deadline: Duration,
    args: impl IntoIterator<Item = A>,
    task: F,
) -> Result<R>
where
    F: Fn(A, CancellationToken) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    match tokio::time::timeout(deadline, race(ctx, args, task)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};

    async fn attempt(
        delay_ms: u64,
        ok: bool,
        token: CancellationToken,
    ) -> Result<u64> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {
                if ok { Ok(delay_ms) } else { Err(Error::Timeout) }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_wins() {
        let ctx = CancellationToken::new();
        let plan = vec![(30, false), (10, true), (40, true)];
        let started = Instant::now();

        let got = race_within(&ctx, Duration::from_millis(50), plan, |(d, ok), t| {
            attempt(d, ok, t)
        })
        .await;

        assert_eq!(got, Ok(10));
        assert!(started.elapsed() < Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failing_returns_before_deadline() {
        let ctx = CancellationToken::new();
        let plan = vec![(5, false), (10, false), (20, false)];
        let started = Instant::now();

        let got = race_within(&ctx, Duration::from_millis(50), plan, |(d, ok), t| {
            attempt(d, ok, t)
        })
        .await;

        assert_eq!(got, Err(Error::AllTargetsFailed { attempted: 3 }));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses() {
        let ctx = CancellationToken::new();
        let got = race_within(&ctx, Duration::from_millis(50), vec![100, 200], |d, t| {
            attempt(d, true, t)
        })
        .await;
        assert_eq!(got, Err(Error::Timeout));
    }

    #[tokio::test]
    async fn losers_see_cancellation() {
        let ctx = CancellationToken::new();
        let handed_out: Arc<Mutex<Vec<CancellationToken>>> = Arc::default();

        let tokens = handed_out.clone();
        let got = race(&ctx, vec![0u64, 10_000], move |d, t| {
            tokens.lock().push(t.clone());
            attempt(d, true, t)
        })
        .await;

        assert_eq!(got, Ok(0));
        let tokens = handed_out.lock();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.iter().all(|t| t.is_cancelled()));
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn caller_cancellation_wins() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let got = race(&ctx, vec![10_000u64], |d, t| attempt(d, true, t)).await;
        assert_eq!(got, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn empty_race_fails() {
        let ctx = CancellationToken::new();
        let got = race(&ctx, Vec::<u64>::new(), |d, t| attempt(d, true, t)).await;
        assert_eq!(got, Err(Error::AllTargetsFailed { attempted: 0 }));
    }
}
