//! Bounded exponential retry for operations whose failure may be transient.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Exponential backoff: `steps` attempts in total, sleeping `initial * factor^n`
/// between them (clamped to `cap`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub steps: u32,
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    /// Same shape as client-go's `DefaultBackoff`: 10ms, 50ms, 250ms.
    fn default() -> Self {
        Self { steps: 4, initial: Duration::from_millis(10), factor: 5, cap: Duration::from_secs(10) }
    }
}

impl Backoff {
    /// Delay before attempt `n + 1`, for `n` starting at 0.
    pub fn delay(&self, n: u32) -> Duration {
        let mult = self.factor.max(1).saturating_pow(n);
        self.initial.saturating_mul(mult).min(self.cap)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// A non-retriable error; returned as soon as it happens.
    #[error("{0}")]
    Failed(E),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Failed(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails with an error `is_retriable` rejects, or the
/// backoff budget is spent.
pub async fn retry_on<T, E, R, F, Fut>(backoff: &Backoff, is_retriable: R, mut op: F) -> Result<T, RetryError<E>>
where
    R: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !is_retriable(&e) => return Err(RetryError::Failed(e)),
            Err(e) if attempt >= steps => return Err(RetryError::Exhausted { attempts: attempt, last: e }),
            Err(_) => {
                let wait = backoff.delay(attempt - 1);
                debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(steps: u32) -> Backoff {
        Backoff { steps, initial: Duration::from_millis(1), factor: 2, cap: Duration::from_millis(4) }
    }

    #[test]
    fn delays_grow_then_cap() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_millis(10));
        assert_eq!(b.delay(1), Duration::from_millis(50));
        assert_eq!(b.delay(2), Duration::from_millis(250));
        assert_eq!(quick(8).delay(6), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<u32, RetryError<&str>> = retry_on(&quick(4), |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err("busy") } else { Ok(n) }
        })
        .await;
        assert_eq!(out.unwrap(), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retriable() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), RetryError<&str>> = retry_on(&quick(4), |e| *e == "busy", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("broken")
        })
        .await;
        assert!(matches!(out, Err(RetryError::Failed("broken"))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_steps() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), RetryError<&str>> = retry_on(&quick(3), |_| true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("busy")
        })
        .await;
        match out {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
