pub mod backoff;

use crate::cancel::{or_cancelled, Cancelled};
use backoff::WaitStrategy;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hook invoked with the error and the 1-based attempt index before each
/// retry. Not invoked for the final, propagated error.
pub type OnError<'a, E> = Box<dyn FnMut(&E, u32) + Send + 'a>;

/// Options for [`retry`].
pub struct RetryOptions<'a, E> {
    /// Number of re-invocations allowed after a failure. `None` is unbounded;
    /// `Some(k)` invokes the operation at most `k + 1` times.
    pub max_retries: Option<u32>,
    /// Overall deadline. Once elapsed, the next failure is propagated instead
    /// of retried.
    pub timeout: Option<Duration>,
    pub wait: WaitStrategy,
    pub on_error: Option<OnError<'a, E>>,
    /// Name used in log lines.
    pub task_name: &'static str,
    /// Aborts the loop (including mid-operation and mid-sleep) when fired.
    pub cancel: Option<CancellationToken>,
}

impl<E> Default for RetryOptions<'_, E> {
    fn default() -> Self {
        Self {
            max_retries: None,
            timeout: None,
            wait: WaitStrategy::default(),
            on_error: None,
            task_name: "retry",
            cancel: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("{task} gave up after {attempts} attempts: {source}")]
    Exhausted {
        task: &'static str,
        attempts: u32,
        source: E,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled(_))
    }
}

/// Re-invokes `operation` until it succeeds, the retry budget is spent, or the
/// cancellation token fires.
///
/// On each failure the on-error hook runs first, then the loop sleeps for the
/// strategy's wait before trying again. Cancellation is honoured at every
/// suspension point and resolves with the [`Cancelled`] sentinel.
pub async fn retry<T, E, F, Fut>(
    mut operation: F,
    mut options: RetryOptions<'_, E>,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled(Cancelled));
            }
        }

        let outcome = match &options.cancel {
            Some(token) => match or_cancelled(token, operation()).await {
                Ok(outcome) => outcome,
                Err(cancelled) => return Err(RetryError::Cancelled(cancelled)),
            },
            None => operation().await,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled(Cancelled));
            }
        }

        let retries_spent = options.max_retries.is_some_and(|cap| attempt > cap);
        let deadline_passed = options.timeout.is_some_and(|limit| started.elapsed() >= limit);
        if retries_spent || deadline_passed {
            return Err(RetryError::Exhausted {
                task: options.task_name,
                attempts: attempt,
                source: error,
            });
        }

        if let Some(hook) = options.on_error.as_mut() {
            hook(&error, attempt);
        }

        let wait = options.wait.wait_for(attempt);
        debug!(
            task = options.task_name,
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );
        match &options.cancel {
            Some(token) => {
                or_cancelled(token, sleep(wait))
                    .await
                    .map_err(RetryError::Cancelled)?;
            }
            None => sleep(wait).await,
        }
    }
}
