use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sentinel distinguishing cancellation from ordinary failure.
///
/// Everything in this crate that can be aborted resolves with `Cancelled`
/// rather than a transport or serialization error, so callers can always
/// tell the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Races a future against a cancellation token.
///
/// Resolves with the future's output, or with `Err(Cancelled)` as soon as the
/// token fires. The future is dropped on cancellation, which aborts any
/// in-flight I/O it owns.
pub async fn or_cancelled<T, F>(token: &CancellationToken, future: F) -> Result<T, Cancelled>
where
    F: Future<Output = T>,
{
    tokio::select! {
        _ = token.cancelled() => Err(Cancelled),
        value = future => Ok(value),
    }
}

struct GroupState {
    cancelled: bool,
    next_id: u64,
    live: HashMap<u64, CancellationToken>,
}

/// A set of outstanding operations that can be cancelled collectively.
///
/// Each operation runs under a fresh token handed out by [`CancelGroup::scoped`];
/// the token is removed from the group on every exit path. Once
/// [`CancelGroup::cancel_all`] has fired, further scoped operations fail
/// immediately with [`Cancelled`].
pub struct CancelGroup {
    inner: Mutex<GroupState>,
}

impl CancelGroup {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GroupState {
                cancelled: false,
                next_id: 0,
                live: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GroupState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `operation` under a fresh member token.
    ///
    /// The token is registered while the operation runs and unregistered when
    /// it settles, including when the returned future is dropped early.
    pub async fn scoped<T, F, Fut>(&self, operation: F) -> Result<T, Cancelled>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let token = CancellationToken::new();
        let id = {
            let mut state = self.state();
            if state.cancelled {
                return Err(Cancelled);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.live.insert(id, token.clone());
            id
        };
        let _unregister = Unregister { group: self, id };
        Ok(operation(token).await)
    }

    /// Triggers every live member token and empties the set. Idempotent.
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = {
            let mut state = self.state();
            state.cancelled = true;
            state.live.drain().map(|(_, token)| token).collect()
        };
        for token in tokens {
            token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Number of operations currently running under this group.
    pub fn len(&self) -> usize {
        self.state().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CancelGroup {
    fn default() -> Self {
        Self::new()
    }
}

struct Unregister<'a> {
    group: &'a CancelGroup,
    id: u64,
}

impl Drop for Unregister<'_> {
    fn drop(&mut self) {
        self.group.state().live.remove(&self.id);
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An operation paired with the token that stops it.
pub struct Cancellable<T> {
    pub token: CancellationToken,
    pub future: BoxFuture<T>,
}

impl<T> Cancellable<T> {
    /// Builds the operation from a closure receiving a fresh token.
    pub fn wrap<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let token = CancellationToken::new();
        let future = make(token.clone());
        Self {
            token,
            future: Box::pin(future),
        }
    }
}

/// Drives all operations concurrently and returns the first settled output,
/// triggering the tokens of the remaining operations so they can stop
/// cooperatively. Returns `None` for an empty input.
pub async fn first_of<T: Send + 'static>(operations: Vec<Cancellable<T>>) -> Option<T> {
    if operations.is_empty() {
        return None;
    }
    let (result_tx, mut result_rx) = mpsc::channel(operations.len());
    let tokens: Vec<CancellationToken> = operations.iter().map(|op| op.token.clone()).collect();
    for op in operations {
        let result_tx = result_tx.clone();
        tokio::spawn(async move {
            let output = op.future.await;
            let _ = result_tx.send(output).await;
        });
    }
    drop(result_tx);
    let first = result_rx.recv().await;
    for token in &tokens {
        token.cancel();
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn scoped_runs_and_unregisters() {
        let group = CancelGroup::new();
        let result = group.scoped(|_token| async { 42 }).await;
        assert_eq!(result, Ok(42));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn scoped_fails_once_group_is_cancelled() {
        let group = CancelGroup::new();
        group.cancel_all();
        let result = group.scoped(|_token| async { 42 }).await;
        assert_eq!(result, Err(Cancelled));
        // Idempotent: a second trigger changes nothing.
        group.cancel_all();
        assert!(group.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_all_fires_member_tokens() {
        let group = std::sync::Arc::new(CancelGroup::new());
        let inner = group.clone();
        let task = tokio::spawn(async move {
            inner
                .scoped(|token| async move {
                    or_cancelled(&token, sleep(Duration::from_secs(30))).await
                })
                .await
        });
        // Let the scoped operation register before triggering.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(group.len(), 1);
        group.cancel_all();
        let outcome = task.await.unwrap();
        assert_eq!(outcome, Ok(Err(Cancelled)));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn or_cancelled_prefers_completed_future() {
        let token = CancellationToken::new();
        assert_eq!(or_cancelled(&token, async { 7 }).await, Ok(7));

        token.cancel();
        let result = or_cancelled(&token, sleep(Duration::from_secs(30))).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn first_of_cancels_the_losers() {
        let fast = Cancellable::wrap(|_token| async { "fast" });
        let slow = Cancellable::wrap(|token| async move {
            match or_cancelled(&token, sleep(Duration::from_secs(30))).await {
                Ok(()) => "slow",
                Err(Cancelled) => "stopped",
            }
        });
        let slow_token = slow.token.clone();
        let winner = first_of(vec![fast, slow]).await;
        assert_eq!(winner, Some("fast"));
        assert!(slow_token.is_cancelled());
    }

    #[tokio::test]
    async fn first_of_empty_is_none() {
        let winner = first_of(Vec::<Cancellable<()>>::new()).await;
        assert!(winner.is_none());
    }
}
