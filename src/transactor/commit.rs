//! Future of a started commit.
//!
//! A [`CommitFuture`] resolves exactly once. Its outcome is cached, so it may
//! be peeked with [`CommitFuture::try_result`] and awaited afterwards.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, TxnError};

type Outcome = std::result::Result<(), Arc<TxnError>>;

enum State {
    Resolved(Outcome),
    Channel(oneshot::Receiver<Result<()>>),
    Task(JoinHandle<Result<()>>),
}

/// Resolves when a commit started by the connector completes.
///
/// Awaiting yields `Ok(())` or the commit's error, shared by every observer.
pub struct CommitFuture {
    state: State,
}

impl CommitFuture {
    /// A future which is already resolved.
    pub fn ready(result: Result<()>) -> Self {
        Self {
            state: State::Resolved(result.map_err(TxnError::into_shared)),
        }
    }

    /// A future already resolved with success. Used for no-op commits.
    pub fn ok() -> Self {
        Self::ready(Ok(()))
    }

    /// A future already resolved with `err`.
    pub fn failed(err: TxnError) -> Self {
        Self::ready(Err(err))
    }

    /// Run a commit as a background task.
    ///
    /// If the task panics or is aborted the future resolves with an error.
    pub fn spawn<F>(commit: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            state: State::Task(tokio::spawn(commit)),
        }
    }

    /// A future resolved through the returned [`CommitResolver`].
    pub fn pair() -> (CommitResolver, CommitFuture) {
        let (tx, rx) = oneshot::channel();
        (
            CommitResolver { tx },
            Self {
                state: State::Channel(rx),
            },
        )
    }

    /// Peek at the outcome without waiting. `None` while still running.
    pub fn try_result(&mut self) -> Option<Outcome> {
        let mut cx = TaskContext::from_waker(futures::task::noop_waker_ref());
        match self.poll_outcome(&mut cx) {
            Poll::Ready(outcome) => Some(outcome),
            Poll::Pending => None,
        }
    }

    /// Whether the future has resolved.
    pub fn is_resolved(&mut self) -> bool {
        self.try_result().is_some()
    }

    fn poll_outcome(&mut self, cx: &mut TaskContext<'_>) -> Poll<Outcome> {
        let result = match &mut self.state {
            State::Resolved(outcome) => return Poll::Ready(outcome.clone()),
            State::Channel(rx) => match ready!(rx.poll_unpin(cx)) {
                Ok(result) => result,
                Err(_) => Err(TxnError::connector(
                    "commit resolver dropped without resolving",
                )),
            },
            State::Task(handle) => match ready!(handle.poll_unpin(cx)) {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(TxnError::connector("commit task panicked")),
                Err(_) => Err(TxnError::connector("commit task was aborted")),
            },
        };

        let outcome = result.map_err(TxnError::into_shared);
        self.state = State::Resolved(outcome.clone());
        Poll::Ready(outcome)
    }
}

impl Default for CommitFuture {
    fn default() -> Self {
        Self::ok()
    }
}

impl Future for CommitFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .poll_outcome(cx)
            .map(|outcome| outcome.map_err(TxnError::Shared))
    }
}

impl fmt::Debug for CommitFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Resolved(Ok(())) => "resolved",
            State::Resolved(Err(_)) => "failed",
            State::Channel(_) | State::Task(_) => "pending",
        };
        f.debug_struct("CommitFuture").field("state", &state).finish()
    }
}

/// Resolves a [`CommitFuture`] created by [`CommitFuture::pair`].
///
/// Dropping the resolver unresolved fails the future.
#[derive(Debug)]
pub struct CommitResolver {
    tx: oneshot::Sender<Result<()>>,
}

impl CommitResolver {
    /// Resolve the paired future.
    pub fn resolve(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }
}
