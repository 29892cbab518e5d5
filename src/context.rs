//! Cancellation and deadline context governing a session.
//!
//! A [`Context`] is cheap to clone. Both session activities observe it at
//! phase boundaries; it never interrupts a connector callback mid-flight.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use materialize_txn::Context;
//!
//! let ctx = Context::new().with_timeout(Duration::from_secs(30));
//! assert!(ctx.err().is_none());
//!
//! ctx.cancel();
//! assert!(ctx.err().unwrap().is_cancelled());
//! ```

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TxnError;

/// Cancellation token plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context which is never done until cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound this context by a timeout from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Bound this context by a deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// A child context, cancelled with this one but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, or `None` if it is still live.
    pub fn err(&self) -> Option<TxnError> {
        if self.token.is_cancelled() {
            Some(TxnError::Cancelled)
        } else if matches!(self.deadline, Some(d) if Instant::now() >= d) {
            Some(TxnError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolve when this context is done, returning the reason.
    pub async fn done(&self) -> TxnError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => TxnError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => TxnError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                TxnError::Cancelled
            }
        }
    }

    /// Run `fut` unless this context finishes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, TxnError>
    where
        F: std::future::Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            out = fut => Ok(out),
            err = self.done() => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_propagates_to_child() {
        let parent = Context::new();
        let child = parent.child();
        assert!(!child.is_done());

        parent.cancel();
        assert!(matches!(child.done().await, TxnError::Cancelled));
        assert!(child.err().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = Context::new().with_timeout(Duration::from_millis(50));
        assert!(ctx.err().is_none());

        let err = ctx.done().await;
        assert!(matches!(err, TxnError::DeadlineExceeded));
        assert!(matches!(ctx.err(), Some(TxnError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let ctx = Context::new()
            .with_timeout(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(10));
        let out = ctx.run(tokio::time::sleep(Duration::from_secs(1))).await;
        assert!(matches!(out, Err(TxnError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::new();
        let out = ctx.run(async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }
}
