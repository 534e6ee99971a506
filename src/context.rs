//! Cancellation and deadline propagation
//!
//! Every operation takes a [`Context`] that is threaded down to each query call.
//! A query raced against a cancelled or expired context is abandoned and the call
//! returns [`AdminError::Cancelled`]; no partial result is returned.

use std::future::{pending, Future};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{AdminError, Result};

/// Cancellation/deadline token for one logical operation
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle that cancels every [`Context`] derived from [`Context::with_cancel`]
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Cancel the associated contexts
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context whose deadline is at most `timeout` from now
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Derive a cancellable context
    #[must_use]
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle(tx))
    }

    /// A fresh context for compensating work that must outlive the caller's cancellation
    #[must_use]
    pub fn detached(timeout: Duration) -> Self {
        Self::background().with_timeout(timeout)
    }

    /// Remaining time before the deadline, if any
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// True once cancelled or past the deadline
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    fn reason(&self) -> Option<&'static str> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            Some("cancelled")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some("deadline exceeded")
        } else {
            None
        }
    }

    /// Fail fast if the context is already done
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(AdminError::cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Run `fut`, abandoning it if the context is cancelled first
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(reason) = self.reason() {
            return Err(AdminError::cancelled(format!("{what}: {reason}")));
        }
        tokio::select! {
            res = fut => res,
            reason = self.done() => Err(AdminError::cancelled(format!("{what}: {reason}"))),
        }
    }

    async fn done(&self) -> &'static str {
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // sender dropped without cancelling
                        pending::<()>().await;
                    }
                },
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            () = cancelled => "cancelled",
            () = expired => "deadline exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = Context::background();
        let value = ctx.run("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_work() {
        let (ctx, handle) = Context::background().with_cancel();
        let task = tokio::spawn(async move {
            ctx.run("sleep", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
        });

        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.error_code(), "CANCELLED");
        assert!(err.message().contains("sleep"));
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = ctx
            .run("slow query", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.message().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_check_after_cancel() {
        let (ctx, handle) = Context::background().with_cancel();
        assert!(ctx.check().is_ok());
        handle.cancel();
        assert!(ctx.is_done());
        assert!(ctx.check().is_err());
    }

    #[test]
    fn test_timeout_only_tightens() {
        let ctx = Context::background()
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() <= Duration::from_secs(1));
    }
}
