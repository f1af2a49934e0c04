//! Request-scoped context: a deadline, optional metadata, and a shared
//! cooperative cancellation signal.
//!
//! Every clone of a [`Context`] shares the same cancellation state; any
//! clone may cancel, and all observers see it. Cancellation is cooperative:
//! nothing is torn down for you, the engine and handlers are expected to
//! observe the signal and return.

use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::watch;

/// Why [`Context::done`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Cancelled,
    DeadlineExceeded,
}

/// A request-scoped carrier of deadline, metadata, and cancellation.
#[derive(Clone)]
pub struct Context {
    deadline: Option<SystemTime>,
    meta: Option<Value>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Context {
    /// A fresh context with no deadline, no metadata, not cancelled.
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            deadline: None,
            meta: None,
            cancel_tx,
            cancel_rx,
        }
    }

    /// This context with a deadline at the given wall-clock time. The
    /// cancellation signal is shared with the original.
    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// This context with a deadline the given duration from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(SystemTime::now() + timeout)
    }

    /// This context carrying the given metadata value.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// Signal cancellation. Idempotent; observed by every clone.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Wait until cancellation is signalled. Resolves immediately if the
    /// context is already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Every sender is gone; nothing can cancel us anymore.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Wait until the context is cancelled or its deadline passes,
    /// reporting which happened. Never resolves for a context with no
    /// deadline that is never cancelled.
    pub async fn done(&self) -> DoneReason {
        let deadline = self.deadline;
        tokio::select! {
            _ = self.cancelled() => DoneReason::Cancelled,
            _ = async {
                match deadline {
                    Some(at) => match at.duration_since(SystemTime::now()) {
                        Ok(wait) => tokio::time::sleep(wait).await,
                        Err(_) => {} // already past
                    },
                    None => std::future::pending().await,
                }
            } => DoneReason::DeadlineExceeded,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("meta", &self.meta)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fresh_context_is_not_cancelled() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.deadline().is_none());
        assert!(ctx.meta().is_none());
    }

    #[tokio::test]
    async fn cancel_is_shared_across_clones() {
        let ctx = Context::new();
        let clone = ctx.clone();
        ctx.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_on_cancel() {
        let ctx = Context::new();
        let observer = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            observer.cancel();
        });
        tokio::time::timeout(Duration::from_secs(1), ctx.cancelled())
            .await
            .expect("cancelled() should resolve");
        assert_eq!(ctx.done().await, DoneReason::Cancelled);
    }

    #[tokio::test]
    async fn done_resolves_at_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(5));
        let reason = tokio::time::timeout(Duration::from_secs(1), ctx.done())
            .await
            .expect("done() should resolve");
        assert_eq!(reason, DoneReason::DeadlineExceeded);
    }

    #[tokio::test]
    async fn past_deadline_resolves_immediately() {
        let ctx = Context::new().with_deadline(SystemTime::now() - Duration::from_secs(1));
        assert_eq!(ctx.done().await, DoneReason::DeadlineExceeded);
    }

    #[test]
    fn builders_preserve_shared_cancellation() {
        let ctx = Context::new();
        let derived = ctx.clone().with_meta(json!({"user": "a"}));
        ctx.cancel();
        assert!(derived.is_cancelled());
        assert_eq!(derived.meta(), Some(&json!({"user": "a"})));
    }
}
