//! Cancellable, deadline-bearing request context.
//!
//! Every coordination operation takes a [`Context`]. Cancelling it (or letting
//! its deadline pass) aborts any wait inside the facade and is forwarded to the
//! underlying connection, which decides how to honor it.
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TopoError;

/// Request-scoped cancellation and deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A child context whose deadline is `timeout` from now. A timeout too
    /// far out to represent sets no deadline of its own.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// A child context with the given deadline, or the parent's if earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// A child context, cancelled whenever `self` is.
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

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Why the context is done, if it is. Cancellation wins over the deadline.
    pub fn err(&self) -> Option<TopoError> {
        if self.token.is_cancelled() {
            return Some(TopoError::Interrupted("context canceled".into()));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(TopoError::Timeout("context deadline exceeded".into()))
            }
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline elapses.
    pub async fn done(&self) -> TopoError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
        self.err()
            .unwrap_or_else(|| TopoError::Interrupted("context canceled".into()))
    }
}
