//! Request-scoped cancellation and deadline.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// Cancellation signal plus an optional absolute deadline.
///
/// Cloning shares the same token. [`child`](Context::child) derives a token
/// that is cancelled with its parent but can also be cancelled on its own.
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

    /// Wrap an existing token, e.g. a component's shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context whose deadline is the earlier of the parent's and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, clock: &dyn Clock, timeout: Duration) -> Self {
        self.with_deadline(clock.now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancelled, or past its deadline at `now`.
    pub fn is_done(&self, now: Instant) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Resolves on cancellation only.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Resolves on cancellation or when the deadline passes on `clock`.
    pub async fn done(&self, clock: &dyn Clock) {
        match self.remaining(clock.now()) {
            Some(wait) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = clock.sleep(wait) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}
