//! Cooperative cancellation with deadlines.
//!
//! A [`CancelToken`] is a set of stop signals plus an optional deadline.
//! Deriving a token ([`CancelToken::child`], [`CancelToken::with_timeout`])
//! never loosens the parent: a child is interrupted whenever its parent is,
//! and its deadline is the earlier of the two.

use futures::future::{self, FutureExt};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a token was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// One of the stop signals fired
    Canceled,
    /// The deadline passed
    DeadlineExceeded,
}

/// Cloneable handle observed by every blocking wait in a scan.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Owner side of a signal created by [`CancelToken::child`].
///
/// Dropping the guard cancels the child token.
#[derive(Debug)]
pub struct CancelGuard {
    tx: watch::Sender<bool>,
}

impl CancelGuard {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl CancelToken {
    /// A token that is never interrupted.
    pub fn none() -> Self {
        Self::default()
    }

    /// Derive a token with an extra stop signal owned by the returned guard.
    pub fn child(&self) -> (Self, CancelGuard) {
        let (tx, rx) = watch::channel(false);
        (self.with_signal(rx), CancelGuard { tx })
    }

    /// Derive a token that is also interrupted when `signal` becomes `true`.
    pub(crate) fn with_signal(&self, signal: watch::Receiver<bool>) -> Self {
        let mut token = self.clone();
        token.signals.push(signal);
        token
    }

    /// Derive a token whose deadline is at most `timeout` from now. A
    /// timeout too far out to represent adds no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a token whose deadline is at most `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut token = self.clone();
        token.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check. Cancellation wins over an expired deadline.
    pub fn check(&self) -> Option<Interrupt> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            Some(Interrupt::Canceled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(Interrupt::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Wait until the token is interrupted.
    pub async fn interrupted(&self) -> Interrupt {
        if let Some(interrupt) = self.check() {
            return interrupt;
        }

        let canceled = async {
            if self.signals.is_empty() {
                return future::pending::<()>().await;
            }
            let waits = self.signals.iter().cloned().map(|mut rx| {
                async move {
                    let fired = rx.wait_for(|stopped| *stopped).await.is_ok();
                    // A sender dropped without firing can never cancel.
                    if !fired {
                        future::pending::<()>().await;
                    }
                }
                .boxed()
            });
            future::select_all(waits).await;
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = canceled => Interrupt::Canceled,
            _ = expired => Interrupt::DeadlineExceeded,
        }
    }
}
