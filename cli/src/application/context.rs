//! Caller-supplied cancellation and deadline for remote calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::DeployError;

/// Carried by every remote call. Cancelling the token or passing the deadline
/// aborts the call in flight; it does not tear down the pool.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Same token, with the deadline tightened to at most `timeout` from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(self.deadline.map_or(candidate, |d| d.min(candidate))),
        }
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, if there is one.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if already cancelled or past the deadline.
    ///
    /// # Errors
    ///
    /// [`DeployError::Cancelled`] or [`DeployError::Timeout`].
    pub fn check(&self, what: &str) -> Result<(), DeployError> {
        if self.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        if self.remaining() == Some(Duration::ZERO) {
            return Err(DeployError::Timeout {
                what: what.to_string(),
                after: Duration::ZERO,
            });
        }
        Ok(())
    }

    /// Run `fut` bounded by `limit`, the context deadline and cancellation,
    /// whichever comes first.
    ///
    /// # Errors
    ///
    /// The future's own error, [`DeployError::Timeout`] or [`DeployError::Cancelled`].
    pub async fn run<T, F>(&self, what: &str, limit: Duration, fut: F) -> Result<T, DeployError>
    where
        F: Future<Output = Result<T, DeployError>>,
    {
        self.check(what)?;
        let budget = self.remaining().map_or(limit, |r| r.min(limit));
        tokio::select! {
            () = self.cancel.cancelled() => Err(DeployError::Cancelled),
            () = tokio::time::sleep(budget) => Err(DeployError::Timeout {
                what: what.to_string(),
                after: budget,
            }),
            result = fut => result,
        }
    }

    /// Sleep for `delay` unless cancelled first.
    ///
    /// # Errors
    ///
    /// [`DeployError::Cancelled`] if the token fires during the sleep.
    pub async fn sleep(&self, delay: Duration) -> Result<(), DeployError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(DeployError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
