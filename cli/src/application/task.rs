//! Background operations with cancellation and an awaitable result.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::context::CallContext;
use crate::domain::DeployError;

/// Handle to a spawned long-running operation (setup, lockdown, deploy).
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: String,
    cancel: CancellationToken,
    join: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation. The operation still reaches its terminal state.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the token, for cancelling from another task.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the operation to finish.
    ///
    /// # Errors
    ///
    /// [`DeployError::TaskAborted`] if the task panicked or was aborted.
    pub async fn wait(self) -> Result<T, DeployError> {
        self.join
            .await
            .map_err(|e| DeployError::TaskAborted(e.to_string()))
    }
}

/// Spawn `op` on the runtime with a fresh cancellation token.
///
/// `id` identifies the operation for progress subscribers; a random one is
/// generated when `None`.
pub fn spawn_operation<T, F, Fut>(id: Option<String>, op: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(CallContext) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let ctx = CallContext::with_cancel(cancel.clone());
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::debug!(task = %id, "spawning background operation");
    let join = tokio::spawn(op(ctx));
    TaskHandle { id, cancel, join }
}
