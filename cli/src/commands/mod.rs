//! Command implementations

pub mod config;
pub mod deploy;
pub mod doctor;
pub mod lockdown;
pub mod rollback;
pub mod service;
pub mod setup;
pub mod version;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::app::{AppContext, Engine};

/// Cancel `token` on Ctrl-C until the returned guard is dropped.
pub(crate) struct InterruptGuard(tokio::task::JoinHandle<()>);

impl InterruptGuard {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted; cancelling operation");
                eprintln!("  Interrupted; finishing the current step and cleaning up...");
                token.cancel();
            }
        }))
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Build the engine, run `op`, and always shut the pool down afterwards.
pub(crate) async fn with_engine<T>(
    app: &AppContext,
    op: impl AsyncFnOnce(&Engine) -> Result<T>,
) -> Result<T> {
    let engine = app.engine()?;
    let result = op(&engine).await;
    engine.shutdown().await;
    result
}
