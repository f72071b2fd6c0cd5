//! [`RemoteExecutor`] over the connection pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deployer_common::{Identity, ServerTarget};

use crate::application::context::CallContext;
use crate::application::ports::RemoteExecutor;
use crate::domain::config::ExecutorConfig;
use crate::domain::{CommandOutput, DeployError, RemoteCommand};
use crate::infra::pool::{ConnectionPool, PooledSession};

/// Floor for file transfers, which move whole release archives.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub struct PooledExecutor {
    pool: Arc<ConnectionPool>,
    default_timeout: Duration,
}

impl PooledExecutor {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, config: &ExecutorConfig) -> Self {
        Self {
            pool,
            default_timeout: config.default_timeout(),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn transfer_timeout(&self) -> Duration {
        self.default_timeout.max(TRANSFER_TIMEOUT)
    }
}

/// A transport failure, or any error after which the session reports
/// itself closed, leaves the session unusable. Anything else (nonzero exit,
/// timeout, cancellation, a file-level transfer error) returns it to the pool.
fn settle<T>(lease: &mut PooledSession, result: Result<T, DeployError>) -> Result<T, DeployError> {
    if let Err(e) = &result
        && (e.is_transport_failure() || lease.session().is_none_or(|s| s.is_closed()))
    {
        lease.condemn();
    }
    result
}

fn lost(lease: &PooledSession) -> DeployError {
    DeployError::Connection {
        target: lease.key().address(),
        reason: "session closed".to_string(),
    }
}

#[async_trait]
impl RemoteExecutor for PooledExecutor {
    async fn run(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        identity: Identity,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, DeployError> {
        let username = target.username(identity);
        let wire = command.wire_command(username);
        let limit = command.timeout.unwrap_or(self.default_timeout);
        tracing::debug!(
            target = %target.label(),
            user = username,
            sudo = command.sudo,
            command = command.display(),
            "remote exec"
        );

        let mut lease = self.pool.acquire(ctx, target, identity).await?;
        let result = match lease.session() {
            Some(session) => ctx.run(command.display(), limit, session.exec(&wire)).await,
            None => Err(lost(&lease)),
        };
        let result = settle(&mut lease, result);
        match &result {
            Ok(out) => tracing::debug!(exit = out.exit_code, command = command.display(), "remote exec finished"),
            Err(e) => tracing::debug!(error = %e, command = command.display(), "remote exec failed"),
        }
        result
    }

    async fn upload(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        identity: Identity,
        data: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<(), DeployError> {
        tracing::debug!(target = %target.label(), remote_path, bytes = data.len(), "upload");
        let mut lease = self.pool.acquire(ctx, target, identity).await?;
        let what = format!("upload {remote_path}");
        let result = match lease.session() {
            Some(session) => {
                ctx.run(&what, self.transfer_timeout(), session.upload(remote_path, data, mode))
                    .await
            }
            None => Err(lost(&lease)),
        };
        settle(&mut lease, result)
    }

    async fn download(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        identity: Identity,
        remote_path: &str,
    ) -> Result<Vec<u8>, DeployError> {
        tracing::debug!(target = %target.label(), remote_path, "download");
        let mut lease = self.pool.acquire(ctx, target, identity).await?;
        let what = format!("download {remote_path}");
        let result = match lease.session() {
            Some(session) => {
                ctx.run(&what, self.transfer_timeout(), session.download(remote_path))
                    .await
            }
            None => Err(lost(&lease)),
        };
        settle(&mut lease, result)
    }

    async fn forget(&self, target: &ServerTarget, identity: Identity) {
        self.pool.evict(target, identity).await;
    }
}
