//! Start, stop, restart, status and logs for an
//! application's systemd unit.
//!
//! Commands run as the target's operating identity: the privileged user
//! before lockdown, the service account (through sudo) after.

use std::sync::Arc;

use deployer_common::ServerTarget;

use crate::application::context::CallContext;
use crate::application::ports::RemoteExecutor;
use crate::application::shell::RemoteShell;
use crate::domain::service::{
    ServiceAction, ServiceStatus, control_command, is_unit_not_found, logs_command, parse_status,
    status_command, validate_service_name,
};
use crate::domain::{DeployError, RemoteCommand};

#[derive(Clone)]
pub struct ServiceController {
    executor: Arc<dyn RemoteExecutor>,
}

impl ServiceController {
    #[must_use]
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// # Errors
    ///
    /// [`DeployError::ServiceNotFound`] if the unit does not exist, otherwise
    /// the remote command or transport error.
    pub async fn control(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        service: &str,
        action: ServiceAction,
    ) -> Result<(), DeployError> {
        validate_service_name(service)?;
        let shell = self.shell(ctx, target);
        control_service(&shell, service, action).await?;
        tracing::info!(server = %target.label(), service, action = action.verb(), "service action applied");
        Ok(())
    }

    /// # Errors
    ///
    /// See [`ServiceController::control`].
    pub async fn start(&self, ctx: &CallContext, target: &ServerTarget, service: &str) -> Result<(), DeployError> {
        self.control(ctx, target, service, ServiceAction::Start).await
    }

    /// # Errors
    ///
    /// See [`ServiceController::control`].
    pub async fn stop(&self, ctx: &CallContext, target: &ServerTarget, service: &str) -> Result<(), DeployError> {
        self.control(ctx, target, service, ServiceAction::Stop).await
    }

    /// # Errors
    ///
    /// See [`ServiceController::control`].
    pub async fn restart(&self, ctx: &CallContext, target: &ServerTarget, service: &str) -> Result<(), DeployError> {
        self.control(ctx, target, service, ServiceAction::Restart).await
    }

    /// Structured state, main PID and uptime.
    ///
    /// # Errors
    ///
    /// [`DeployError::ServiceNotFound`] if the unit does not exist.
    pub async fn status(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        service: &str,
    ) -> Result<ServiceStatus, DeployError> {
        validate_service_name(service)?;
        let output = self
            .shell(ctx, target)
            .run_checked(&RemoteCommand::new(status_command(service)))
            .await?;
        parse_status(service, &output.stdout)
    }

    /// The last `lines` journal lines (clamped to 1..=10000).
    ///
    /// # Errors
    ///
    /// [`DeployError::ServiceNotFound`] if the unit does not exist.
    pub async fn tail_logs(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        service: &str,
        lines: u32,
    ) -> Result<String, DeployError> {
        // journalctl happily prints nothing for unknown units.
        self.status(ctx, target, service).await?;
        Ok(self
            .shell(ctx, target)
            .sudo(&logs_command(service, lines))
            .await?
            .stdout)
    }

    fn shell<'a>(&'a self, ctx: &'a CallContext, target: &'a ServerTarget) -> RemoteShell<'a> {
        RemoteShell::new(self.executor.as_ref(), ctx, target, target.operating_identity())
    }
}

/// Apply `action` to `service`, mapping systemd's "unit not found" to
/// [`DeployError::ServiceNotFound`].
pub(crate) async fn control_service(
    shell: &RemoteShell<'_>,
    service: &str,
    action: ServiceAction,
) -> Result<(), DeployError> {
    let command = RemoteCommand::new(control_command(action, service)).sudo();
    let output = shell.run(&command).await?;
    if !output.success() && is_unit_not_found(&output.stderr) {
        return Err(DeployError::ServiceNotFound(service.to_string()));
    }
    output.check(&command).map(drop)
}
