//! `pbdeploy service`: control an application's systemd unit.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::app::AppContext;
use crate::application::CallContext;
use crate::commands::{InterruptGuard, with_engine};
use crate::domain::service::{DEFAULT_LOG_LINES, ServiceAction};

#[derive(Args)]
pub struct ServiceArgs {
    /// Application id or name from the inventory
    pub app: String,

    #[command(subcommand)]
    pub action: ServiceCommand,
}

#[derive(Subcommand, Clone, Copy)]
pub enum ServiceCommand {
    /// Start the service
    Start,
    /// Stop the service
    Stop,
    /// Restart the service
    Restart,
    /// Show state, PID and uptime
    Status,
    /// Show recent journal lines
    Logs {
        /// Number of lines (1-10000)
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: u32,
    },
}

/// Run `pbdeploy service`.
///
/// # Errors
///
/// Returns an error if the app is unknown, the unit does not exist, or the
/// remote command fails.
pub async fn run(app: &AppContext, args: ServiceArgs) -> Result<()> {
    let inventory = app.inventory.load()?;
    let managed = inventory.app(&args.app)?.clone();
    let target = inventory.server(&managed.server_id)?.clone();
    let service = managed.service_name.as_str();

    with_engine(app, async |engine| {
        let ctx = CallContext::new();
        let _interrupt = InterruptGuard::new(ctx.token().clone());
        let controller = &engine.services;
        let action = match args.action {
            ServiceCommand::Start => ServiceAction::Start,
            ServiceCommand::Stop => ServiceAction::Stop,
            ServiceCommand::Restart => ServiceAction::Restart,
            ServiceCommand::Status => {
                let status = controller.status(&ctx, &target, service).await?;
                return app.renderer().render_service_status(service, &status);
            }
            ServiceCommand::Logs { lines } => {
                let logs = controller.tail_logs(&ctx, &target, service, lines).await?;
                return app.renderer().render_logs(service, &logs);
            }
        };
        controller.control(&ctx, &target, service, action).await?;
        app.renderer().render_service_action(action.verb(), service)
    })
    .await
}
