//! `pbdeploy lockdown`: harden a set-up server.

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::commands::{InterruptGuard, with_engine};

#[derive(Args)]
pub struct LockdownArgs {
    /// Server id or name from the inventory
    pub server: String,
}

/// Run `pbdeploy lockdown`.
///
/// # Errors
///
/// Returns an error if the server is unknown, not set up, already locked,
/// or a lockdown step fails.
pub async fn run(app: &AppContext, args: LockdownArgs) -> Result<()> {
    let target = app.inventory.load()?.server(&args.server)?.clone();

    app.output.warn(&format!(
        "Lockdown disables password login and SSH login as '{}' on {}.",
        target.privileged_user,
        target.label()
    ));
    app.output.info(&format!(
        "Afterwards every operation runs as '{}' with sudo.",
        target.unprivileged_user
    ));
    if !app.confirm("Continue with lockdown?", true)? {
        app.output.info("Lockdown cancelled");
        return Ok(());
    }

    app.output.header(&format!("Locking down {}", target.label()));
    let target = with_engine(app, async |engine| {
        let handle = engine.security.start(target)?;
        let _interrupt = InterruptGuard::new(handle.cancellation());
        Ok(handle.wait().await??)
    })
    .await?;

    app.inventory.update(|inv| {
        inv.put_server(target.clone());
        Ok(())
    })?;
    app.renderer().render_server(&target, "Server locked down")
}
