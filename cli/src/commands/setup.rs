//! `pbdeploy setup`: prepare a fresh server for PocketBase apps.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::app::AppContext;
use crate::commands::{InterruptGuard, with_engine};
use crate::domain::setup::SetupOptions;

#[derive(Args)]
pub struct SetupArgs {
    /// Server id or name from the inventory
    pub server: String,

    /// Configure the ufw firewall with the allowed ports
    #[arg(long)]
    pub firewall: bool,

    /// Public key file to authorize for the service account (repeatable).
    /// Defaults to the keys that can already log in as the privileged user.
    #[arg(long = "key", value_name = "FILE")]
    pub keys: Vec<PathBuf>,

    /// Package to install instead of the default set (repeatable)
    #[arg(long = "package", value_name = "NAME")]
    pub packages: Vec<String>,
}

/// Run `pbdeploy setup`.
///
/// # Errors
///
/// Returns an error if the server is unknown, the options are invalid, or a
/// setup step fails.
pub async fn run(app: &AppContext, args: SetupArgs) -> Result<()> {
    let target = app.inventory.load()?.server(&args.server)?.clone();
    let options = build_options(&args)?;

    app.output.header(&format!("Setting up {}", target.label()));
    let target = with_engine(app, async |engine| {
        let handle = engine.setup.start(target, options)?;
        let _interrupt = InterruptGuard::new(handle.cancellation());
        Ok(handle.wait().await??)
    })
    .await?;

    app.inventory.update(|inv| {
        inv.put_server(target.clone());
        Ok(())
    })?;
    app.renderer().render_server(&target, "Server ready")
}

fn build_options(args: &SetupArgs) -> Result<SetupOptions> {
    let mut options = SetupOptions {
        configure_firewall: args.firewall,
        ..SetupOptions::default()
    };
    for path in &args.keys {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read public key {}", path.display()))?;
        options.public_keys.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    if !args.packages.is_empty() {
        options.packages.clone_from(&args.packages);
    }
    options.validate()?;
    Ok(options)
}
