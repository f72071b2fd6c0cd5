//! `pbdeploy deploy`: ship a release archive to an application.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use secrecy::SecretString;

use crate::app::{AppContext, read_file};
use crate::application::services::{AdminCredentials, DeployRequest, DeploymentTask};
use crate::commands::{InterruptGuard, with_engine};

/// Environment variable holding the first-deploy superuser password.
pub const ADMIN_PASSWORD_ENV: &str = "PB_ADMIN_PASSWORD";

#[derive(Args)]
pub struct DeployArgs {
    /// Application id or name from the inventory
    pub app: String,

    /// Release archive (.tar.gz with `pocketbase` and `pb_public/` at the root)
    pub artifact: PathBuf,

    /// Version label for this release (semver)
    #[arg(long)]
    pub label: String,

    /// First deploy: install the systemd unit and create the superuser
    #[arg(long)]
    pub first: bool,

    /// Superuser email for the first deploy (password from PB_ADMIN_PASSWORD)
    #[arg(long, requires = "first")]
    pub admin_email: Option<String>,
}

/// Run `pbdeploy deploy`.
///
/// # Errors
///
/// Returns an error if the request is rejected or the deployment fails.
pub async fn run(app: &AppContext, args: DeployArgs) -> Result<()> {
    let mut inventory = app.inventory.load()?;
    let managed = inventory.app(&args.app)?.clone();
    let target = inventory.server(&managed.server_id)?.clone();

    let artifact_path = std::path::absolute(&args.artifact)
        .with_context(|| format!("cannot resolve {}", args.artifact.display()))?;
    let artifact = read_file(&artifact_path)?;
    let credentials = if args.first {
        Some(first_deploy_credentials(args.admin_email.as_deref())?)
    } else {
        None
    };
    let version = inventory.register_version(&managed.id, &args.label, &artifact_path);

    app.output.header(&format!(
        "Deploying {} {} to {}",
        managed.name,
        version.label,
        target.label()
    ));
    with_engine(app, async |engine| {
        let task = engine.pipeline.submit(DeployRequest {
            target,
            app: managed,
            version,
            artifact,
            first_deploy: args.first,
            credentials,
        })?;
        // Accepted: remember the version even if the run fails.
        app.inventory.save(&inventory)?;
        follow(app, task).await
    })
    .await
}

fn first_deploy_credentials(email: Option<&str>) -> Result<AdminCredentials> {
    let email = email
        .context("--admin-email is required with --first")?
        .to_string();
    let password = std::env::var(ADMIN_PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .with_context(|| format!("{ADMIN_PASSWORD_ENV} must be set for a first deploy"))?;
    Ok(AdminCredentials {
        email,
        password: SecretString::from(password),
    })
}

/// Wait for a submitted run, persist its outcome, and render it.
///
/// # Errors
///
/// Returns the deployment's error when it failed.
pub(crate) async fn follow(app: &AppContext, task: DeploymentTask) -> Result<()> {
    tracing::debug!(deployment = task.id(), "following deployment");
    let outcome = {
        let _interrupt = InterruptGuard::new(task.cancellation());
        task.wait().await
    };

    app.inventory.update(|inv| {
        inv.put_app(outcome.app.clone());
        inv.record_deployment(outcome.record.clone());
        Ok(())
    })?;
    app.renderer().render_deployment(&outcome)?;
    match outcome.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
