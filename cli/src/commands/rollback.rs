//! `pbdeploy rollback`: redeploy an earlier recorded version.

use anyhow::Result;
use clap::Args;

use crate::app::{AppContext, read_file};
use crate::application::services::DeployRequest;
use crate::commands::deploy::follow;
use crate::commands::with_engine;

#[derive(Args)]
pub struct RollbackArgs {
    /// Application id or name from the inventory
    pub app: String,

    /// Version label to return to
    pub label: String,
}

/// Run `pbdeploy rollback`.
///
/// # Errors
///
/// Returns an error if the version is unknown, its archive is gone, or the
/// rollback deployment fails.
pub async fn run(app: &AppContext, args: RollbackArgs) -> Result<()> {
    let inventory = app.inventory.load()?;
    let managed = inventory.app(&args.app)?.clone();
    let target = inventory.server(&managed.server_id)?.clone();
    let version = inventory.version(&managed.id, &args.label)?.clone();
    let artifact = read_file(&version.artifact_path)?;

    if managed.current_version.as_deref() == Some(version.label.as_str()) {
        app.output
            .warn(&format!("{} is already on {}; redeploying it", managed.name, version.label));
    }
    app.output.header(&format!(
        "Rolling {} back to {} on {}",
        managed.name,
        version.label,
        target.label()
    ));
    with_engine(app, async |engine| {
        let task = engine.pipeline.rollback(DeployRequest {
            target,
            app: managed,
            version,
            artifact,
            first_deploy: false,
            credentials: None,
        })?;
        follow(app, task).await
    })
    .await
}
