//! `pbdeploy doctor`: connection diagnostics with optional auto-fix.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::application::CallContext;
use crate::commands::{InterruptGuard, with_engine};
use crate::domain::diagnostics::Overall;

#[derive(Args)]
pub struct DoctorArgs {
    /// Server id or name from the inventory
    pub server: String,

    /// Apply safe fixes (key permissions, host key, directories) and re-check
    #[arg(long)]
    pub fix: bool,
}

/// Run `pbdeploy doctor`. Exits 1 when a check failed.
///
/// # Errors
///
/// Returns an error if the server is unknown or output fails.
pub async fn run(app: &AppContext, args: DoctorArgs) -> Result<ExitCode> {
    let target = app.inventory.load()?.server(&args.server)?.clone();
    app.output.header(&format!("Diagnosing {}", target.label()));

    let overall = with_engine(app, async |engine| {
        let ctx = CallContext::new();
        let _interrupt = InterruptGuard::new(ctx.token().clone());
        if args.fix {
            let outcome = engine.diagnostics.auto_fix(&ctx, &target).await;
            app.renderer().render_fix(&outcome)?;
            Ok(outcome.after.overall)
        } else {
            let report = engine.diagnostics.diagnose(&ctx, &target).await;
            app.renderer().render_report(&report)?;
            if !report.safe_remediations().is_empty() {
                app.output.info(&format!("Run: pbdeploy doctor {} --fix", args.server));
            }
            Ok(report.overall)
        }
    })
    .await?;

    Ok(if overall == Overall::Error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
