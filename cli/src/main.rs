//! pbdeploy - agentless SSH provisioning and deployment for PocketBase apps

use std::process::ExitCode;

use clap::Parser;
use pb_deployer::cli::Cli;
use pb_deployer::domain::DeployError;
use pb_deployer::output::json::format_error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json = cli.json;

    match cli.run().await {
        Ok(code) => code,
        Err(e) => {
            let code = e
                .downcast_ref::<DeployError>()
                .map_or("error", |d| d.kind().as_str());
            match format_error(&format!("{e:#}"), code) {
                Ok(obj) if json => println!("{obj}"),
                _ => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise `warn`, or `debug` for this crate with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "warn,pb_deployer=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}
