//! CLI argument parsing with clap derive

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::app::{AppContext, AppFlags, BehaviourFlags, OutputFlags};
use crate::commands;

/// Provision, harden and deploy PocketBase apps over SSH
#[derive(Parser)]
#[command(
    name = "pbdeploy",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log debug details to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer yes to confirmation prompts
    #[arg(short, long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Prepare a fresh server: service account, packages, directories
    Setup(commands::setup::SetupArgs),

    /// Harden a server: key-only SSH, no root login, firewall, fail2ban
    Lockdown(commands::lockdown::LockdownArgs),

    /// Deploy a release archive
    Deploy(commands::deploy::DeployArgs),

    /// Redeploy an earlier version
    Rollback(commands::rollback::RollbackArgs),

    /// Control an application's service
    Service(commands::service::ServiceArgs),

    /// Diagnose connection problems
    Doctor(commands::doctor::DoctorArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn run(self) -> Result<ExitCode> {
        let Cli {
            json,
            quiet,
            no_color,
            verbose: _,
            yes,
            command,
        } = self;
        let app = AppContext::new(&AppFlags {
            output: OutputFlags {
                no_color,
                quiet,
                json,
            },
            behaviour: BehaviourFlags { yes },
        })?;

        match command {
            Command::Setup(args) => commands::setup::run(&app, args).await?,
            Command::Lockdown(args) => commands::lockdown::run(&app, args).await?,
            Command::Deploy(args) => commands::deploy::run(&app, args).await?,
            Command::Rollback(args) => commands::rollback::run(&app, args).await?,
            Command::Service(args) => commands::service::run(&app, args).await?,
            Command::Doctor(args) => return commands::doctor::run(&app, args).await,
            Command::Config(cmd) => commands::config::run(&app, cmd)?,
            Command::Version => commands::version::run(&app)?,
        }
        Ok(ExitCode::SUCCESS)
    }
}
