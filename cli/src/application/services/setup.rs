//! Initial server setup.
//!
//! Runs as the privileged identity: creates the service account, installs its
//! keys and sudoers drop-in, installs packages, creates the managed
//! directories and optionally applies the firewall allow-list.

use std::sync::Arc;
use std::time::Duration;

use deployer_common::{Identity, ServerTarget, server_setup};

use crate::application::context::CallContext;
use crate::application::ports::{ProgressSink, RemoteExecutor};
use crate::application::services::StepEvents;
use crate::application::shell::RemoteShell;
use crate::application::task::{TaskHandle, spawn_operation};
use crate::domain::DeployError;
use crate::domain::RemoteCommand;
use crate::domain::security::{PortRule, firewall_commands};
use crate::domain::setup::{
    SUDOERS_PATH, SetupOptions, SetupStep, authorized_keys_path, create_user_command,
    install_packages_command, missing_packages_command, parse_missing_packages,
    prepare_ssh_dir_command, read_authorized_keys_command, render_sudoers,
    setup_directories_command, user_exists_command, validate_sudoers_command, validate_unix_name,
};
use crate::domain::ssh::{merge_authorized_keys, validate_public_key};

const PACKAGE_INSTALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Brings a fresh host to the state deploys expect.
#[derive(Clone)]
pub struct SetupManager {
    executor: Arc<dyn RemoteExecutor>,
    sink: Arc<dyn ProgressSink>,
    allowed_ports: Vec<PortRule>,
}

impl SetupManager {
    #[must_use]
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        sink: Arc<dyn ProgressSink>,
        allowed_ports: Vec<PortRule>,
    ) -> Self {
        Self {
            executor,
            sink,
            allowed_ports,
        }
    }

    /// Validate, then run setup in the background.
    ///
    /// The task yields the target with `setup_complete` set; persisting it is
    /// the caller's job.
    ///
    /// # Errors
    ///
    /// [`DeployError::Precondition`] if the target is already set up or locked
    /// down, [`DeployError::Validation`] for bad options. No remote call is
    /// made in either case.
    pub fn start(
        &self,
        target: ServerTarget,
        options: SetupOptions,
    ) -> Result<TaskHandle<Result<ServerTarget, DeployError>>, DeployError> {
        self.check(&target, &options)?;
        let this = self.clone();
        Ok(spawn_operation(None, move |ctx| async move {
            let mut target = target;
            this.run(&ctx, &mut target, &options).await.map(|()| target)
        }))
    }

    /// Run setup to completion on the current task.
    ///
    /// Progress is published on `server_setup_<id>`. On failure the returned
    /// error names the step and `target` is left unmarked.
    ///
    /// # Errors
    ///
    /// Precondition and validation errors as for [`SetupManager::start`], or
    /// the failing step's error wrapped in [`DeployError::Step`].
    pub async fn run(
        &self,
        ctx: &CallContext,
        target: &mut ServerTarget,
        options: &SetupOptions,
    ) -> Result<(), DeployError> {
        self.check(target, options)?;
        let events = StepEvents::new(Arc::clone(&self.sink), server_setup(&target.id));
        let shell = RemoteShell::new(self.executor.as_ref(), ctx, target, Identity::Privileged);

        tracing::info!(server = %target.label(), "starting server setup");
        let mut reached = 0;
        for step in SetupStep::plan(options.configure_firewall) {
            events.running(step.name(), describe(step), reached);
            let result = match step {
                SetupStep::Init => init(&shell).await,
                SetupStep::CreateUser => create_user(&shell, target, options).await,
                SetupStep::InstallPackages => install_packages(&shell, options).await,
                SetupStep::SetupDirectories => shell
                    .sudo(&setup_directories_command(&target.unprivileged_user))
                    .await
                    .map(drop),
                SetupStep::ConfigureFirewall => {
                    configure_firewall(&shell, &self.allowed_ports, target.port).await
                }
                SetupStep::Complete => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(server = %target.label(), step = step.name(), error = %e, "setup failed");
                events.failed(
                    step.name(),
                    format!("Setup failed at {}", step.name()),
                    &e,
                    reached,
                );
                return Err(e.at_step(step.name()));
            }
            reached = step.percent();
            events.success(step.name(), done(step), reached);
        }

        target.setup_complete = true;
        tracing::info!(server = %target.label(), "server setup complete");
        Ok(())
    }

    fn check(&self, target: &ServerTarget, options: &SetupOptions) -> Result<(), DeployError> {
        if target.setup_complete {
            return Err(DeployError::Precondition(format!(
                "server '{}' is already set up",
                target.label()
            )));
        }
        if target.security_locked {
            return Err(DeployError::Precondition(format!(
                "server '{}' is locked down; privileged login is disabled",
                target.label()
            )));
        }
        validate_unix_name(&target.unprivileged_user)?;
        options.validate()?;
        if options.configure_firewall {
            firewall_commands(&self.allowed_ports, target.port)?;
        }
        Ok(())
    }
}

fn describe(step: SetupStep) -> &'static str {
    match step {
        SetupStep::Init => "Checking privileged access",
        SetupStep::CreateUser => "Creating service account",
        SetupStep::InstallPackages => "Installing packages",
        SetupStep::SetupDirectories => "Creating application directories",
        SetupStep::ConfigureFirewall => "Configuring firewall",
        SetupStep::Complete => "Finishing",
    }
}

fn done(step: SetupStep) -> &'static str {
    match step {
        SetupStep::Init => "Privileged access confirmed",
        SetupStep::CreateUser => "Service account ready",
        SetupStep::InstallPackages => "Packages installed",
        SetupStep::SetupDirectories => "Application directories ready",
        SetupStep::ConfigureFirewall => "Firewall enabled",
        SetupStep::Complete => "Server setup complete",
    }
}

// ── Steps ─────────────────────────────────────────────────────────────────────

async fn init(shell: &RemoteShell<'_>) -> Result<(), DeployError> {
    shell.sudo("true").await?;
    let supported = shell
        .run(&RemoteCommand::new(
            "command -v apt-get >/dev/null && command -v systemctl >/dev/null",
        ))
        .await?
        .success();
    if !supported {
        return Err(DeployError::Precondition(
            "host must be Debian or Ubuntu with systemd (apt-get and systemctl not found)"
                .to_string(),
        ));
    }
    Ok(())
}

async fn create_user(
    shell: &RemoteShell<'_>,
    target: &ServerTarget,
    options: &SetupOptions,
) -> Result<(), DeployError> {
    let user = target.unprivileged_user.as_str();
    if shell.sudo_succeeds(&user_exists_command(user)).await? {
        tracing::debug!(user, "service account already exists");
    } else {
        shell.sudo(&create_user_command(user)).await?;
    }

    let keys = authorized_keys_for(shell, options).await?;
    if keys.is_empty() {
        tracing::warn!(user, "no public keys to install; key login for the service account may fail");
    } else {
        shell.sudo(&prepare_ssh_dir_command(user)).await?;
        let existing = shell.sudo(&read_authorized_keys_command(user)).await?.stdout;
        let merged = merge_authorized_keys(&existing, &keys);
        shell
            .write_file(&authorized_keys_path(user), merged.as_bytes(), 0o600, Some(user))
            .await?;
    }

    shell
        .write_file_validated(
            SUDOERS_PATH,
            render_sudoers(user).as_bytes(),
            0o440,
            None,
            Some(&validate_sudoers_command),
        )
        .await
}

/// Keys from the options, or else the keys the privileged login already trusts.
async fn authorized_keys_for(
    shell: &RemoteShell<'_>,
    options: &SetupOptions,
) -> Result<Vec<String>, DeployError> {
    if !options.public_keys.is_empty() {
        return Ok(options.public_keys.clone());
    }
    let own = shell
        .run(&RemoteCommand::new("cat ~/.ssh/authorized_keys 2>/dev/null || true"))
        .await?
        .stdout;
    Ok(own
        .lines()
        .map(str::trim)
        .filter(|l| validate_public_key(l).is_ok())
        .map(ToString::to_string)
        .collect())
}

async fn install_packages(shell: &RemoteShell<'_>, options: &SetupOptions) -> Result<(), DeployError> {
    if options.packages.is_empty() {
        return Ok(());
    }
    let missing = parse_missing_packages(
        &shell
            .sudo(&missing_packages_command(&options.packages))
            .await?
            .stdout,
    );
    if missing.is_empty() {
        tracing::debug!("all packages already installed");
        return Ok(());
    }
    tracing::info!(packages = %missing.join(" "), "installing packages");
    shell
        .run_checked(
            &RemoteCommand::new(install_packages_command(&missing))
                .sudo()
                .timeout(PACKAGE_INSTALL_TIMEOUT),
        )
        .await
        .map(drop)
}

pub(crate) async fn configure_firewall(
    shell: &RemoteShell<'_>,
    rules: &[PortRule],
    ssh_port: u16,
) -> Result<(), DeployError> {
    for cmd in firewall_commands(rules, ssh_port)? {
        shell.sudo(&cmd).await?;
    }
    Ok(())
}
