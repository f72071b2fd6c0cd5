//! Security lockdown.
//!
//! Lockdown disables password and root login, replaces the firewall rules
//! with the allow-list and installs the ban policy. It is one-way: once the
//! target is marked locked, the privileged identity is never used again.
//!
//! Every step after `verify_access` changes the host, so a failure names
//! the step and the steps already applied.

use std::sync::Arc;

use chrono::Utc;
use deployer_common::{Identity, ServerTarget, server_security};

use crate::application::context::CallContext;
use crate::application::ports::{ProgressSink, RemoteExecutor};
use crate::application::services::StepEvents;
use crate::application::services::setup::configure_firewall;
use crate::application::shell::RemoteShell;
use crate::application::task::{TaskHandle, spawn_operation};
use crate::domain::DeployError;
use crate::domain::command::shell_quote;
use crate::domain::config::SecurityConfig;
use crate::domain::security::{
    HARDENED_SSHD_OPTIONS, JAIL_LOCAL, LockdownStep, SSHD_CONFIG, SSHD_DROP_IN, SSHD_DROP_IN_DIR,
    backup_path, effective_sshd_mismatches, firewall_commands, harden_sshd_config,
    parse_ufw_allowed, reload_sshd_command, render_sshd_drop_in, validate_sshd_command,
};

const PASSWORD_OPTIONS: &[(&str, &str)] = &[
    ("PasswordAuthentication", "no"),
    ("KbdInteractiveAuthentication", "no"),
    ("PubkeyAuthentication", "yes"),
];

const ROOT_LOGIN_OPTIONS: &[(&str, &str)] = &[("PermitRootLogin", "no")];

/// Hardens a set-up host.
#[derive(Clone)]
pub struct SecurityManager {
    executor: Arc<dyn RemoteExecutor>,
    sink: Arc<dyn ProgressSink>,
    settings: SecurityConfig,
}

impl SecurityManager {
    #[must_use]
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        sink: Arc<dyn ProgressSink>,
        settings: SecurityConfig,
    ) -> Self {
        Self {
            executor,
            sink,
            settings,
        }
    }

    /// Validate, then run lockdown in the background. The task yields the
    /// target with `security_locked` set.
    ///
    /// # Errors
    ///
    /// [`DeployError::Precondition`] if the target is already locked or not
    /// set up, [`DeployError::Validation`] for a bad allow-list or ban policy.
    /// No remote call is made in either case.
    pub fn start(
        &self,
        target: ServerTarget,
    ) -> Result<TaskHandle<Result<ServerTarget, DeployError>>, DeployError> {
        self.check(&target)?;
        let this = self.clone();
        Ok(spawn_operation(None, move |ctx| async move {
            let mut target = target;
            this.run(&ctx, &mut target).await.map(|()| target)
        }))
    }

    /// Run lockdown on the current task, publishing on `server_security_<id>`.
    ///
    /// # Errors
    ///
    /// As for [`SecurityManager::start`], or the failing step's error wrapped
    /// in [`DeployError::Step`].
    pub async fn run(&self, ctx: &CallContext, target: &mut ServerTarget) -> Result<(), DeployError> {
        self.check(target)?;
        let events = StepEvents::new(Arc::clone(&self.sink), server_security(&target.id));
        let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();

        tracing::info!(server = %target.label(), "starting security lockdown");
        let mut applied: Vec<&'static str> = Vec::new();
        let mut reached = 0;
        for step in LockdownStep::ALL {
            events.running(step.name(), describe(step), reached);
            let result = self.run_step(ctx, target, step, &stamp).await;
            if let Err(e) = result {
                let message = if applied.is_empty() {
                    format!("Lockdown failed at {}; the host was not changed", step.name())
                } else {
                    format!(
                        "Lockdown failed at {}; already applied: {}",
                        step.name(),
                        applied.join(", ")
                    )
                };
                tracing::warn!(server = %target.label(), step = step.name(), error = %e, "{message}");
                events.failed(step.name(), message, &e, reached);
                return Err(e.at_step(step.name()));
            }
            if step.mutates_host() && step != LockdownStep::Complete {
                applied.push(step.name());
            }
            reached = step.percent();
            events.success(step.name(), done(step), reached);
        }

        target.security_locked = true;
        self.executor.forget(target, Identity::Privileged).await;
        tracing::info!(server = %target.label(), "security lockdown complete");
        Ok(())
    }

    async fn run_step(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        step: LockdownStep,
        stamp: &str,
    ) -> Result<(), DeployError> {
        let privileged = RemoteShell::new(self.executor.as_ref(), ctx, target, Identity::Privileged);
        // Root login is gone after disable_root_login; later steps use the
        // service account, whose key and sudo were proven in verify_access.
        let operator = RemoteShell::new(self.executor.as_ref(), ctx, target, Identity::Unprivileged);
        match step {
            LockdownStep::Init => privileged.sudo("true").await.map(drop),
            LockdownStep::VerifyAccess => verify_access(&operator).await,
            LockdownStep::DisablePasswordAuth => {
                apply_sshd_options(&privileged, PASSWORD_OPTIONS, PASSWORD_OPTIONS, stamp).await
            }
            LockdownStep::DisableRootLogin => {
                apply_sshd_options(&privileged, ROOT_LOGIN_OPTIONS, HARDENED_SSHD_OPTIONS, stamp)
                    .await
            }
            LockdownStep::ConfigureFirewall => {
                configure_firewall(&operator, &self.settings.allowed_ports, target.port).await
            }
            LockdownStep::InstallBanPolicy => {
                operator
                    .write_file(JAIL_LOCAL, self.settings.ban.render().as_bytes(), 0o644, None)
                    .await?;
                operator
                    .sudo("systemctl enable fail2ban && systemctl restart fail2ban")
                    .await
                    .map(drop)
            }
            LockdownStep::Verify => self.verify(&operator).await,
            LockdownStep::Complete => Ok(()),
        }
    }

    async fn verify(&self, shell: &RemoteShell<'_>) -> Result<(), DeployError> {
        let effective = shell.sudo("sshd -T").await?.stdout;
        let mismatches = effective_sshd_mismatches(&effective, HARDENED_SSHD_OPTIONS);
        if !mismatches.is_empty() {
            return Err(verification_failure("sshd -T", &mismatches.join(", ")));
        }

        let status = shell.sudo("ufw status").await?.stdout;
        if !status.contains("Status: active") {
            return Err(verification_failure("ufw status", "firewall is not active"));
        }
        let allowed = parse_ufw_allowed(&status);
        let missing: Vec<String> = self
            .settings
            .allowed_ports
            .iter()
            .map(ToString::to_string)
            .filter(|rule| !allowed.contains(rule))
            .collect();
        if !missing.is_empty() {
            return Err(verification_failure(
                "ufw status",
                &format!("missing allow rules: {}", missing.join(", ")),
            ));
        }

        if !shell.sudo_succeeds("systemctl is-active --quiet fail2ban").await? {
            return Err(verification_failure("systemctl is-active fail2ban", "fail2ban is not running"));
        }
        Ok(())
    }

    fn check(&self, target: &ServerTarget) -> Result<(), DeployError> {
        if target.security_locked {
            return Err(DeployError::Precondition(format!(
                "server '{}' is already locked down",
                target.label()
            )));
        }
        if !target.setup_complete {
            return Err(DeployError::Precondition(format!(
                "server '{}' must be set up before lockdown",
                target.label()
            )));
        }
        firewall_commands(&self.settings.allowed_ports, target.port)?;
        self.settings.ban.validate()
    }
}

fn describe(step: LockdownStep) -> &'static str {
    match step {
        LockdownStep::Init => "Checking privileged access",
        LockdownStep::VerifyAccess => "Checking service account login and sudo",
        LockdownStep::DisablePasswordAuth => "Disabling password authentication",
        LockdownStep::DisableRootLogin => "Disabling root login",
        LockdownStep::ConfigureFirewall => "Applying firewall allow-list",
        LockdownStep::InstallBanPolicy => "Installing ban policy",
        LockdownStep::Verify => "Verifying effective configuration",
        LockdownStep::Complete => "Finishing",
    }
}

fn done(step: LockdownStep) -> &'static str {
    match step {
        LockdownStep::Init => "Privileged access confirmed",
        LockdownStep::VerifyAccess => "Service account can log in and use sudo",
        LockdownStep::DisablePasswordAuth => "Password authentication disabled",
        LockdownStep::DisableRootLogin => "Root login disabled",
        LockdownStep::ConfigureFirewall => "Firewall enabled",
        LockdownStep::InstallBanPolicy => "Ban policy active",
        LockdownStep::Verify => "Effective configuration verified",
        LockdownStep::Complete => "Security lockdown complete",
    }
}

fn verification_failure(command: &str, detail: &str) -> DeployError {
    DeployError::RemoteCommand {
        command: command.to_string(),
        exit_code: 1,
        stderr: detail.to_string(),
    }
}

// ── Steps ─────────────────────────────────────────────────────────────────────

/// Lockdown must not strand the host: the service account has to log in with
/// its key and use sudo before anything is changed.
async fn verify_access(shell: &RemoteShell<'_>) -> Result<(), DeployError> {
    shell.sudo("true").await.map(drop).map_err(|e| {
        DeployError::Precondition(format!(
            "service account '{}' cannot log in and use sudo ({e}); re-run setup with its public key",
            shell.username()
        ))
    })
}

/// Set `options` in the main sshd config and write `drop_in` as the
/// managed drop-in, validating with `sshd -t` before sshd is reloaded.
async fn apply_sshd_options(
    shell: &RemoteShell<'_>,
    options: &[(&str, &str)],
    drop_in: &[(&str, &str)],
    stamp: &str,
) -> Result<(), DeployError> {
    let current = shell.read_file(SSHD_CONFIG).await?;
    let backup = backup_path(SSHD_CONFIG, stamp);
    if !shell.file_exists(&backup).await? {
        shell
            .sudo(&format!(
                "cp -p {} {}",
                shell_quote(SSHD_CONFIG),
                shell_quote(&backup)
            ))
            .await?;
    }

    let hardened = harden_sshd_config(&current, options);
    if hardened != current {
        shell
            .write_file_validated(
                SSHD_CONFIG,
                hardened.as_bytes(),
                0o644,
                None,
                Some(&validate_sshd_command),
            )
            .await?;
    }

    // Drop-ins are read first and the first value wins, so ours must
    // override cloud-init's PasswordAuthentication as well.
    if shell.file_exists(SSHD_DROP_IN_DIR).await? {
        shell
            .write_file(SSHD_DROP_IN, render_sshd_drop_in(drop_in).as_bytes(), 0o644, None)
            .await?;
        if let Err(e) = shell.sudo("sshd -t").await {
            if let Err(cleanup) = shell.sudo(&format!("rm -f {}", shell_quote(SSHD_DROP_IN))).await {
                tracing::warn!(error = %cleanup, path = SSHD_DROP_IN, "could not remove rejected sshd drop-in");
            }
            return Err(e);
        }
    }

    shell.sudo(reload_sshd_command()).await.map(drop)
}
