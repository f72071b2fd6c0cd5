//! Deployment pipeline steps, remote command builders and outcome rules.

use deployer_common::{AppStatus, ManagedApplication};

use crate::domain::artifact::MANAGED_ENTRIES;
use crate::domain::command::shell_quote;
use crate::domain::error::DeployError;
use crate::domain::service::APP_BINARY;

// ── Steps ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStep {
    Init,
    Backup,
    StopService,
    Transfer,
    InstallService,
    BootstrapAdmin,
    StartService,
    HealthCheck,
    SoftRollback,
    Complete,
}

impl DeployStep {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Backup => "backup",
            Self::StopService => "stop_service",
            Self::Transfer => "transfer",
            Self::InstallService => "install_service",
            Self::BootstrapAdmin => "bootstrap_admin",
            Self::StartService => "start_service",
            Self::HealthCheck => "health_check",
            Self::SoftRollback => "soft_rollback",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn percent(self) -> u8 {
        match self {
            Self::Init => 5,
            Self::Backup => 15,
            Self::StopService => 25,
            Self::Transfer => 50,
            Self::InstallService => 60,
            Self::BootstrapAdmin => 70,
            Self::StartService => 80,
            Self::HealthCheck => 95,
            Self::SoftRollback | Self::Complete => 100,
        }
    }

    /// Steps of a forward run in execution order.
    #[must_use]
    pub fn plan(first_deploy: bool) -> Vec<Self> {
        if first_deploy {
            vec![
                Self::Init,
                Self::Transfer,
                Self::InstallService,
                Self::BootstrapAdmin,
                Self::StartService,
                Self::HealthCheck,
                Self::Complete,
            ]
        } else {
            vec![
                Self::Init,
                Self::Backup,
                Self::StopService,
                Self::Transfer,
                Self::StartService,
                Self::HealthCheck,
                Self::Complete,
            ]
        }
    }

    /// A failure here triggers the automatic soft rollback (when a backup exists).
    ///
    /// Anything before the transfer leaves the installed files untouched, so
    /// restarting the old service is enough.
    #[must_use]
    pub fn triggers_soft_rollback(self) -> bool {
        matches!(
            self,
            Self::Transfer
                | Self::InstallService
                | Self::BootstrapAdmin
                | Self::StartService
                | Self::HealthCheck
        )
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Install paths must be absolute, normalized and live under the managed base dir.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] otherwise.
pub fn validate_install_path(path: &str) -> Result<(), DeployError> {
    let ok = path.starts_with(crate::domain::setup::BASE_DIR)
        && path.len() > crate::domain::setup::BASE_DIR.len() + 1
        && !path.split('/').any(|c| c == ".." || c == ".")
        && !path.contains("//")
        && !path.ends_with('/')
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/_.-".contains(c));
    if !ok {
        return Err(DeployError::Validation(format!(
            "install path '{path}' must be a normalized directory under {}",
            crate::domain::setup::BASE_DIR
        )));
    }
    Ok(())
}

/// Version labels must be semantic versions (`1.2.0`, `2.0.0-rc.1`).
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if `label` does not parse.
pub fn validate_version_label(label: &str) -> Result<semver::Version, DeployError> {
    semver::Version::parse(label.trim_start_matches('v')).map_err(|e| {
        DeployError::Validation(format!("version '{label}' is not a semantic version: {e}"))
    })
}

/// Bootstrap admin e-mail: one `@`, non-empty local part and a dotted domain.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] otherwise.
pub fn validate_admin_email(email: &str) -> Result<(), DeployError> {
    let valid = email.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty()
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
            && !email.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"')
            && !domain.contains('@')
    });
    if !valid {
        return Err(DeployError::Validation(format!(
            "'{email}' is not a valid admin e-mail"
        )));
    }
    Ok(())
}

/// PocketBase requires superuser passwords of at least 8 characters.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if the password is too short.
pub fn validate_admin_password(password: &str) -> Result<(), DeployError> {
    if password.chars().count() < 8 {
        return Err(DeployError::Validation(
            "admin password must be at least 8 characters".to_string(),
        ));
    }
    Ok(())
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Remote scratch path for an upload or backup archive.
#[must_use]
pub fn staging_path(id: &str, suffix: &str) -> String {
    format!("/tmp/pbdeploy-{id}{suffix}")
}

/// Archive the managed entries that exist in `install_path` into `archive`.
/// Prints `empty` and creates nothing when there is nothing to back up.
#[must_use]
pub fn backup_command(install_path: &str, archive: &str) -> String {
    let names = MANAGED_ENTRIES.join(" ");
    format!(
        "cd {dir} && set -- && for e in {names}; do [ -e \"$e\" ] && set -- \"$@\" \"$e\"; done; \
         if [ $# -eq 0 ]; then echo empty; else tar -czf {archive} \"$@\" && chmod 644 {archive}; fi",
        dir = shell_quote(install_path),
        archive = shell_quote(archive),
    )
}

/// Replace the managed entries in `install_path` with the contents of
/// `archive`, leaving `pb_data` alone, then hand ownership to `user`.
#[must_use]
pub fn extract_command(install_path: &str, archive: &str, user: &str) -> String {
    let dir = shell_quote(install_path);
    let removals = MANAGED_ENTRIES
        .iter()
        .map(|e| shell_quote(&format!("{install_path}/{e}")))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "mkdir -p {dir} && rm -rf {removals} && tar -xzf {archive} -C {dir} --no-same-owner && \
         chmod 755 {binary} && chown -R {owner} {dir} && rm -f {archive}",
        archive = shell_quote(archive),
        binary = shell_quote(&format!("{install_path}/{APP_BINARY}")),
        owner = shell_quote(&format!("{user}:{user}")),
    )
}

/// Create or update the PocketBase superuser, running as the service account
/// so `pb_data` keeps the right owner. The password is read from
/// `password_file`, which is removed whatever the outcome.
#[must_use]
pub fn bootstrap_admin_command(install_path: &str, user: &str, email: &str, password_file: &str) -> String {
    format!(
        "cd {dir} && runuser -u {user} -- ./{APP_BINARY} superuser upsert {email} \"$(cat {secret})\" --dir {data}; \
         status=$?; rm -f {secret}; exit $status",
        dir = shell_quote(install_path),
        user = shell_quote(user),
        email = shell_quote(email),
        secret = shell_quote(password_file),
        data = shell_quote(&format!("{install_path}/pb_data")),
    )
}

#[must_use]
pub fn daemon_reload_enable_command(service: &str) -> String {
    format!("systemctl daemon-reload && systemctl enable {}", shell_quote(service))
}

/// Health URL for `domain`; `https://` is assumed when no scheme is given.
#[must_use]
pub fn health_url(domain: &str, path: &str) -> String {
    let base = domain.trim_end_matches('/');
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}{path}")
    } else {
        format!("https://{base}{path}")
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

/// Apply a finished run to the application record.
///
/// Success advances `current_version` and marks the app online. Failure leaves
/// the version alone and sets the status from `healthy_after`, the result of
/// the last health check (after the soft rollback, if one ran). `None` means
/// the run failed before the service was touched, so the status is kept.
pub fn apply_outcome(
    app: &mut ManagedApplication,
    success: bool,
    version_label: &str,
    healthy_after: Option<bool>,
) {
    if success {
        app.current_version = Some(version_label.to_string());
        app.status = AppStatus::Online;
        return;
    }
    match healthy_after {
        Some(true) => app.status = AppStatus::Online,
        Some(false) => app.status = AppStatus::Offline,
        None => {}
    }
}
