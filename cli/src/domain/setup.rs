//! Server setup steps and the shell they run.
//!
//! Every command here is safe to re-run: existing accounts, installed
//! packages and present directories are left alone.

use crate::domain::command::shell_quote;
use crate::domain::error::DeployError;

/// Base directory for all managed applications.
pub const BASE_DIR: &str = "/opt/pocketbase";

/// Directories created (if absent) and owned by the service account.
pub const MANAGED_DIRS: &[&str] = &[
    "/opt/pocketbase",
    "/opt/pocketbase/apps",
    "/opt/pocketbase/backups",
    "/opt/pocketbase/logs",
];

pub const DEFAULT_PACKAGES: &[&str] = &[
    "curl",
    "wget",
    "unzip",
    "tar",
    "ufw",
    "fail2ban",
    "ca-certificates",
];

/// Sudoers drop-in written for the service account.
pub const SUDOERS_PATH: &str = "/etc/sudoers.d/pb-deployer";

// ── Steps ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Init,
    CreateUser,
    InstallPackages,
    SetupDirectories,
    ConfigureFirewall,
    Complete,
}

impl SetupStep {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CreateUser => "create_user",
            Self::InstallPackages => "install_packages",
            Self::SetupDirectories => "setup_directories",
            Self::ConfigureFirewall => "configure_firewall",
            Self::Complete => "complete",
        }
    }

    /// Progress reached once this step has finished.
    #[must_use]
    pub fn percent(self) -> u8 {
        match self {
            Self::Init => 5,
            Self::CreateUser => 25,
            Self::InstallPackages => 60,
            Self::SetupDirectories => 80,
            Self::ConfigureFirewall => 95,
            Self::Complete => 100,
        }
    }

    /// Steps in execution order; the firewall step only when requested.
    #[must_use]
    pub fn plan(configure_firewall: bool) -> Vec<Self> {
        let mut steps = vec![
            Self::Init,
            Self::CreateUser,
            Self::InstallPackages,
            Self::SetupDirectories,
        ];
        if configure_firewall {
            steps.push(Self::ConfigureFirewall);
        }
        steps.push(Self::Complete);
        steps
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Caller inputs for a setup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOptions {
    /// OpenSSH public keys installed for the service account.
    pub public_keys: Vec<String>,
    pub configure_firewall: bool,
    pub packages: Vec<String>,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            public_keys: Vec::new(),
            configure_firewall: false,
            packages: DEFAULT_PACKAGES.iter().map(ToString::to_string).collect(),
        }
    }
}

impl SetupOptions {
    /// # Errors
    ///
    /// Returns [`DeployError::Validation`] for malformed keys or package names.
    pub fn validate(&self) -> Result<(), DeployError> {
        for key in &self.public_keys {
            crate::domain::ssh::validate_public_key(key)?;
        }
        for package in &self.packages {
            validate_package_name(package)?;
        }
        Ok(())
    }
}

// ── Validators ────────────────────────────────────────────────────────────────

/// Unix account names: `^[a-z_][a-z0-9_-]{0,31}$`.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if the name does not match.
pub fn validate_unix_name(name: &str) -> Result<(), DeployError> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !first_ok || !rest_ok || name.len() > 32 {
        return Err(DeployError::Validation(format!(
            "invalid user name '{name}': must match ^[a-z_][a-z0-9_-]{{0,31}}$"
        )));
    }
    Ok(())
}

/// Debian package names: lowercase alphanumerics plus `+ - .`, at least two chars.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if the name does not match.
pub fn validate_package_name(name: &str) -> Result<(), DeployError> {
    let valid = name.len() >= 2
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c));
    if !valid {
        return Err(DeployError::Validation(format!(
            "invalid package name '{name}'"
        )));
    }
    Ok(())
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Exits 0 when the account exists.
#[must_use]
pub fn user_exists_command(user: &str) -> String {
    format!("id -u {}", shell_quote(user))
}

#[must_use]
pub fn create_user_command(user: &str) -> String {
    format!("useradd --create-home --shell /bin/bash {}", shell_quote(user))
}

#[must_use]
pub fn home_dir(user: &str) -> String {
    format!("/home/{user}")
}

#[must_use]
pub fn authorized_keys_path(user: &str) -> String {
    format!("{}/.ssh/authorized_keys", home_dir(user))
}

/// Prints the current `authorized_keys`, or nothing if absent.
#[must_use]
pub fn read_authorized_keys_command(user: &str) -> String {
    format!(
        "cat {} 2>/dev/null || true",
        shell_quote(&authorized_keys_path(user))
    )
}

/// Ensures `~/.ssh` exists with 0700 and belongs to the account.
#[must_use]
pub fn prepare_ssh_dir_command(user: &str) -> String {
    let dir = shell_quote(&format!("{}/.ssh", home_dir(user)));
    let u = shell_quote(user);
    format!("install -d -m 700 -o {u} -g {u} {dir}")
}

/// Sudoers drop-in granting the service account password-less sudo, so it
/// can operate services and deploys once root login is disabled.
#[must_use]
pub fn render_sudoers(user: &str) -> String {
    format!(
        "# Managed by pb-deployer. Do not edit.\n\
         {user} ALL=(ALL) NOPASSWD: ALL\n"
    )
}

/// Validates a sudoers candidate file with `visudo`.
#[must_use]
pub fn validate_sudoers_command(path: &str) -> String {
    format!("visudo -cf {}", shell_quote(path))
}

/// Prints every package from `packages` that is not installed, one per line.
#[must_use]
pub fn missing_packages_command(packages: &[String]) -> String {
    let list = packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "for p in {list}; do dpkg -s \"$p\" >/dev/null 2>&1 || echo \"$p\"; done"
    )
}

#[must_use]
pub fn parse_missing_packages(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[must_use]
pub fn install_packages_command(packages: &[String]) -> String {
    let list = packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "export DEBIAN_FRONTEND=noninteractive && apt-get update -qq && \
         apt-get install -y -qq --no-install-recommends {list}"
    )
}

/// `mkdir -p` plus ownership for [`MANAGED_DIRS`].
#[must_use]
pub fn setup_directories_command(user: &str) -> String {
    let dirs = MANAGED_DIRS
        .iter()
        .map(|d| shell_quote(d))
        .collect::<Vec<_>>()
        .join(" ");
    let owner = shell_quote(&format!("{user}:{user}"));
    format!("mkdir -p {dirs} && chown {owner} {dirs} && chmod 755 {dirs}")
}

/// Prints every directory from [`MANAGED_DIRS`] that is missing.
#[must_use]
pub fn missing_directories_command() -> String {
    let dirs = MANAGED_DIRS
        .iter()
        .map(|d| shell_quote(d))
        .collect::<Vec<_>>()
        .join(" ");
    format!("for d in {dirs}; do [ -d \"$d\" ] || echo \"$d\"; done")
}
