//! The deployer's own known_hosts file (`~/.pb-deployer/known_hosts`).
//!
//! Kept apart from `~/.ssh/known_hosts` so the deployer never rewrites the
//! user's OpenSSH state.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::domain::DeployError;
use crate::domain::ssh::{HostKeyStatus, check_host_key, format_known_host, host_pattern};

pub struct KnownHostsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl KnownHostsStore {
    /// Store at `~/.pb-deployer/known_hosts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self, DeployError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DeployError::Precondition("cannot determine home directory".into()))?;
        Ok(Self::with_path(home.join(".pb-deployer").join("known_hosts")))
    }

    /// Store at an arbitrary path (config override, tests).
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look `presented` up for `host:port`. A missing file means `Unknown`.
    #[must_use]
    pub fn check(&self, host: &str, port: u16, presented: &str) -> HostKeyStatus {
        check_host_key(&self.read(), host, port, presented)
    }

    /// Whether any key is recorded for `host:port`.
    #[must_use]
    pub fn contains(&self, host: &str, port: u16) -> bool {
        let pattern = host_pattern(host, port);
        self.read().lines().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|hosts| hosts.split(',').any(|h| h == pattern))
        })
    }

    /// Append a line for `host:port`. Creates the file (0600) and its
    /// directory (0700) as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn record(&self, host: &str, port: u16, key: &str) -> Result<(), DeployError> {
        let _guard = self.write_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut content = self.read();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format_known_host(host, port, key));
        content.push('\n');
        self.write(&content)
    }

    fn read(&self) -> String {
        std::fs::read_to_string(&self.path).unwrap_or_default()
    }

    fn write(&self, content: &str) -> Result<(), DeployError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DeployError::io(format!("create dir {}", parent.display()), e))?;
            set_permissions(parent, 0o700)?;
        }
        std::fs::write(&self.path, content)
            .map_err(|e| DeployError::io(format!("write {}", self.path.display()), e))?;
        set_permissions(&self.path, 0o600)
    }
}

#[cfg(unix)]
pub(crate) fn set_permissions(path: &Path, mode: u32) -> Result<(), DeployError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| DeployError::io(format!("set permissions on {}", path.display()), e))
}

#[cfg(not(unix))]
pub(crate) fn set_permissions(_path: &Path, _mode: u32) -> Result<(), DeployError> {
    Ok(())
}
