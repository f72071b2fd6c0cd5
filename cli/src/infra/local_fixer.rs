//! `LocalFixer`: key-file permissions and host-key acceptance on this machine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::application::ports::LocalFixer;
use crate::domain::DeployError;
use crate::domain::ssh::HostKeyStatus;
use crate::infra::known_hosts::{KnownHostsStore, set_permissions};
use crate::infra::transport::SshConnector;

pub struct SshLocalFixer {
    connector: Arc<SshConnector>,
    scan_timeout: Duration,
}

impl SshLocalFixer {
    #[must_use]
    pub fn new(connector: Arc<SshConnector>, scan_timeout: Duration) -> Self {
        Self {
            connector,
            scan_timeout,
        }
    }

    fn known_hosts(&self) -> &KnownHostsStore {
        self.connector.known_hosts()
    }
}

#[async_trait]
impl LocalFixer for SshLocalFixer {
    async fn file_mode(&self, path: &Path) -> Option<u32> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        Some(mode_bits(&meta))
    }

    async fn set_file_mode(&self, path: &Path, mode: u32) -> Result<(), DeployError> {
        set_permissions(path, mode)?;
        tracing::info!(path = %path.display(), mode = format!("{mode:o}"), "changed key file mode");
        Ok(())
    }

    async fn host_key_known(&self, host: &str, port: u16) -> bool {
        self.known_hosts().contains(host, port)
    }

    /// Records the presented key if none is stored. A stored key that
    /// differs is never replaced here.
    async fn accept_host_key(&self, host: &str, port: u16) -> Result<String, DeployError> {
        let presented = self
            .connector
            .scan_host_key(host, port, self.scan_timeout)
            .await?;
        match self.known_hosts().check(host, port, &presented) {
            HostKeyStatus::Trusted => Ok(presented),
            HostKeyStatus::Changed { .. } => Err(DeployError::Precondition(format!(
                "host key for {host}:{port} differs from the recorded one; \
                 verify the server and remove the old entry from {} by hand",
                self.known_hosts().path().display()
            ))),
            HostKeyStatus::Unknown => {
                self.known_hosts().record(host, port, &presented)?;
                tracing::info!(host, port, "accepted host key");
                Ok(presented)
            }
        }
    }
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_bits(_meta: &std::fs::Metadata) -> u32 {
    0o600
}
