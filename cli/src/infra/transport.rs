//! russh-backed implementation of the `SessionConnector` and `RemoteSession` ports.
//!
//! Commands run on a fresh exec channel each; files move over an SFTP
//! subsystem channel. Host keys are checked against [`KnownHostsStore`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use deployer_common::{AuthMode, ServerTarget};
use russh::ChannelMsg;
use russh::client::{AuthResult, Handle};
use russh::keys::PublicKey;
use russh_sftp::client::SftpSession;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::application::ports::{RemoteSession, SessionConnector};
use crate::domain::command::shell_quote;
use crate::domain::config::HostKeyPolicy;
use crate::domain::ssh::HostKeyStatus;
use crate::domain::{CommandOutput, ConnectionKey, DeployError};
use crate::infra::known_hosts::KnownHostsStore;

// ── Host key handler ──────────────────────────────────────────────────────────

/// What the handler does with the presented host key.
#[derive(Clone, Copy)]
enum KeyCheck {
    Verify(HostKeyPolicy),
    /// Capture the key and abort the handshake.
    Scan,
}

struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<KnownHostsStore>,
    check: KeyCheck,
    /// Why the key was refused, or the scanned key.
    verdict: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    fn note(&self, message: String) {
        *self.verdict.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn accept(&self, key: &PublicKey) -> bool {
        let Ok(presented) = key.to_openssh() else {
            self.note("host key cannot be encoded".to_string());
            return false;
        };
        let policy = match self.check {
            KeyCheck::Scan => {
                self.note(presented);
                return false;
            }
            KeyCheck::Verify(policy) => policy,
        };
        let fingerprint = key.fingerprint(russh::keys::HashAlg::Sha256);
        match self.known_hosts.check(&self.host, self.port, &presented) {
            HostKeyStatus::Trusted => true,
            HostKeyStatus::Changed { .. } => {
                tracing::error!(host = %self.host, port = self.port, %fingerprint, "host key changed");
                self.note(format!(
                    "host key changed (now {fingerprint}); verify it and remove the old entry from {}",
                    self.known_hosts.path().display()
                ));
                false
            }
            HostKeyStatus::Unknown => match policy {
                HostKeyPolicy::AcceptNew => {
                    if let Err(e) = self.known_hosts.record(&self.host, self.port, &presented) {
                        tracing::warn!(error = %e, "could not record host key");
                    }
                    tracing::info!(host = %self.host, port = self.port, %fingerprint, "recorded new host key");
                    true
                }
                HostKeyPolicy::Strict => {
                    self.note(format!(
                        "host key {fingerprint} is not in {} and the policy is strict",
                        self.known_hosts.path().display()
                    ));
                    false
                }
            },
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let accepted = self.accept(server_public_key);
        async move { Ok(accepted) }
    }
}

// ── Connector ─────────────────────────────────────────────────────────────────

pub struct SshConnector {
    config: Arc<russh::client::Config>,
    known_hosts: Arc<KnownHostsStore>,
    policy: HostKeyPolicy,
}

impl SshConnector {
    #[must_use]
    pub fn new(known_hosts: Arc<KnownHostsStore>, policy: HostKeyPolicy) -> Self {
        let config = russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            known_hosts,
            policy,
        }
    }

    #[must_use]
    pub fn known_hosts(&self) -> &Arc<KnownHostsStore> {
        &self.known_hosts
    }

    /// Fetch the host's current key without authenticating.
    ///
    /// # Errors
    ///
    /// Connection or timeout errors when the handshake does not get far
    /// enough to see the key.
    pub async fn scan_host_key(&self, host: &str, port: u16, timeout: Duration) -> Result<String, DeployError> {
        let address = format!("{host}:{port}");
        let verdict = Arc::new(Mutex::new(None));
        let handler = self.handler(host, port, KeyCheck::Scan, &verdict);
        let attempt = async {
            let stream = tcp_connect(host, port).await?;
            // The handler refuses the key, so the handshake always fails.
            let _ = russh::client::connect_stream(Arc::clone(&self.config), stream, handler).await;
            Ok::<_, DeployError>(())
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| DeployError::Timeout {
                what: format!("host key scan of {address}"),
                after: timeout,
            })??;
        verdict
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DeployError::Connection {
                target: address,
                reason: "server closed the connection before presenting a host key".to_string(),
            })
    }

    fn handler(
        &self,
        host: &str,
        port: u16,
        check: KeyCheck,
        verdict: &Arc<Mutex<Option<String>>>,
    ) -> ClientHandler {
        ClientHandler {
            host: host.to_string(),
            port,
            known_hosts: Arc::clone(&self.known_hosts),
            check,
            verdict: Arc::clone(verdict),
        }
    }

    async fn establish(&self, target: &ServerTarget, key: &ConnectionKey) -> Result<SshSession, DeployError> {
        let stream = tcp_connect(&key.host, key.port).await?;
        let verdict = Arc::new(Mutex::new(None));
        let handler = self.handler(&key.host, key.port, KeyCheck::Verify(self.policy), &verdict);
        let mut handle = russh::client::connect_stream(Arc::clone(&self.config), stream, handler)
            .await
            .map_err(|e| {
                let reason = verdict
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_else(|| e.to_string());
                DeployError::Connection {
                    target: key.address(),
                    reason,
                }
            })?;
        authenticate(&mut handle, target, key).await?;
        tracing::debug!(%key, "ssh session authenticated");
        Ok(SshSession {
            handle,
            key: key.clone(),
        })
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(
        &self,
        target: &ServerTarget,
        key: &ConnectionKey,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError> {
        let session = tokio::time::timeout(timeout, self.establish(target, key))
            .await
            .map_err(|_| DeployError::Timeout {
                what: format!("connect to {key}"),
                after: timeout,
            })??;
        Ok(Box::new(session))
    }
}

async fn tcp_connect(host: &str, port: u16) -> Result<TcpStream, DeployError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| DeployError::Connection {
            target: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

// ── Authentication ────────────────────────────────────────────────────────────

/// Agent identities first, then the configured key file.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &ServerTarget,
    key: &ConnectionKey,
) -> Result<(), DeployError> {
    let user = key.username.as_str();
    let mut reasons = Vec::new();

    match try_agent(handle, user).await {
        Ok(true) => return Ok(()),
        Ok(false) => reasons.push("no ssh-agent identity was accepted".to_string()),
        Err(e) => reasons.push(e),
    }

    if let AuthMode::KeyFile {
        path,
        passphrase_env,
    } = &target.auth
    {
        let passphrase = passphrase_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .map(SecretString::from);
        match try_key_file(handle, user, &expand_home(path), passphrase.as_ref()).await {
            Ok(true) => return Ok(()),
            Ok(false) => reasons.push(format!("key {} was rejected", path.display())),
            Err(e) => reasons.push(e),
        }
    }

    Err(DeployError::Authentication {
        target: key.address(),
        user: user.to_string(),
        reason: reasons.join("; "),
    })
}

async fn try_agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool, String> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| format!("ssh-agent unavailable: {e}"))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("ssh-agent: {e}"))?;
    if identities.is_empty() {
        return Err("ssh-agent has no identities".to_string());
    }
    for identity in identities {
        let result = handle
            .authenticate_publickey_with(user, identity, None, &mut agent)
            .await
            .map_err(|e| format!("ssh-agent signing failed: {e}"))?;
        if matches!(result, AuthResult::Success) {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn try_key_file(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    path: &Path,
    passphrase: Option<&SecretString>,
) -> Result<bool, String> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read key {}: {e}", path.display()))?;
    let private = russh::keys::decode_secret_key(&pem, passphrase.map(ExposeSecret::expose_secret))
        .map_err(|e| format!("cannot decode key {}: {e}", path.display()))?;
    let hash = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    let result = handle
        .authenticate_publickey(
            user,
            russh::keys::PrivateKeyWithHashAlg::new(Arc::new(private), hash),
        )
        .await
        .map_err(|e| e.to_string())?;
    match result {
        AuthResult::Success => Ok(true),
        AuthResult::Failure {
            remaining_methods, ..
        } => {
            tracing::debug!(user, ?remaining_methods, "public key rejected");
            Ok(false)
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct SshSession {
    handle: Handle<ClientHandler>,
    key: ConnectionKey,
}

impl SshSession {
    fn broken(&self, reason: impl ToString) -> DeployError {
        DeployError::Connection {
            target: self.key.address(),
            reason: reason.to_string(),
        }
    }

    fn transfer_failed(path: &str, reason: impl ToString) -> DeployError {
        DeployError::Transfer {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn sftp(&self) -> Result<SftpSession, DeployError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.broken(e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.broken(e))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| self.broken(format!("sftp: {e}")))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, DeployError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.broken(e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.broken(e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let exit_code = match exit_status {
            Some(code) => i32::try_from(code).unwrap_or(i32::MAX),
            None if self.handle.is_closed() => {
                return Err(self.broken("connection lost while the command was running"));
            }
            // Killed by a signal.
            None => -1,
        };
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    async fn upload(&self, remote_path: &str, data: &[u8], mode: u32) -> Result<(), DeployError> {
        let sftp = self.sftp().await?;
        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| Self::transfer_failed(remote_path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| Self::transfer_failed(remote_path, e))?;
        file.shutdown()
            .await
            .map_err(|e| Self::transfer_failed(remote_path, e))?;
        drop(file);
        drop(sftp);

        let chmod = format!("chmod {mode:o} {}", shell_quote(remote_path));
        let out = self.exec(&chmod).await?;
        if !out.success() {
            return Err(Self::transfer_failed(remote_path, out.stderr.trim()));
        }
        tracing::debug!(key = %self.key, path = remote_path, bytes = data.len(), "uploaded file");
        Ok(())
    }

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>, DeployError> {
        let sftp = self.sftp().await?;
        let mut file = sftp
            .open(remote_path)
            .await
            .map_err(|e| Self::transfer_failed(remote_path, e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| Self::transfer_failed(remote_path, e))?;
        tracing::debug!(key = %self.key, path = remote_path, bytes = data.len(), "downloaded file");
        Ok(data)
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(key = %self.key, error = %e, "disconnect failed");
        }
    }
}
