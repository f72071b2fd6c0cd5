//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and the shared record crate;
//! never from `crate::infra`, `crate::commands`, or `crate::output`.
//!
//! Ports that are shared across background tasks are object-safe
//! (`async_trait`) so managers can hold them as `Arc<dyn …>`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployer_common::{Identity, ProgressEvent, ServerTarget};

use crate::application::context::CallContext;
use crate::domain::config::DeployerConfig;
use crate::domain::{CommandOutput, ConnectionKey, DeployError, RemoteCommand};

// ── Transport ─────────────────────────────────────────────────────────────────

/// One authenticated remote-shell session.
///
/// Sessions are not multiplexed: the pool guarantees a single caller at a time.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command line to completion.
    async fn exec(&self, command: &str) -> Result<CommandOutput, DeployError>;
    /// Write `data` to `remote_path` with permission bits `mode`.
    async fn upload(&self, remote_path: &str, data: &[u8], mode: u32) -> Result<(), DeployError>;
    /// Read `remote_path` fully.
    async fn download(&self, remote_path: &str) -> Result<Vec<u8>, DeployError>;
    /// Whether the transport underneath has gone away.
    fn is_closed(&self) -> bool;
    /// Disconnect. Errors are swallowed; the session is unusable afterwards.
    async fn close(&self);
}

/// Opens authenticated sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect and authenticate as `key.username`, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// `Connection`/`Timeout` for transport problems, `Authentication` when
    /// every configured identity was rejected.
    async fn connect(
        &self,
        target: &ServerTarget,
        key: &ConnectionKey,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError>;
}

// ── Execution ─────────────────────────────────────────────────────────────────

/// Runs commands and file transfers through pooled sessions.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        identity: Identity,
        command: &RemoteCommand,
    ) -> Result<CommandOutput, DeployError>;

    async fn upload(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        identity: Identity,
        data: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> Result<(), DeployError>;

    async fn download(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        identity: Identity,
        remote_path: &str,
    ) -> Result<Vec<u8>, DeployError>;

    /// Drop any pooled session for `(target, identity)`.
    async fn forget(&self, target: &ServerTarget, identity: Identity);
}

// ── Notification ──────────────────────────────────────────────────────────────

/// Receives progress events for a subscription topic.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, topic: &str, event: ProgressEvent);
}

/// Sink that drops everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _topic: &str, _event: ProgressEvent) {}
}

// ── Probes ────────────────────────────────────────────────────────────────────

/// HTTP health endpoint probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok(status)` for any HTTP response, `Err` for transport failure.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, String>;
}

/// Raw TCP reachability.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Connect to `host:port` and read the server banner, if any.
    async fn probe(&self, host: &str, port: u16, timeout: Duration)
    -> Result<TcpProbe, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpProbe {
    pub latency: Duration,
    pub banner: Option<String>,
}

// ── Local state ───────────────────────────────────────────────────────────────

/// A stored pre-deploy backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub id: String,
    pub app_id: String,
    pub version_label: Option<String>,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Local archive of pre-deploy backups, newest first.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn save(
        &self,
        app_id: &str,
        version_label: Option<&str>,
        data: &[u8],
    ) -> Result<BackupEntry, DeployError>;
    async fn load(&self, entry: &BackupEntry) -> Result<Vec<u8>, DeployError>;
    async fn list(&self, app_id: &str) -> Result<Vec<BackupEntry>, DeployError>;
    /// Keep the newest `keep` backups; returns how many were removed.
    async fn prune(&self, app_id: &str, keep: usize) -> Result<usize, DeployError>;
}

/// Local side of the diagnostics engine: key files and host keys.
#[async_trait]
pub trait LocalFixer: Send + Sync {
    /// Permission bits of a local file, or `None` when it does not exist.
    async fn file_mode(&self, path: &Path) -> Option<u32>;
    async fn set_file_mode(&self, path: &Path, mode: u32) -> Result<(), DeployError>;
    /// Whether the known_hosts store has any key for `host:port`.
    async fn host_key_known(&self, host: &str, port: u16) -> bool;
    /// Fetch and record the host's current key.
    async fn accept_host_key(&self, host: &str, port: u16) -> Result<String, DeployError>;
}

/// Persists [`DeployerConfig`].
pub trait ConfigStore {
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    fn load(&self) -> Result<DeployerConfig>;
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn save(&self, config: &DeployerConfig) -> Result<()>;
    fn path(&self) -> &Path;
}
