//! Shared fakes for unit tests.
//!
//! [`FakeHost`] stands in for a remote server: it answers commands from
//! scripted rules, keeps uploaded files and counts logins. Every connector
//! and session built from one host shares its state.

#![allow(clippy::expect_used, dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use deployer_common::{
    AppStatus, AuthMode, ManagedApplication, ProgressEvent, ProgressStatus, ReleaseVersion,
    ServerTarget,
};
use mockall::mock;
use pb_deployer::application::ports::{
    HealthProbe, LocalFixer, NetworkProbe, ProgressSink, RemoteSession, SessionConnector, TcpProbe,
};
use pb_deployer::domain::config::{ExecutorConfig, PoolConfig};
use pb_deployer::domain::{CommandOutput, ConnectionKey, DeployError};
use pb_deployer::infra::executor::PooledExecutor;
use pb_deployer::infra::pool::ConnectionPool;

// ── Command outputs ───────────────────────────────────────────────────────────

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

pub fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

// ── Scripted host ─────────────────────────────────────────────────────────────

/// How the fake host turns a login away.
#[derive(Debug, Clone, Copy)]
pub enum Refusal {
    Auth,
    Refused,
    Timeout,
}

impl Refusal {
    fn error(self, key: &ConnectionKey) -> DeployError {
        match self {
            Self::Auth => DeployError::Authentication {
                target: key.address(),
                user: key.username.clone(),
                reason: "permission denied (publickey)".to_string(),
            },
            Self::Refused => DeployError::Connection {
                target: key.address(),
                reason: "connection refused".to_string(),
            },
            Self::Timeout => DeployError::Timeout {
                what: format!("connect to {key}"),
                after: Duration::from_secs(1),
            },
        }
    }
}

struct Rule {
    pattern: String,
    output: CommandOutput,
    once: bool,
}

#[derive(Default)]
struct HostState {
    rules: Vec<Rule>,
    commands: Vec<(String, String)>,
    files: HashMap<String, Vec<u8>>,
    uploads: Vec<String>,
    download_any: Option<Vec<u8>>,
    refusals: HashMap<String, Refusal>,
    transient_failures: usize,
    attempts: usize,
    logins: Vec<String>,
    closed: usize,
    exec_delay: Option<Duration>,
    broken: bool,
    overlaps: usize,
}

impl HostState {
    /// Latest matching rule wins; unmatched commands succeed silently.
    fn answer(&mut self, command: &str) -> CommandOutput {
        let Some(idx) = self
            .rules
            .iter()
            .rposition(|r| command.contains(&r.pattern))
        else {
            return CommandOutput::default();
        };
        if self.rules[idx].once {
            self.rules.remove(idx).output
        } else {
            self.rules[idx].output.clone()
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("host state")
    }

    // scripting

    /// Answer every command containing `pattern` with `output`.
    pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            output,
            once: false,
        });
        self
    }

    /// Answer the next command containing `pattern` with `output`.
    pub fn once(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            output,
            once: true,
        });
        self
    }

    pub fn refuse(&self, user: &str, refusal: Refusal) {
        self.lock().refusals.insert(user.to_string(), refusal);
    }

    pub fn allow(&self, user: &str) {
        self.lock().refusals.remove(user);
    }

    /// Fail the next `n` connection attempts with a reset.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().transient_failures = n;
    }

    /// Bytes returned for downloads of paths nothing was uploaded to.
    pub fn serve_downloads(&self, data: &[u8]) {
        self.lock().download_any = Some(data.to_vec());
    }

    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        self.lock().exec_delay = delay;
    }

    /// While broken, every exec and transfer fails as a dropped connection.
    pub fn break_transport(&self, broken: bool) {
        self.lock().broken = broken;
    }

    // inspection

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn commands_as(&self, user: &str) -> Vec<String> {
        self.lock()
            .commands
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.lock().commands.iter().any(|(_, c)| c.contains(pattern))
    }

    pub fn logins(&self) -> Vec<String> {
        self.lock().logins.clone()
    }

    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Times a second command started on a session that was still busy.
    pub fn overlaps(&self) -> usize {
        self.lock().overlaps
    }

    pub fn connector(&self) -> Arc<FakeConnector> {
        Arc::new(FakeConnector { host: self.clone() })
    }
}

pub struct FakeConnector {
    host: FakeHost,
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        _target: &ServerTarget,
        key: &ConnectionKey,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, DeployError> {
        let mut state = self.host.lock();
        state.attempts += 1;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(DeployError::Connection {
                target: key.address(),
                reason: "connection reset by peer".to_string(),
            });
        }
        if let Some(refusal) = state.refusals.get(&key.username) {
            return Err(refusal.error(key));
        }
        state.logins.push(key.username.clone());
        Ok(Box::new(FakeSession {
            host: self.host.clone(),
            user: key.username.clone(),
            closed: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
        }))
    }
}

struct FakeSession {
    host: FakeHost,
    user: String,
    closed: AtomicBool,
    busy: AtomicUsize,
}

struct Busy<'a>(&'a AtomicUsize);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeSession {
    fn enter(&self) -> Busy<'_> {
        if self.busy.fetch_add(1, Ordering::SeqCst) > 0 {
            self.host.lock().overlaps += 1;
        }
        Busy(&self.busy)
    }

    fn dropped(&self) -> DeployError {
        self.closed.store(true, Ordering::SeqCst);
        DeployError::Connection {
            target: "fake".to_string(),
            reason: "connection reset by peer".to_string(),
        }
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput, DeployError> {
        let _busy = self.enter();
        let delay = {
            let mut state = self.host.lock();
            state.commands.push((self.user.clone(), command.to_string()));
            state.exec_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.host.lock();
        if state.broken {
            drop(state);
            return Err(self.dropped());
        }
        Ok(state.answer(command))
    }

    async fn upload(&self, remote_path: &str, data: &[u8], _mode: u32) -> Result<(), DeployError> {
        let _busy = self.enter();
        let mut state = self.host.lock();
        if state.broken {
            drop(state);
            return Err(self.dropped());
        }
        state.uploads.push(remote_path.to_string());
        state.files.insert(remote_path.to_string(), data.to_vec());
        Ok(())
    }

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>, DeployError> {
        let _busy = self.enter();
        let state = self.host.lock();
        if state.broken {
            // The stream dies mid-read: a transfer error on a dead session.
            drop(state);
            self.closed.store(true, Ordering::SeqCst);
            return Err(DeployError::Transfer {
                path: remote_path.to_string(),
                reason: "unexpected end of stream".to_string(),
            });
        }
        state
            .files
            .get(remote_path)
            .or(state.download_any.as_ref())
            .cloned()
            .ok_or_else(|| DeployError::Transfer {
                path: remote_path.to_string(),
                reason: "no such file".to_string(),
            })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.host.lock().closed += 1;
        }
    }
}

// ── Pool wiring ───────────────────────────────────────────────────────────────

pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        max_connections: 8,
        connect_timeout_secs: 5,
        connect_attempts: 3,
        retry_backoff_ms: 1,
        ..PoolConfig::default()
    }
}

pub fn pool_with(host: &FakeHost, config: PoolConfig) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(host.connector(), config))
}

pub fn executor(host: &FakeHost) -> Arc<PooledExecutor> {
    Arc::new(PooledExecutor::new(
        pool_with(host, fast_pool_config()),
        &ExecutorConfig::default(),
    ))
}

// ── Records ───────────────────────────────────────────────────────────────────

pub fn target() -> ServerTarget {
    ServerTarget {
        id: "srv1".to_string(),
        name: "prod".to_string(),
        host: "203.0.113.10".to_string(),
        port: 22,
        privileged_user: "root".to_string(),
        unprivileged_user: "pocketbase".to_string(),
        auth: AuthMode::Agent,
        setup_complete: true,
        security_locked: false,
    }
}

pub fn fresh_target() -> ServerTarget {
    ServerTarget {
        setup_complete: false,
        ..target()
    }
}

pub fn locked_target() -> ServerTarget {
    ServerTarget {
        security_locked: true,
        ..target()
    }
}

pub fn app() -> ManagedApplication {
    ManagedApplication {
        id: "app1".to_string(),
        name: "blog".to_string(),
        server_id: "srv1".to_string(),
        install_path: "/opt/pocketbase/apps/blog".to_string(),
        service_name: "pocketbase-blog".to_string(),
        domain: "blog.example.com".to_string(),
        port: 8090,
        current_version: Some("1.0.0".to_string()),
        status: AppStatus::Online,
    }
}

pub fn version(label: &str) -> ReleaseVersion {
    ReleaseVersion {
        id: format!("v-{label}"),
        app_id: "app1".to_string(),
        label: label.to_string(),
        artifact_path: PathBuf::from(format!("/releases/blog-{label}.tar.gz")),
        notes: None,
        created_at: Utc::now(),
    }
}

/// A minimal valid release: the binary plus `pb_public/`.
pub fn release_archive() -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    append(&mut builder, "pocketbase", b"#!/bin/sh\nexit 0\n", 0o755);
    append(&mut builder, "pb_public/index.html", b"<h1>blog</h1>", 0o644);
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

/// Static assets with no `pocketbase` binary.
pub fn public_only_archive() -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    append(&mut builder, "pb_public/index.html", b"<h1>blog</h1>", 0o644);
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

fn append<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8], mode: u32) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    builder
        .append_data(&mut header, path, data)
        .expect("append entry");
}

// ── Progress ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl ProgressSink for RecordingSink {
    fn emit(&self, topic: &str, event: ProgressEvent) {
        self.events
            .lock()
            .expect("sink")
            .push((topic.to_string(), event));
    }
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(String, ProgressEvent)> {
        self.events.lock().expect("sink").clone()
    }

    pub fn topics(&self) -> HashSet<String> {
        self.events().into_iter().map(|(t, _)| t).collect()
    }

    /// `(step, status)` pairs in emission order.
    pub fn steps(&self) -> Vec<(String, ProgressStatus)> {
        self.events()
            .into_iter()
            .map(|(_, e)| (e.step, e.status))
            .collect()
    }

    pub fn last(&self) -> Option<ProgressEvent> {
        self.events().pop().map(|(_, e)| e)
    }

    pub fn failed(&self) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.status == ProgressStatus::Failed)
            .collect()
    }
}

// ── Probes ────────────────────────────────────────────────────────────────────

mock! {
    pub Health {}

    #[async_trait]
    impl HealthProbe for Health {
        async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, String>;
    }
}

mock! {
    pub Network {}

    #[async_trait]
    impl NetworkProbe for Network {
        async fn probe(&self, host: &str, port: u16, timeout: Duration) -> Result<TcpProbe, String>;
    }
}

/// Health endpoint that always answers `status`.
pub fn health_always(status: u16) -> MockHealth {
    let mut health = MockHealth::new();
    health.expect_probe().returning(move |_, _| Ok(status));
    health
}

/// Health endpoint answering `first` for `n` probes, then `then`.
pub fn health_sequence(first: u16, n: usize, then: u16) -> MockHealth {
    let calls = AtomicUsize::new(0);
    let mut health = MockHealth::new();
    health.expect_probe().returning(move |_, _| {
        if calls.fetch_add(1, Ordering::SeqCst) < n {
            Ok(first)
        } else {
            Ok(then)
        }
    });
    health
}

pub fn sshd_banner() -> MockNetwork {
    let mut network = MockNetwork::new();
    network.expect_probe().returning(|_, _, _| {
        Ok(TcpProbe {
            latency: Duration::from_millis(12),
            banner: Some("SSH-2.0-OpenSSH_9.6".to_string()),
        })
    });
    network
}

// ── Local side ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeLocal {
    modes: Mutex<HashMap<PathBuf, u32>>,
    known: Mutex<HashSet<(String, u16)>>,
    accepted: AtomicUsize,
}

impl FakeLocal {
    pub fn with_key(self, path: &Path, mode: u32) -> Self {
        self.modes
            .lock()
            .expect("modes")
            .insert(path.to_path_buf(), mode);
        self
    }

    pub fn knowing(self, host: &str, port: u16) -> Self {
        self.known
            .lock()
            .expect("known")
            .insert((host.to_string(), port));
        self
    }

    pub fn mode(&self, path: &Path) -> Option<u32> {
        self.modes.lock().expect("modes").get(path).copied()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalFixer for FakeLocal {
    async fn file_mode(&self, path: &Path) -> Option<u32> {
        self.mode(path)
    }

    async fn set_file_mode(&self, path: &Path, mode: u32) -> Result<(), DeployError> {
        let mut modes = self.modes.lock().expect("modes");
        match modes.get_mut(path) {
            Some(m) => {
                *m = mode;
                Ok(())
            }
            None => Err(DeployError::io(
                format!("chmod {}", path.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )),
        }
    }

    async fn host_key_known(&self, host: &str, port: u16) -> bool {
        self.known
            .lock()
            .expect("known")
            .contains(&(host.to_string(), port))
    }

    async fn accept_host_key(&self, host: &str, port: u16) -> Result<String, DeployError> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.known
            .lock()
            .expect("known")
            .insert((host.to_string(), port));
        Ok("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeKeyForTests".to_string())
    }
}
