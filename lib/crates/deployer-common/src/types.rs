use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Servers ───────────────────────────────────────────────────────────────────

/// Which of the two login identities on a target a session uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    /// The administrative account (usually `root`), disabled by lockdown.
    Privileged,
    /// The application's own service account.
    Unprivileged,
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Privileged => f.write_str("privileged"),
            Self::Unprivileged => f.write_str("unprivileged"),
        }
    }
}

/// How sessions to a target authenticate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// Only identities offered by the local SSH agent.
    Agent,
    /// SSH agent first, then the private key at `path`.
    KeyFile {
        path: PathBuf,
        /// Name of an environment variable holding the key passphrase.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase_env: Option<String>,
    },
}

/// A remote host under management.
///
/// Once `security_locked` is set the privileged identity is assumed unreachable
/// over SSH and every later operation runs as the unprivileged account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerTarget {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_privileged_user")]
    pub privileged_user: String,
    #[serde(default = "default_unprivileged_user")]
    pub unprivileged_user: String,
    pub auth: AuthMode,
    #[serde(default)]
    pub setup_complete: bool,
    #[serde(default)]
    pub security_locked: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_privileged_user() -> String {
    "root".to_string()
}

fn default_unprivileged_user() -> String {
    "pocketbase".to_string()
}

impl ServerTarget {
    /// Login name for the given identity.
    #[must_use]
    pub fn username(&self, identity: Identity) -> &str {
        match identity {
            Identity::Privileged => &self.privileged_user,
            Identity::Unprivileged => &self.unprivileged_user,
        }
    }

    /// Identity that routine operations (service control, deploys) should use.
    #[must_use]
    pub fn operating_identity(&self) -> Identity {
        if self.security_locked {
            Identity::Unprivileged
        } else {
            Identity::Privileged
        }
    }

    /// Label used in logs and messages, e.g. `prod-1 (10.0.0.5:22)`.
    #[must_use]
    pub fn label(&self) -> String {
        let name = if self.name.is_empty() { &self.id } else { &self.name };
        format!("{name} ({}:{})", self.host, self.port)
    }
}

// ── Applications and versions ─────────────────────────────────────────────────

/// Last known health of a managed application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A deployed application instance on one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedApplication {
    pub id: String,
    pub name: String,
    pub server_id: String,
    pub install_path: String,
    pub service_name: String,
    /// Public domain used to probe the health endpoint.
    pub domain: String,
    /// Loopback port the service binds to.
    #[serde(default = "default_app_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(default)]
    pub status: AppStatus,
}

fn default_app_port() -> u16 {
    8090
}

/// A release uploaded for an application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseVersion {
    pub id: String,
    pub app_id: String,
    /// Semantic version label, e.g. `1.2.0`.
    pub label: String,
    /// Local path to the release archive.
    pub artifact_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Deployments ───────────────────────────────────────────────────────────────

/// Status of a deployment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl DeploymentStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Whether a deployment moves forward or returns to an earlier release.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    #[default]
    Deploy,
    Rollback,
}

/// Rejected state transition on a [`DeploymentRecord`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("deployment {id} is already {status:?} and cannot change")]
    Terminal { id: String, status: DeploymentStatus },

    #[error("deployment {id} cannot move from {from:?} to {to:?}")]
    Invalid {
        id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },
}

/// One attempt to move an application to a given release.
///
/// Status only moves `pending → running → success | failed`; `completed_at`
/// is set exactly when the status becomes terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub id: String,
    pub app_id: String,
    pub version_id: String,
    pub version_label: String,
    #[serde(default)]
    pub kind: DeploymentKind,
    status: DeploymentStatus,
    #[serde(default)]
    log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    /// Create a new `pending` record.
    #[must_use]
    pub fn pending(
        id: impl Into<String>,
        app_id: impl Into<String>,
        version: &ReleaseVersion,
        kind: DeploymentKind,
    ) -> Self {
        Self {
            id: id.into(),
            app_id: app_id.into(),
            version_id: version.id.clone(),
            version_label: version.label.clone(),
            kind,
            status: DeploymentStatus::Pending,
            log: String::new(),
            started_at: None,
            completed_at: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    #[must_use]
    pub fn log(&self) -> &str {
        &self.log
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move `pending → running` and stamp `started_at`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(DeploymentStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Move `running → success | failed` and stamp `completed_at`.
    ///
    /// A `pending` record may only fail (e.g. cancelled before it started).
    pub fn finish(&mut self, success: bool, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let to = if success {
            DeploymentStatus::Success
        } else {
            DeploymentStatus::Failed
        };
        if self.status == DeploymentStatus::Pending && success {
            return Err(TransitionError::Invalid {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = to;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Append a timestamped line to the log. Ignored once terminal.
    pub fn append_log(&mut self, now: DateTime<Utc>, line: &str) {
        if self.is_terminal() {
            return;
        }
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(&format!("[{}] {line}", now.format("%H:%M:%S")));
    }

    /// Wall time between start and completion, once both are known.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    fn transition(&mut self, to: DeploymentStatus) -> Result<(), TransitionError> {
        match (self.status, to) {
            (DeploymentStatus::Pending, DeploymentStatus::Running) => {
                self.status = to;
                Ok(())
            }
            (from, _) if from.is_terminal() => Err(TransitionError::Terminal {
                id: self.id.clone(),
                status: from,
            }),
            (from, to) => Err(TransitionError::Invalid {
                id: self.id.clone(),
                from,
                to,
            }),
        }
    }
}

// ── Progress events ───────────────────────────────────────────────────────────

/// Status of one progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Success,
    Failed,
}

/// A progress event emitted by a long-running operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub step: String,
    pub status: ProgressStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(rename = "timestampUTC")]
    pub timestamp: DateTime<Utc>,
    pub progress_percent: u8,
}

impl ProgressEvent {
    #[must_use]
    pub fn running(step: &str, message: impl Into<String>, progress_percent: u8) -> Self {
        Self::new(step, ProgressStatus::Running, message.into(), progress_percent)
    }

    #[must_use]
    pub fn success(step: &str, message: impl Into<String>, progress_percent: u8) -> Self {
        Self::new(step, ProgressStatus::Success, message.into(), progress_percent)
    }

    #[must_use]
    pub fn failed(
        step: &str,
        message: impl Into<String>,
        detail: impl Into<String>,
        progress_percent: u8,
    ) -> Self {
        let mut event = Self::new(step, ProgressStatus::Failed, message.into(), progress_percent);
        event.detail = Some(detail.into());
        event
    }

    fn new(step: &str, status: ProgressStatus, message: String, progress_percent: u8) -> Self {
        Self {
            step: step.to_string(),
            status,
            message,
            detail: None,
            timestamp: Utc::now(),
            progress_percent: progress_percent.min(100),
        }
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

/// Outcome of a single diagnostic check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStatus {
    Success,
    Warning,
    Error,
}

/// A fix the diagnostics engine knows how to describe or apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Remediation {
    /// `chmod 600` the local private key file.
    FixKeyPermissions { path: PathBuf },
    /// Record the host's current key in the known_hosts store.
    AcceptHostKey { host: String, port: u16 },
    /// Create missing application directories on the target.
    CreateDirectories { paths: Vec<String> },
    /// Needs a human; never applied automatically.
    Manual { instructions: String },
}

impl Remediation {
    /// Whether auto-fix may apply this remediation without asking.
    #[must_use]
    pub fn is_safe(&self) -> bool {
        !matches!(self, Self::Manual { .. })
    }
}

/// One check result. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub step: String,
    pub status: DiagnosticStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
    pub duration_ms: u64,
}

impl Diagnostic {
    #[must_use]
    pub fn new(step: &str, status: DiagnosticStatus, message: impl Into<String>) -> Self {
        Self {
            step: step.to_string(),
            status,
            message: message.into(),
            detail: BTreeMap::new(),
            suggestion: None,
            remediation: None,
            duration_ms: 0,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.detail.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_remediation(mut self, remediation: Remediation) -> Self {
        self.remediation = Some(remediation);
        self
    }

    #[must_use]
    pub fn timed(mut self, elapsed: std::time::Duration) -> Self {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
