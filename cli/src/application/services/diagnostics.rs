//! Connection diagnostics and auto-fix.
//!
//! The checks run in a fixed order and each one produces a [`Diagnostic`].
//! Authentication checks open their own sessions through the connector, not
//! the pool, so a stale pooled session cannot mask a broken login.
//!
//! Auto-fix only applies remediations marked safe. It never touches the
//! firewall, the ban policy or sshd.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deployer_common::{
    AuthMode, Diagnostic, DiagnosticStatus, Identity, ProgressEvent, Remediation, ServerTarget,
    server_diagnostics,
};
use serde::Serialize;

use crate::application::context::CallContext;
use crate::application::ports::{
    LocalFixer, NetworkProbe, ProgressSink, RemoteExecutor, SessionConnector,
};
use crate::application::shell::RemoteShell;
use crate::domain::diagnostics::{
    DiagnosticReport, FAILURE_DETAIL, KEY_FILE, KNOWN_HOST, PRIVILEGED_AUTH, REMOTE_DIRECTORIES,
    SUDO_ACCESS, TCP_REACHABILITY, UNPRIVILEGED_AUTH, classify_failure,
};
use crate::domain::setup::{missing_directories_command, setup_directories_command};
use crate::domain::{ConnectionKey, DeployError, RemoteCommand};

/// A remediation and what happened when it was applied.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedFix {
    pub remediation: Remediation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppliedFix {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoFixOutcome {
    pub before: DiagnosticReport,
    pub applied: Vec<AppliedFix>,
    pub after: DiagnosticReport,
}

#[derive(Clone)]
pub struct DiagnosticsEngine {
    connector: Arc<dyn SessionConnector>,
    executor: Arc<dyn RemoteExecutor>,
    network: Arc<dyn NetworkProbe>,
    local: Arc<dyn LocalFixer>,
    sink: Arc<dyn ProgressSink>,
    connect_timeout: Duration,
}

impl DiagnosticsEngine {
    #[must_use]
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        executor: Arc<dyn RemoteExecutor>,
        network: Arc<dyn NetworkProbe>,
        local: Arc<dyn LocalFixer>,
        sink: Arc<dyn ProgressSink>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            executor,
            network,
            local,
            sink,
            connect_timeout,
        }
    }

    /// Run every applicable check against `target`.
    ///
    /// Failures are reported as diagnostics, never as errors. When the host
    /// is unreachable the remote checks are skipped.
    pub async fn diagnose(&self, ctx: &CallContext, target: &ServerTarget) -> DiagnosticReport {
        let topic = server_diagnostics(&target.id);
        let mut diagnostics = Vec::new();
        let mut record = |d: Diagnostic| {
            self.publish(&topic, &d);
            diagnostics.push(d);
        };

        let reachable = {
            let d = self.check_tcp(target).await;
            let ok = d.status != DiagnosticStatus::Error;
            record(d);
            ok
        };
        record(self.check_key_file(target).await);
        if reachable {
            record(self.check_known_host(target).await);
            record(self.check_privileged(target).await);
            if target.setup_complete {
                record(self.check_login(target, Identity::Unprivileged, UNPRIVILEGED_AUTH).await);
                record(self.check_sudo(ctx, target).await);
                record(self.check_directories(ctx, target).await);
            }
        }

        let report = DiagnosticReport::build(&target.id, diagnostics);
        tracing::info!(
            server = %target.label(),
            overall = ?report.overall,
            ban_suspected = report.ban_suspected,
            "diagnostics finished"
        );
        report
    }

    /// Diagnose, apply every safe remediation, then diagnose again.
    pub async fn auto_fix(&self, ctx: &CallContext, target: &ServerTarget) -> AutoFixOutcome {
        let before = self.diagnose(ctx, target).await;
        let mut applied = Vec::new();
        for remediation in before.safe_remediations() {
            let result = self.apply(ctx, target, &remediation).await;
            match &result {
                Ok(()) => tracing::info!(?remediation, "remediation applied"),
                Err(e) => tracing::warn!(?remediation, error = %e, "remediation failed"),
            }
            applied.push(AppliedFix {
                remediation,
                error: result.err().map(|e| e.to_string()),
            });
        }
        if applied.is_empty() {
            tracing::debug!("nothing safe to fix");
        }
        self.executor.forget(target, target.operating_identity()).await;
        let after = self.diagnose(ctx, target).await;
        AutoFixOutcome {
            before,
            applied,
            after,
        }
    }

    async fn apply(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        remediation: &Remediation,
    ) -> Result<(), DeployError> {
        match remediation {
            Remediation::FixKeyPermissions { path } => self.local.set_file_mode(path, 0o600).await,
            Remediation::AcceptHostKey { host, port } => {
                self.local.accept_host_key(host, *port).await.map(drop)
            }
            Remediation::CreateDirectories { .. } => {
                RemoteShell::new(self.executor.as_ref(), ctx, target, target.operating_identity())
                    .sudo(&setup_directories_command(&target.unprivileged_user))
                    .await
                    .map(drop)
            }
            Remediation::Manual { instructions } => Err(DeployError::Precondition(format!(
                "manual remediation required: {instructions}"
            ))),
        }
    }

    fn publish(&self, topic: &str, d: &Diagnostic) {
        let event = match d.status {
            DiagnosticStatus::Success | DiagnosticStatus::Warning => {
                ProgressEvent::success(&d.step, d.message.clone(), 0)
            }
            DiagnosticStatus::Error => ProgressEvent::failed(
                &d.step,
                d.message.clone(),
                d.suggestion.clone().unwrap_or_default(),
                0,
            ),
        };
        self.sink.emit(topic, event);
    }

    // ── Checks ────────────────────────────────────────────────────────────────

    async fn check_tcp(&self, target: &ServerTarget) -> Diagnostic {
        let started = Instant::now();
        let d = match self
            .network
            .probe(&target.host, target.port, self.connect_timeout)
            .await
        {
            Ok(probe) => {
                let latency_ms = probe.latency.as_millis();
                let d = match probe.banner {
                    Some(banner) if banner.starts_with("SSH-") => Diagnostic::new(
                        TCP_REACHABILITY,
                        DiagnosticStatus::Success,
                        format!("{}:{} reachable in {latency_ms} ms", target.host, target.port),
                    )
                    .with_detail("banner", banner),
                    other => Diagnostic::new(
                        TCP_REACHABILITY,
                        DiagnosticStatus::Warning,
                        format!(
                            "{}:{} accepts TCP but did not present an SSH banner",
                            target.host, target.port
                        ),
                    )
                    .with_detail("banner", other.unwrap_or_default())
                    .with_suggestion("Check that the port belongs to sshd and not another service."),
                };
                d.with_detail("latency_ms", latency_ms)
            }
            Err(e) => failed(TCP_REACHABILITY, &format!("cannot reach {}:{}", target.host, target.port), &e),
        };
        d.timed(started.elapsed())
    }

    async fn check_key_file(&self, target: &ServerTarget) -> Diagnostic {
        let started = Instant::now();
        let d = match &target.auth {
            AuthMode::Agent => Diagnostic::new(
                KEY_FILE,
                DiagnosticStatus::Success,
                "Authenticating with ssh-agent",
            )
            .with_detail("auth", "agent"),
            AuthMode::KeyFile { path, .. } => match self.local.file_mode(path).await {
                None => Diagnostic::new(
                    KEY_FILE,
                    DiagnosticStatus::Error,
                    format!("key file {} not found", path.display()),
                )
                .with_remediation(Remediation::Manual {
                    instructions: format!(
                        "Create the key or point the server at an existing one: {}",
                        path.display()
                    ),
                })
                .with_suggestion("Generate a key with ssh-keygen -t ed25519 or fix the configured path."),
                Some(mode) if mode & 0o077 != 0 => Diagnostic::new(
                    KEY_FILE,
                    DiagnosticStatus::Warning,
                    format!("key file {} is readable by others (mode {mode:o})", path.display()),
                )
                .with_detail("mode", format!("{mode:o}"))
                .with_remediation(Remediation::FixKeyPermissions { path: path.clone() })
                .with_suggestion(format!("chmod 600 {}", path.display())),
                Some(mode) => Diagnostic::new(
                    KEY_FILE,
                    DiagnosticStatus::Success,
                    format!("key file {} present", path.display()),
                )
                .with_detail("mode", format!("{mode:o}")),
            },
        };
        d.timed(started.elapsed())
    }

    async fn check_known_host(&self, target: &ServerTarget) -> Diagnostic {
        let started = Instant::now();
        let d = if self.local.host_key_known(&target.host, target.port).await {
            Diagnostic::new(KNOWN_HOST, DiagnosticStatus::Success, "host key is known")
        } else {
            Diagnostic::new(
                KNOWN_HOST,
                DiagnosticStatus::Warning,
                "host key has not been recorded yet",
            )
            .with_remediation(Remediation::AcceptHostKey {
                host: target.host.clone(),
                port: target.port,
            })
            .with_suggestion("Run doctor --fix to record the current host key.")
        };
        d.timed(started.elapsed())
    }

    async fn check_privileged(&self, target: &ServerTarget) -> Diagnostic {
        if target.security_locked {
            return Diagnostic::new(
                PRIVILEGED_AUTH,
                DiagnosticStatus::Success,
                format!(
                    "login as {} is disabled by lockdown (expected)",
                    target.privileged_user
                ),
            )
            .with_detail("expected_disabled", true);
        }
        self.check_login(target, Identity::Privileged, PRIVILEGED_AUTH).await
    }

    async fn check_login(&self, target: &ServerTarget, identity: Identity, step: &str) -> Diagnostic {
        let started = Instant::now();
        let key = ConnectionKey::for_target(target, identity);
        let d = match self
            .connector
            .connect(target, &key, self.connect_timeout)
            .await
        {
            Ok(session) => {
                session.close().await;
                Diagnostic::new(step, DiagnosticStatus::Success, format!("logged in as {key}"))
                    .with_detail("latency_ms", started.elapsed().as_millis())
            }
            Err(e) => failed(step, &format!("login as {key} failed"), &e.to_string()),
        };
        d.timed(started.elapsed())
    }

    async fn check_sudo(&self, ctx: &CallContext, target: &ServerTarget) -> Diagnostic {
        let started = Instant::now();
        let shell = RemoteShell::new(self.executor.as_ref(), ctx, target, Identity::Unprivileged);
        let d = match shell.sudo_succeeds("true").await {
            Ok(true) => Diagnostic::new(
                SUDO_ACCESS,
                DiagnosticStatus::Success,
                format!("{} can use sudo", target.unprivileged_user),
            ),
            Ok(false) => Diagnostic::new(
                SUDO_ACCESS,
                DiagnosticStatus::Error,
                format!("{} cannot use password-less sudo", target.unprivileged_user),
            )
            .with_remediation(Remediation::Manual {
                instructions: "Restore /etc/sudoers.d/pb-deployer from the provider console.".to_string(),
            })
            .with_suggestion("Deploys and service control need password-less sudo for the service account."),
            Err(e) => failed(SUDO_ACCESS, "could not check sudo", &e.to_string()),
        };
        d.timed(started.elapsed())
    }

    async fn check_directories(&self, ctx: &CallContext, target: &ServerTarget) -> Diagnostic {
        let started = Instant::now();
        let shell = RemoteShell::new(self.executor.as_ref(), ctx, target, target.operating_identity());
        let d = match shell.run(&RemoteCommand::new(missing_directories_command())).await {
            Ok(out) if out.success() => {
                let missing: Vec<String> = out
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if missing.is_empty() {
                    Diagnostic::new(
                        REMOTE_DIRECTORIES,
                        DiagnosticStatus::Success,
                        "application directories present",
                    )
                } else {
                    Diagnostic::new(
                        REMOTE_DIRECTORIES,
                        DiagnosticStatus::Warning,
                        format!("missing directories: {}", missing.join(", ")),
                    )
                    .with_remediation(Remediation::CreateDirectories { paths: missing })
                    .with_suggestion("Run doctor --fix to recreate the application directories.")
                }
            }
            Ok(out) => failed(REMOTE_DIRECTORIES, "could not list directories", &out.stderr),
            Err(e) => failed(REMOTE_DIRECTORIES, "could not list directories", &e.to_string()),
        };
        d.timed(started.elapsed())
    }
}

/// Error diagnostic carrying the failure class and its advice.
fn failed(step: &str, message: &str, error: &str) -> Diagnostic {
    let class = classify_failure(error);
    Diagnostic::new(step, DiagnosticStatus::Error, format!("{message}: {error}"))
        .with_detail(FAILURE_DETAIL, class.as_str())
        .with_suggestion(class.suggestion())
}
