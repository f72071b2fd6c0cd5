//! The deployment pipeline.
//!
//! A run moves its [`DeploymentRecord`] through `pending → running →
//! success | failed` and publishes step events on
//! `deployment_progress_<record id>`. Failures after the old service was
//! stopped trigger a soft rollback from the local pre-deploy backup.
//!
//! At most one run per application is in flight; a second submit is
//! rejected rather than queued.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use deployer_common::{
    DeploymentKind, DeploymentRecord, ManagedApplication, ReleaseVersion, ServerTarget,
    deployment_progress,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::application::context::CallContext;
use crate::application::ports::{BackupEntry, BackupStore, HealthProbe, ProgressSink, RemoteExecutor};
use crate::application::services::StepEvents;
use crate::application::services::service_control::control_service;
use crate::application::shell::RemoteShell;
use crate::application::task::{TaskHandle, spawn_operation};
use crate::domain::artifact::{ArtifactManifest, inspect_artifact};
use crate::domain::command::shell_quote;
use crate::domain::config::DeployConfig;
use crate::domain::deployment::{
    DeployStep, apply_outcome, backup_command, bootstrap_admin_command,
    daemon_reload_enable_command, extract_command, health_url, staging_path,
    validate_admin_email, validate_admin_password, validate_install_path, validate_version_label,
};
use crate::domain::service::{ServiceAction, render_unit, unit_path, validate_service_name};
use crate::domain::{DeployError, RemoteCommand};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const ROLLBACK_BUDGET: Duration = Duration::from_secs(5 * 60);

// ── Requests and results ──────────────────────────────────────────────────────

/// PocketBase superuser created on first deploy.
#[derive(Debug)]
pub struct AdminCredentials {
    pub email: String,
    pub password: SecretString,
}

/// Everything one run needs. The artifact is read by the caller so that a
/// bad file is rejected before anything is spawned.
pub struct DeployRequest {
    pub target: ServerTarget,
    pub app: ManagedApplication,
    pub version: ReleaseVersion,
    pub artifact: Vec<u8>,
    pub first_deploy: bool,
    pub credentials: Option<AdminCredentials>,
}

/// Terminal result of a run.
#[derive(Debug)]
pub struct DeployOutcome {
    pub record: DeploymentRecord,
    /// The application with `current_version` and `status` updated.
    pub app: ManagedApplication,
    pub backup: Option<BackupEntry>,
    pub error: Option<DeployError>,
}

impl DeployOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Handle to a running deployment.
#[derive(Debug)]
pub struct DeploymentTask {
    handle: TaskHandle<DeployOutcome>,
    record: watch::Receiver<DeploymentRecord>,
    app: ManagedApplication,
}

impl DeploymentTask {
    #[must_use]
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Latest snapshot of the record.
    #[must_use]
    pub fn record(&self) -> DeploymentRecord {
        self.record.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DeploymentRecord> {
        self.record.clone()
    }

    /// Ask the run to stop. It still finishes as `failed`, after a soft
    /// rollback if the old service had already been stopped.
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.handle.cancellation()
    }

    /// Wait for the run. The returned record is always terminal, even if the
    /// task died.
    pub async fn wait(self) -> DeployOutcome {
        match self.handle.wait().await {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut record = self.record.borrow().clone();
                if !record.is_terminal() {
                    let now = Utc::now();
                    record.append_log(now, &format!("Deployment aborted: {e}"));
                    if let Err(t) = record.finish(false, now) {
                        tracing::error!(error = %t, "could not close aborted deployment record");
                    }
                }
                DeployOutcome {
                    record,
                    app: self.app,
                    backup: None,
                    error: Some(e),
                }
            }
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DeploymentPipeline {
    executor: Arc<dyn RemoteExecutor>,
    sink: Arc<dyn ProgressSink>,
    health: Arc<dyn HealthProbe>,
    backups: Arc<dyn BackupStore>,
    settings: DeployConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl DeploymentPipeline {
    #[must_use]
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        sink: Arc<dyn ProgressSink>,
        health: Arc<dyn HealthProbe>,
        backups: Arc<dyn BackupStore>,
        settings: DeployConfig,
    ) -> Self {
        Self {
            executor,
            sink,
            health,
            backups,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Validate `request` and start a forward deployment.
    ///
    /// # Errors
    ///
    /// [`DeployError::Validation`] or [`DeployError::Precondition`] when the
    /// request is rejected; nothing remote has happened in that case.
    pub fn submit(&self, request: DeployRequest) -> Result<DeploymentTask, DeployError> {
        self.launch(request, DeploymentKind::Deploy)
    }

    /// Re-deploy a previously recorded version through the same pipeline.
    ///
    /// # Errors
    ///
    /// As for [`DeploymentPipeline::submit`]; also rejected when nothing has
    /// been deployed yet.
    pub fn rollback(&self, mut request: DeployRequest) -> Result<DeploymentTask, DeployError> {
        if request.app.current_version.is_none() {
            return Err(DeployError::Precondition(format!(
                "application '{}' has no deployed version to roll back from",
                request.app.name
            )));
        }
        request.first_deploy = false;
        request.credentials = None;
        self.launch(request, DeploymentKind::Rollback)
    }

    fn launch(&self, request: DeployRequest, kind: DeploymentKind) -> Result<DeploymentTask, DeployError> {
        let manifest = validate_request(&request)?;
        let lock = AppLock::acquire(&self.in_flight, &request.app.id)?;

        let id = uuid::Uuid::new_v4().to_string();
        let record = DeploymentRecord::pending(&id, &request.app.id, &request.version, kind);
        let (tx, rx) = watch::channel(record.clone());
        let app = request.app.clone();
        tracing::info!(
            deployment = %id,
            app = %request.app.name,
            version = %request.version.label,
            sha256 = %manifest.sha256,
            "deployment submitted"
        );

        let events = StepEvents::new(Arc::clone(&self.sink), deployment_progress(&id));
        let this = self.clone();
        let handle = spawn_operation(Some(id), move |ctx| async move {
            let _lock = lock;
            let run = Run {
                record,
                tx,
                events,
            };
            this.execute(ctx, request, run).await
        });
        Ok(DeploymentTask {
            handle,
            record: rx,
            app,
        })
    }

    async fn execute(&self, ctx: CallContext, job: DeployRequest, mut run: Run) -> DeployOutcome {
        if let Err(e) = run.record.start(Utc::now()) {
            tracing::error!(error = %e, "deployment record was not pending");
        }
        let verb = match run.record.kind {
            DeploymentKind::Deploy => "Deploying",
            DeploymentKind::Rollback => "Rolling back to",
        };
        run.log(&format!(
            "{verb} {} {} on {}",
            job.app.name,
            job.version.label,
            job.target.label()
        ));

        let mut state = RunState::default();
        let mut failure = None;
        let mut reached = 0;
        for step in DeployStep::plan(job.first_deploy) {
            if step == DeployStep::Complete {
                break;
            }
            run.events.running(step.name(), describe(step), reached);
            run.log(describe(step));
            match self.run_step(&ctx, &job, &run.record.id, step, &mut state).await {
                Ok(note) => {
                    if let Some(note) = note {
                        run.log(&note);
                    }
                    reached = step.percent();
                    run.events.success(step.name(), done(step), reached);
                }
                Err(e) => {
                    failure = Some((step, e));
                    break;
                }
            }
        }

        let (success, healthy_after, error) = match failure {
            None => (true, Some(true), None),
            Some((step, e)) => {
                run.events.failed(
                    step.name(),
                    format!("Deployment failed at {}", step.name()),
                    &e,
                    reached,
                );
                run.log(&format!("Step {} failed: {e}", step.name()));
                if ctx.is_cancelled() {
                    run.log("Deployment cancelled by request");
                }
                let healthy_after = if job.first_deploy {
                    state.service_touched.then_some(false)
                } else if step == DeployStep::StopService || step.triggers_soft_rollback() {
                    Some(
                        self.soft_rollback(&job, &state, step.triggers_soft_rollback(), &mut run)
                            .await,
                    )
                } else {
                    None
                };
                (false, healthy_after, Some(e.at_step(step.name())))
            }
        };

        let mut app = job.app.clone();
        apply_outcome(&mut app, success, &job.version.label, healthy_after);
        if success {
            run.log(&format!(
                "{} {} is live",
                job.app.name, job.version.label
            ));
        } else {
            run.log(&format!("Deployment failed; application is {}", app.status));
        }
        if let Err(e) = run.record.finish(success, Utc::now()) {
            tracing::error!(error = %e, "could not finish deployment record");
        }
        run.publish();
        if success {
            run.events.success(
                DeployStep::Complete.name(),
                "Deployment complete",
                DeployStep::Complete.percent(),
            );
        }

        DeployOutcome {
            record: run.record,
            app,
            backup: state.backup,
            error,
        }
    }

    /// Run one forward step; `Ok(Some(note))` adds a line to the record log.
    async fn run_step(
        &self,
        ctx: &CallContext,
        job: &DeployRequest,
        run_id: &str,
        step: DeployStep,
        state: &mut RunState,
    ) -> Result<Option<String>, DeployError> {
        let target = &job.target;
        let app = &job.app;
        let identity = target.operating_identity();
        let shell = RemoteShell::new(self.executor.as_ref(), ctx, target, identity);
        let owner = target.unprivileged_user.as_str();

        match step {
            DeployStep::Init => {
                shell
                    .sudo(&format!(
                        "install -d -m 755 -o {u} -g {u} {dir}",
                        u = shell_quote(owner),
                        dir = shell_quote(&app.install_path)
                    ))
                    .await?;
                Ok(Some(format!("Connected as {}", shell.username())))
            }
            DeployStep::Backup => {
                let archive = staging_path(run_id, "-backup.tar.gz");
                let out = shell.sudo(&backup_command(&app.install_path, &archive)).await?;
                if out.stdout.trim() == "empty" {
                    return Ok(Some("Nothing installed yet; no backup taken".to_string()));
                }
                let data = self
                    .executor
                    .download(ctx, target, identity, &archive)
                    .await?;
                if let Err(e) = shell.sudo(&format!("rm -f {}", shell_quote(&archive))).await {
                    tracing::warn!(error = %e, "could not remove remote backup archive");
                }
                let entry = self
                    .backups
                    .save(&app.id, app.current_version.as_deref(), &data)
                    .await?;
                let pruned = self
                    .backups
                    .prune(&app.id, self.settings.backup_retention)
                    .await?;
                if pruned > 0 {
                    tracing::debug!(app = %app.name, pruned, "pruned old backups");
                }
                let note = format!("Backup saved to {} ({} bytes)", entry.path.display(), data.len());
                state.backup = Some(entry);
                Ok(Some(note))
            }
            DeployStep::StopService => {
                match control_service(&shell, &app.service_name, ServiceAction::Stop).await {
                    Ok(()) => {
                        state.service_touched = true;
                        Ok(None)
                    }
                    Err(DeployError::ServiceNotFound(_)) => {
                        Ok(Some("Service not installed; nothing to stop".to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            DeployStep::Transfer => {
                state.service_touched = true;
                let staged = shell.stage(&job.artifact).await?;
                shell
                    .sudo(&extract_command(&app.install_path, &staged, owner))
                    .await?;
                Ok(Some(format!("Installed {} bytes into {}", job.artifact.len(), app.install_path)))
            }
            DeployStep::InstallService => {
                let unit = render_unit(&app.name, &app.install_path, owner, app.port);
                shell
                    .write_file(&unit_path(&app.service_name), unit.as_bytes(), 0o644, None)
                    .await?;
                shell
                    .sudo(&daemon_reload_enable_command(&app.service_name))
                    .await?;
                Ok(None)
            }
            DeployStep::BootstrapAdmin => {
                let creds = job.credentials.as_ref().ok_or_else(|| {
                    DeployError::Validation("first deploy requires admin credentials".to_string())
                })?;
                let secret = shell.stage(creds.password.expose_secret().as_bytes()).await?;
                let command = RemoteCommand::new(bootstrap_admin_command(
                    &app.install_path,
                    owner,
                    &creds.email,
                    &secret,
                ))
                .sudo()
                .sensitive();
                shell.run_checked(&command).await?;
                Ok(Some(format!("Superuser {} ready", creds.email)))
            }
            DeployStep::StartService => {
                control_service(&shell, &app.service_name, ServiceAction::Restart).await?;
                Ok(None)
            }
            DeployStep::HealthCheck => {
                let attempts = self.wait_healthy(ctx, app).await?;
                Ok(Some(format!("Health check passed after {attempts} attempt(s)")))
            }
            DeployStep::SoftRollback | DeployStep::Complete => Ok(None),
        }
    }

    /// Probe the health endpoint until it answers 2xx or attempts run out.
    async fn wait_healthy(&self, ctx: &CallContext, app: &ManagedApplication) -> Result<u32, DeployError> {
        let url = health_url(&app.domain, &self.settings.health_path);
        let attempts = self.settings.health_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            ctx.check("health check")?;
            match self.health.probe(&url, PROBE_TIMEOUT).await {
                Ok(code) if (200..300).contains(&code) => return Ok(attempt),
                Ok(code) => last = format!("HTTP {code}"),
                Err(e) => last = e,
            }
            tracing::debug!(url = %url, attempt, last = %last, "health check not passing yet");
            if attempt < attempts {
                ctx.sleep(self.settings.health_interval()).await?;
            }
        }
        Err(DeployError::Connection {
            target: url,
            reason: format!("no healthy response after {attempts} attempts (last: {last})"),
        })
    }

    /// Put the previous version back and restart it, under a fresh context
    /// so a cancelled run can still clean up. Returns whether the restored
    /// service passed its health check.
    async fn soft_rollback(
        &self,
        job: &DeployRequest,
        state: &RunState,
        restore_files: bool,
        run: &mut Run,
    ) -> bool {
        let step = DeployStep::SoftRollback;
        run.events.running(step.name(), "Restoring previous version", step.percent());
        run.log("Attempting soft rollback");

        let ctx = CallContext::new().with_timeout(ROLLBACK_BUDGET);
        let target = &job.target;
        let app = &job.app;
        let result = async {
            let shell = RemoteShell::new(self.executor.as_ref(), &ctx, target, target.operating_identity());
            if restore_files && let Some(entry) = &state.backup {
                let data = self.backups.load(entry).await?;
                let staged = shell.stage(&data).await?;
                shell
                    .sudo(&extract_command(&app.install_path, &staged, &target.unprivileged_user))
                    .await?;
            }
            control_service(&shell, &app.service_name, ServiceAction::Restart).await?;
            self.wait_healthy(&ctx, app).await
        }
        .await;

        match result {
            Ok(_) => {
                let restored = app.current_version.as_deref().unwrap_or("previous version");
                run.log(&format!("Soft rollback restored {restored}; service is healthy"));
                run.events.success(step.name(), "Previous version restored", step.percent());
                true
            }
            Err(e) => {
                run.log(&format!("Soft rollback failed: {e}"));
                run.events.failed(step.name(), "Soft rollback failed", &e, step.percent());
                false
            }
        }
    }
}

// ── Run bookkeeping ───────────────────────────────────────────────────────────

struct Run {
    record: DeploymentRecord,
    tx: watch::Sender<DeploymentRecord>,
    events: StepEvents,
}

impl Run {
    fn log(&mut self, line: &str) {
        tracing::info!(deployment = %self.record.id, "{line}");
        self.record.append_log(Utc::now(), line);
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.record.clone());
    }
}

#[derive(Default)]
struct RunState {
    backup: Option<BackupEntry>,
    /// The old service was stopped or its files replaced.
    service_touched: bool,
}

/// Marks an application as having a run in flight until dropped.
#[derive(Debug)]
struct AppLock {
    held: Arc<Mutex<HashSet<String>>>,
    app_id: String,
}

impl AppLock {
    fn acquire(held: &Arc<Mutex<HashSet<String>>>, app_id: &str) -> Result<Self, DeployError> {
        let mut set = held.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(app_id.to_string()) {
            return Err(DeployError::Precondition(format!(
                "a deployment is already running for application {app_id}"
            )));
        }
        Ok(Self {
            held: Arc::clone(held),
            app_id: app_id.to_string(),
        })
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.app_id);
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

fn validate_request(request: &DeployRequest) -> Result<ArtifactManifest, DeployError> {
    let DeployRequest {
        target,
        app,
        version,
        artifact,
        first_deploy,
        credentials,
    } = request;

    if version.app_id != app.id {
        return Err(DeployError::Precondition(format!(
            "version {} does not belong to application '{}'",
            version.label, app.name
        )));
    }
    if app.server_id != target.id {
        return Err(DeployError::Precondition(format!(
            "application '{}' is not hosted on server '{}'",
            app.name,
            target.label()
        )));
    }
    if !target.setup_complete {
        return Err(DeployError::Precondition(format!(
            "server '{}' must be set up before deploying",
            target.label()
        )));
    }
    validate_install_path(&app.install_path)?;
    validate_service_name(&app.service_name)?;
    validate_version_label(&version.label)?;

    if *first_deploy {
        let creds = credentials.as_ref().ok_or_else(|| {
            DeployError::Validation("first deploy requires admin credentials".to_string())
        })?;
        validate_admin_email(&creds.email)?;
        validate_admin_password(creds.password.expose_secret())?;
    }

    inspect_artifact(artifact)
}

fn describe(step: DeployStep) -> &'static str {
    match step {
        DeployStep::Init => "Preparing install directory",
        DeployStep::Backup => "Backing up current version",
        DeployStep::StopService => "Stopping service",
        DeployStep::Transfer => "Uploading and unpacking release",
        DeployStep::InstallService => "Installing systemd unit",
        DeployStep::BootstrapAdmin => "Creating superuser",
        DeployStep::StartService => "Starting service",
        DeployStep::HealthCheck => "Waiting for health check",
        DeployStep::SoftRollback => "Restoring previous version",
        DeployStep::Complete => "Finishing",
    }
}

fn done(step: DeployStep) -> &'static str {
    match step {
        DeployStep::Init => "Install directory ready",
        DeployStep::Backup => "Backup complete",
        DeployStep::StopService => "Service stopped",
        DeployStep::Transfer => "Release unpacked",
        DeployStep::InstallService => "systemd unit installed",
        DeployStep::BootstrapAdmin => "Superuser ready",
        DeployStep::StartService => "Service started",
        DeployStep::HealthCheck => "Service is healthy",
        DeployStep::SoftRollback => "Previous version restored",
        DeployStep::Complete => "Deployment complete",
    }
}
