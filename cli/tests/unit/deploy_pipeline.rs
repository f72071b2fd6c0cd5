//! Deployment pipeline: forward runs, soft rollback and request checks.

#![allow(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use deployer_common::{AppStatus, DeploymentKind, DeploymentStatus, ManagedApplication, ProgressStatus};
use pb_deployer::application::services::{
    AdminCredentials, DeployRequest, DeploymentPipeline, SecurityManager, SetupManager,
};
use pb_deployer::domain::DeployError;
use pb_deployer::domain::config::{DeployConfig, SecurityConfig};
use pb_deployer::domain::setup::SetupOptions;
use pb_deployer::infra::backups::FsBackupStore;
use pb_deployer::infra::executor::PooledExecutor;
use secrecy::SecretString;
use tempfile::TempDir;

use crate::mocks::{
    FakeHost, MockHealth, RecordingSink, app, executor, fail, fresh_target, health_always, health_sequence,
    locked_target, ok, public_only_archive, release_archive, target, version,
};

const PASSWORD: &str = "correct-horse-battery";

struct Harness {
    host: FakeHost,
    executor: Arc<PooledExecutor>,
    sink: Arc<RecordingSink>,
    pipeline: DeploymentPipeline,
    _backups: TempDir,
}

fn harness(health: MockHealth) -> Harness {
    let host = FakeHost::new();
    // Contents of the remote backup archive.
    host.serve_downloads(&release_archive());
    harness_on(host, health)
}

fn harness_on(host: FakeHost, health: MockHealth) -> Harness {
    let executor = executor(&host);
    let backups = tempfile::tempdir().expect("tempdir");
    let sink = Arc::new(RecordingSink::default());
    let pipeline = DeploymentPipeline::new(
        executor.clone(),
        sink.clone(),
        Arc::new(health),
        Arc::new(FsBackupStore::with_root(backups.path().to_path_buf())),
        DeployConfig {
            health_attempts: 2,
            health_interval_secs: 0,
            ..DeployConfig::default()
        },
    );
    Harness {
        host,
        executor,
        sink,
        pipeline,
        _backups: backups,
    }
}

fn redeploy(label: &str) -> DeployRequest {
    DeployRequest {
        target: target(),
        app: app(),
        version: version(label),
        artifact: release_archive(),
        first_deploy: false,
        credentials: None,
    }
}

fn first_deploy() -> DeployRequest {
    DeployRequest {
        app: ManagedApplication {
            current_version: None,
            status: AppStatus::Unknown,
            ..app()
        },
        first_deploy: true,
        credentials: Some(AdminCredentials {
            email: "admin@blog.example.com".to_string(),
            password: SecretString::from(PASSWORD.to_string()),
        }),
        ..redeploy("1.0.0")
    }
}

#[tokio::test]
async fn redeploy_backs_up_swaps_and_goes_live() {
    let mut health = MockHealth::new();
    health
        .expect_probe()
        .withf(|url, _| url == "https://blog.example.com/api/health")
        .returning(|_, _| Ok(200));
    let h = harness(health);

    let task = h.pipeline.submit(redeploy("1.1.0")).expect("accepted");
    let id = task.id().to_string();
    let outcome = task.wait().await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.record.status(), DeploymentStatus::Success);
    assert_eq!(outcome.app.current_version.as_deref(), Some("1.1.0"));
    assert_eq!(outcome.app.status, AppStatus::Online);

    let backup = outcome.backup.expect("backup taken");
    assert_eq!(backup.version_label.as_deref(), Some("1.0.0"));
    assert!(backup.path.exists());

    assert!(h.host.ran("systemctl stop pocketbase-blog"));
    assert!(h.host.ran("tar -xzf /tmp/pbdeploy-"));
    assert!(h.host.ran("systemctl restart pocketbase-blog"));

    assert_eq!(
        h.sink.topics().into_iter().collect::<Vec<_>>(),
        vec![format!("deployment_progress_{id}")]
    );
    let last = h.sink.last().expect("events");
    assert_eq!((last.step.as_str(), last.progress_percent), ("complete", 100));
}

#[tokio::test]
async fn first_deploy_installs_unit_and_superuser_without_leaking_the_password() {
    let h = harness(health_always(200));

    let outcome = h.pipeline.submit(first_deploy()).expect("accepted").wait().await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert!(outcome.backup.is_none());
    assert!(!h.host.ran("systemctl stop"));
    assert!(h.host.ran("runuser -u pocketbase -- ./pocketbase superuser upsert admin@blog.example.com"));
    assert!(h.host.ran("systemctl daemon-reload && systemctl enable pocketbase-blog"));

    let unit = h
        .host
        .uploads()
        .iter()
        .filter_map(|p| h.host.file(p))
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .find(|t| t.contains("[Service]"))
        .expect("unit uploaded");
    assert!(unit.contains("ExecStart=/opt/pocketbase/apps/blog/pocketbase serve --http=127.0.0.1:8090"));

    assert!(!h.host.commands().iter().any(|c| c.contains(PASSWORD)));
    let secret = h
        .host
        .uploads()
        .into_iter()
        .find(|p| h.host.file(p).as_deref() == Some(PASSWORD.as_bytes()))
        .expect("password staged as a file");
    assert!(h.host.ran(&format!("\"$(cat {secret})\"")));
    assert!(h.host.ran(&format!("rm -f {secret}; exit $status")));

    assert!(!outcome.record.log().contains(PASSWORD));
    assert!(
        h.sink
            .events()
            .iter()
            .all(|(_, e)| !e.message.contains(PASSWORD) && !e.detail.as_deref().unwrap_or("").contains(PASSWORD))
    );
    assert_eq!(outcome.app.current_version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn failed_health_check_rolls_back_to_the_previous_version() {
    let h = harness(health_sequence(503, 2, 200));

    let outcome = h.pipeline.submit(redeploy("1.1.0")).expect("accepted").wait().await;

    let err = outcome.error.as_ref().expect("failed");
    assert_eq!(err.step(), Some("health_check"));
    assert_eq!(outcome.record.status(), DeploymentStatus::Failed);
    assert_eq!(outcome.app.current_version.as_deref(), Some("1.0.0"));
    assert_eq!(outcome.app.status, AppStatus::Online);
    assert!(outcome.record.log().contains("Soft rollback restored 1.0.0"));

    let extracts = h.host.commands().iter().filter(|c| c.contains("tar -xzf")).count();
    assert_eq!(extracts, 2, "release, then the backup");
    assert!(
        h.sink
            .steps()
            .contains(&("soft_rollback".to_string(), ProgressStatus::Success))
    );
}

#[tokio::test]
async fn failed_rollback_leaves_the_application_offline() {
    let h = harness(health_always(503));

    let outcome = h.pipeline.submit(redeploy("1.1.0")).expect("accepted").wait().await;

    assert!(!outcome.succeeded());
    assert_eq!(outcome.app.status, AppStatus::Offline);
    assert_eq!(outcome.app.current_version.as_deref(), Some("1.0.0"));
    assert!(outcome.record.log().contains("Soft rollback failed"));
    assert!(
        h.sink
            .steps()
            .contains(&("soft_rollback".to_string(), ProgressStatus::Failed))
    );
}

#[tokio::test]
async fn failure_before_the_service_is_touched_keeps_its_status() {
    let h = harness(health_always(200));
    h.host.on("install -d", crate::mocks::fail(1, "Permission denied"));

    let outcome = h.pipeline.submit(redeploy("1.1.0")).expect("accepted").wait().await;

    assert_eq!(outcome.error.as_ref().and_then(DeployError::step), Some("init"));
    assert_eq!(outcome.app.status, AppStatus::Online);
    assert!(!h.host.ran("systemctl stop"));
    assert!(!h.host.ran("systemctl restart"));
}

#[tokio::test]
async fn second_submit_for_the_same_app_is_rejected() {
    let h = harness(health_always(200));
    h.host.set_exec_delay(Some(Duration::from_millis(50)));

    let running = h.pipeline.submit(redeploy("1.1.0")).expect("accepted");
    let err = h.pipeline.submit(redeploy("1.2.0")).err().expect("overlap");
    assert!(matches!(err, DeployError::Precondition(ref m) if m.contains("already running")));

    assert!(running.wait().await.succeeded());
    h.host.set_exec_delay(None);
    let next = h.pipeline.submit(redeploy("1.2.0")).expect("lock released");
    assert!(next.wait().await.succeeded());
}

#[tokio::test]
async fn cancelled_run_finishes_failed() {
    let h = harness(health_always(200));
    h.host.set_exec_delay(Some(Duration::from_millis(200)));

    let task = h.pipeline.submit(redeploy("1.1.0")).expect("accepted");
    task.cancel();
    let outcome = task.wait().await;

    let err = outcome.error.as_ref().expect("cancelled");
    assert!(matches!(err.root(), DeployError::Cancelled));
    assert_eq!(outcome.record.status(), DeploymentStatus::Failed);
    assert!(outcome.record.completed_at().is_some());
    assert_eq!(outcome.app.current_version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn locked_target_deploys_as_the_service_account() {
    let h = harness(health_always(200));

    let outcome = h
        .pipeline
        .submit(DeployRequest {
            target: locked_target(),
            ..redeploy("1.1.0")
        })
        .expect("accepted")
        .wait()
        .await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert!(h.host.logins().iter().all(|u| u == "pocketbase"));
    assert!(h.host.ran("sudo -n sh -c 'systemctl stop pocketbase-blog'"));
}

#[tokio::test]
async fn rollback_redeploys_an_older_version() {
    let h = harness(health_always(200));

    let task = h.pipeline.rollback(redeploy("0.9.0")).expect("accepted");
    assert_eq!(task.record().kind, DeploymentKind::Rollback);
    let outcome = task.wait().await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.app.current_version.as_deref(), Some("0.9.0"));
    assert!(outcome.record.log().contains("Rolling back to blog 0.9.0"));
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_connecting() {
    let h = harness(health_always(200));

    let bad_archive = h
        .pipeline
        .submit(DeployRequest {
            artifact: b"definitely not a tarball".to_vec(),
            ..redeploy("1.1.0")
        })
        .err()
        .expect("bad archive");
    assert!(matches!(bad_archive, DeployError::Validation(_)));

    let no_credentials = h
        .pipeline
        .submit(DeployRequest {
            credentials: None,
            ..first_deploy()
        })
        .err()
        .expect("credentials missing");
    assert!(matches!(no_credentials, DeployError::Validation(_)));

    let short_password = h
        .pipeline
        .submit(DeployRequest {
            credentials: Some(AdminCredentials {
                email: "admin@blog.example.com".to_string(),
                password: SecretString::from("short".to_string()),
            }),
            ..first_deploy()
        })
        .err()
        .expect("password too short");
    assert!(matches!(short_password, DeployError::Validation(_)));

    let not_set_up = h
        .pipeline
        .submit(DeployRequest {
            target: fresh_target(),
            ..redeploy("1.1.0")
        })
        .err()
        .expect("not set up");
    assert!(matches!(not_set_up, DeployError::Precondition(_)));

    let nothing_deployed = h
        .pipeline
        .rollback(DeployRequest {
            app: ManagedApplication {
                current_version: None,
                ..app()
            },
            ..redeploy("0.9.0")
        })
        .err()
        .expect("nothing to roll back from");
    assert!(matches!(nothing_deployed, DeployError::Precondition(_)));

    assert_eq!(h.host.attempts(), 0);
}

#[tokio::test]
async fn failed_release_can_be_rolled_back_explicitly() {
    // Two failing checks for the release, two for the soft rollback.
    let h = harness(health_sequence(503, 4, 200));

    let failed = h.pipeline.submit(redeploy("1.1.0")).expect("accepted").wait().await;
    assert!(!failed.succeeded());
    assert_eq!(failed.app.status, AppStatus::Offline);

    let task = h
        .pipeline
        .rollback(DeployRequest {
            app: failed.app.clone(),
            ..redeploy("1.0.0")
        })
        .expect("accepted");
    assert_eq!(task.record().kind, DeploymentKind::Rollback);
    let outcome = task.wait().await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(outcome.record.status(), DeploymentStatus::Success);
    assert_eq!(outcome.app.status, AppStatus::Online);
    assert_eq!(outcome.app.current_version.as_deref(), Some("1.0.0"));
    assert!(outcome.record.log().contains("Rolling back to blog 1.0.0"));
}

const SSHD_CONFIG: &str = "Include /etc/ssh/sshd_config.d/*.conf\n\
                           PermitRootLogin yes\n\
                           PasswordAuthentication yes\n\
                           UsePAM yes\n";

const SSHD_EFFECTIVE: &str = "port 22\n\
                              permitrootlogin no\n\
                              pubkeyauthentication yes\n\
                              passwordauthentication no\n\
                              kbdinteractiveauthentication no\n";

const UFW_ACTIVE: &str = "Status: active\n\n\
                          To                         Action      From\n\
                          --                         ------      ----\n\
                          22/tcp                     ALLOW       Anywhere\n\
                          80/tcp                     ALLOW       Anywhere\n\
                          443/tcp                    ALLOW       Anywhere\n";

#[tokio::test]
async fn fresh_server_is_set_up_locked_down_and_deployed() {
    let host = FakeHost::new();
    host.on("cat /etc/ssh/sshd_config", ok(SSHD_CONFIG))
        .on("test -e /etc/ssh/sshd_config.pb-deployer", fail(1, ""))
        .on("sshd -T", ok(SSHD_EFFECTIVE))
        .on("ufw status", ok(UFW_ACTIVE));
    let h = harness_on(host, health_always(200));
    let setup = SetupManager::new(
        h.executor.clone(),
        h.sink.clone(),
        SecurityConfig::default().allowed_ports,
    );
    let security = SecurityManager::new(h.executor.clone(), h.sink.clone(), SecurityConfig::default());

    let server = setup
        .start(
            fresh_target(),
            SetupOptions {
                public_keys: vec![
                    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHk1cG9ja2V0YmFzZS10ZXN0LWtleS0wMQ deploy@laptop".to_string(),
                ],
                configure_firewall: false,
                packages: vec!["curl".to_string()],
            },
        )
        .expect("setup accepted")
        .wait()
        .await
        .expect("task")
        .expect("setup");
    assert!(server.setup_complete);

    let server = security
        .start(server)
        .expect("lockdown accepted")
        .wait()
        .await
        .expect("task")
        .expect("lockdown");
    assert!(server.security_locked);

    let first = h
        .pipeline
        .submit(DeployRequest {
            target: server.clone(),
            ..first_deploy()
        })
        .expect("accepted")
        .wait()
        .await;
    assert!(first.succeeded(), "{:?}", first.error);
    assert_eq!(first.app.status, AppStatus::Online);
    assert_eq!(first.app.current_version.as_deref(), Some("1.0.0"));
    assert!(
        h.host
            .commands_as("pocketbase")
            .iter()
            .any(|c| c.contains("superuser upsert admin@blog.example.com"))
    );

    let attempts = h.host.attempts();
    let commands = h.host.commands().len();
    let rejected = h
        .pipeline
        .submit(DeployRequest {
            target: server,
            app: first.app.clone(),
            artifact: public_only_archive(),
            ..redeploy("1.1.0")
        })
        .err()
        .expect("archive without a binary");
    assert!(matches!(rejected, DeployError::Validation(_)));
    assert_eq!(h.host.attempts(), attempts);
    assert_eq!(h.host.commands().len(), commands);
}
