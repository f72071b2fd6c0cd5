//! Server setup against the scripted host.

#![allow(clippy::expect_used)]

use std::sync::Arc;

use deployer_common::ProgressStatus;
use pb_deployer::application::CallContext;
use pb_deployer::application::services::SetupManager;
use pb_deployer::domain::DeployError;
use pb_deployer::domain::config::SecurityConfig;
use pb_deployer::domain::setup::{SUDOERS_PATH, SetupOptions};

use crate::mocks::{FakeHost, RecordingSink, executor, fail, fresh_target, locked_target, ok, target};

const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHk1cG9ja2V0YmFzZS10ZXN0LWtleS0wMQ deploy@laptop";

fn manager(host: &FakeHost) -> (SetupManager, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let manager = SetupManager::new(
        executor(host),
        sink.clone(),
        SecurityConfig::default().allowed_ports,
    );
    (manager, sink)
}

fn options() -> SetupOptions {
    SetupOptions {
        public_keys: vec![KEY.to_string()],
        configure_firewall: false,
        packages: vec!["curl".to_string(), "ufw".to_string()],
    }
}

/// A host where the account is missing and one package needs installing.
fn fresh_host() -> FakeHost {
    let host = FakeHost::new();
    host.on("id -u", fail(1, "id: 'pocketbase': no such user"))
        .on("dpkg -s", ok("ufw\n"));
    host
}

#[tokio::test]
async fn setup_creates_account_installs_packages_and_marks_target() {
    let host = fresh_host();
    let (manager, sink) = manager(&host);

    let handle = manager.start(fresh_target(), options()).expect("accepted");
    let done = handle.wait().await.expect("task").expect("setup");

    assert!(done.setup_complete);
    assert!(host.ran("useradd --create-home --shell /bin/bash pocketbase"));
    assert!(host.ran("apt-get install -y -qq --no-install-recommends ufw"));
    assert!(host.ran("visudo -cf"));
    assert!(host.ran("chown pocketbase:pocketbase /opt/pocketbase"));
    assert!(!host.ran("ufw --force enable"), "firewall was not requested");
    assert!(host.logins().iter().all(|u| u == "root"));

    let keys = host
        .file(&host.uploads()[0])
        .map(|b| String::from_utf8(b).expect("utf8"))
        .expect("authorized_keys staged");
    assert!(keys.contains(KEY));

    let last = sink.last().expect("events");
    assert_eq!((last.step.as_str(), last.progress_percent), ("complete", 100));
    assert_eq!(sink.topics().into_iter().collect::<Vec<_>>(), vec!["server_setup_srv1"]);
}

#[tokio::test]
async fn existing_account_and_packages_are_left_alone() {
    let host = FakeHost::new();
    let (manager, _) = manager(&host);
    let mut target = fresh_target();

    manager
        .run(&CallContext::new(), &mut target, &options())
        .await
        .expect("setup");

    assert!(target.setup_complete);
    assert!(!host.ran("useradd"));
    assert!(!host.ran("apt-get install"));
}

#[tokio::test]
async fn firewall_step_runs_when_requested() {
    let host = fresh_host();
    let (manager, sink) = manager(&host);
    let mut target = fresh_target();

    manager
        .run(
            &CallContext::new(),
            &mut target,
            &SetupOptions {
                configure_firewall: true,
                ..options()
            },
        )
        .await
        .expect("setup");

    assert!(host.ran("ufw allow 22/tcp"));
    assert!(host.ran("ufw --force enable"));
    assert!(
        sink.steps()
            .contains(&("configure_firewall".to_string(), ProgressStatus::Success))
    );
}

#[tokio::test]
async fn failure_names_the_step_and_leaves_target_unmarked() {
    let host = fresh_host();
    host.on("apt-get install", fail(100, "E: Unable to locate package"));
    let (manager, sink) = manager(&host);
    let mut target = fresh_target();

    let err = manager
        .run(&CallContext::new(), &mut target, &options())
        .await
        .expect_err("install fails");

    assert_eq!(err.step(), Some("install_packages"));
    assert!(matches!(err.root(), DeployError::RemoteCommand { exit_code: 100, .. }));
    assert!(!target.setup_complete);
    assert!(!host.ran("mkdir -p"), "later steps must not run");

    let failed = sink.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].step, "install_packages");
    assert_eq!(failed[0].progress_percent, 25);
}

#[tokio::test]
async fn unsupported_distribution_is_a_precondition_failure() {
    let host = FakeHost::new();
    host.on("command -v apt-get", fail(1, ""));
    let (manager, _) = manager(&host);
    let mut target = fresh_target();

    let err = manager
        .run(&CallContext::new(), &mut target, &options())
        .await
        .expect_err("no apt");

    assert_eq!(err.step(), Some("init"));
    assert!(matches!(err.root(), DeployError::Precondition(_)));
}

#[tokio::test]
async fn sudoers_is_not_installed_when_visudo_rejects_it() {
    let host = fresh_host();
    host.on("visudo -cf", fail(1, "syntax error"));
    let (manager, _) = manager(&host);
    let mut target = fresh_target();

    let err = manager
        .run(&CallContext::new(), &mut target, &options())
        .await
        .expect_err("visudo fails");

    assert_eq!(err.step(), Some("create_user"));
    assert!(!host.ran(SUDOERS_PATH), "the live sudoers path must stay untouched");
}

#[tokio::test]
async fn rejected_sudoers_reports_visudo_even_if_scratch_cleanup_fails() {
    let host = fresh_host();
    host.on("visudo -cf", fail(1, "syntax error"))
        .on("rm -f /tmp/pbdeploy-", fail(1, "Operation not permitted"))
        .once("install -m 600", ok(""));
    let (manager, _) = manager(&host);
    let mut target = fresh_target();

    let err = manager
        .run(&CallContext::new(), &mut target, &options())
        .await
        .expect_err("visudo fails");

    assert_eq!(err.step(), Some("create_user"));
    let root = err.root().to_string();
    assert!(root.contains("syntax error"), "{root}");
    assert!(host.ran("rm -f /tmp/pbdeploy-"));
    assert!(!host.ran(SUDOERS_PATH));
}

#[tokio::test]
async fn keys_default_to_those_the_privileged_login_trusts() {
    let host = fresh_host();
    host.on("cat ~/.ssh/authorized_keys", ok(&format!("# comment\n{KEY}\n")));
    let (manager, _) = manager(&host);
    let mut target = fresh_target();

    manager
        .run(
            &CallContext::new(),
            &mut target,
            &SetupOptions {
                public_keys: Vec::new(),
                ..options()
            },
        )
        .await
        .expect("setup");

    let staged = host.file(&host.uploads()[0]).expect("authorized_keys staged");
    assert!(String::from_utf8(staged).expect("utf8").contains(KEY));
}

#[tokio::test]
async fn rejected_requests_make_no_remote_calls() {
    let host = FakeHost::new();
    let (manager, _) = manager(&host);

    let already = manager.start(target(), options()).err().expect("already set up");
    assert!(matches!(already, DeployError::Precondition(_)));

    let locked = manager
        .start(
            deployer_common::ServerTarget {
                setup_complete: false,
                ..locked_target()
            },
            options(),
        )
        .err()
        .expect("locked");
    assert!(matches!(locked, DeployError::Precondition(_)));

    let bad_key = manager
        .start(
            fresh_target(),
            SetupOptions {
                public_keys: vec!["not a key".to_string()],
                ..options()
            },
        )
        .err()
        .expect("bad key");
    assert!(matches!(bad_key, DeployError::Validation(_)));

    assert_eq!(host.attempts(), 0);
}
