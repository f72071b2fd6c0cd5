//! Security lockdown against the scripted host.

#![allow(clippy::expect_used)]

use std::sync::Arc;

use deployer_common::ServerTarget;
use pb_deployer::application::CallContext;
use pb_deployer::application::services::SecurityManager;
use pb_deployer::domain::DeployError;
use pb_deployer::domain::config::SecurityConfig;
use pb_deployer::domain::security::{JAIL_LOCAL, PortRule, SSHD_DROP_IN};

use crate::mocks::{FakeHost, RecordingSink, Refusal, executor, fail, fresh_target, locked_target, ok, target};

const STOCK_SSHD: &str = "Include /etc/ssh/sshd_config.d/*.conf\n\
                          PermitRootLogin yes\n\
                          PasswordAuthentication yes\n\
                          UsePAM yes\n";

const HARDENED_SSHD_T: &str = "port 22\n\
                               permitrootlogin no\n\
                               pubkeyauthentication yes\n\
                               passwordauthentication no\n\
                               kbdinteractiveauthentication no\n";

const UFW_ACTIVE: &str = "Status: active\n\n\
                          To                         Action      From\n\
                          --                         ------      ----\n\
                          22/tcp                     ALLOW       Anywhere\n\
                          80/tcp                     ALLOW       Anywhere\n\
                          443/tcp                    ALLOW       Anywhere\n\
                          22/tcp (v6)                ALLOW       Anywhere (v6)\n";

/// A set-up host whose effective configuration matches the hardened one.
fn compliant_host() -> FakeHost {
    let host = FakeHost::new();
    host.on("cat /etc/ssh/sshd_config", ok(STOCK_SSHD))
        .on("test -e /etc/ssh/sshd_config.pb-deployer", fail(1, ""))
        .on("sshd -T", ok(HARDENED_SSHD_T))
        .on("ufw status", ok(UFW_ACTIVE));
    host
}

fn manager(host: &FakeHost) -> (SecurityManager, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let manager = SecurityManager::new(executor(host), sink.clone(), SecurityConfig::default());
    (manager, sink)
}

fn uploaded_texts(host: &FakeHost) -> Vec<String> {
    host.uploads()
        .iter()
        .filter_map(|p| host.file(p))
        .map(|b| String::from_utf8(b).expect("utf8"))
        .collect()
}

#[tokio::test]
async fn lockdown_hardens_sshd_firewall_and_bans() {
    let host = compliant_host();
    let (manager, sink) = manager(&host);

    let handle = manager.start(target()).expect("accepted");
    let locked = handle.wait().await.expect("task").expect("lockdown");

    assert!(locked.security_locked);
    assert!(host.ran("cp -p /etc/ssh/sshd_config /etc/ssh/sshd_config.pb-deployer."));
    assert!(host.ran("sshd -t -f /tmp/pbdeploy-"));
    assert!(host.ran(SSHD_DROP_IN));
    assert!(host.ran("systemctl reload ssh"));

    let texts = uploaded_texts(&host);
    assert!(texts.iter().any(|t| t.contains("PermitRootLogin no") && t.contains("PasswordAuthentication no")));
    assert!(texts.iter().any(|t| t.contains("maxretry = 5") && t.contains("[sshd]")));

    let service_account = host.commands_as("pocketbase");
    assert!(service_account.iter().any(|c| c.contains("ufw --force enable")));
    assert!(service_account.iter().any(|c| c.contains(JAIL_LOCAL)));
    assert!(
        !host.commands_as("root").iter().any(|c| c.contains("ufw")),
        "firewall changes run after root login is disabled"
    );
    assert_eq!(host.closed(), 1, "privileged session is dropped afterwards");

    let last = sink.last().expect("events");
    assert_eq!((last.step.as_str(), last.progress_percent), ("complete", 100));
}

#[tokio::test]
async fn service_account_without_access_stops_before_any_change() {
    let host = compliant_host();
    host.refuse("pocketbase", Refusal::Auth);
    let (manager, sink) = manager(&host);
    let mut target = target();

    let err = manager
        .run(&CallContext::new(), &mut target)
        .await
        .expect_err("no service account access");

    assert_eq!(err.step(), Some("verify_access"));
    assert!(matches!(err.root(), DeployError::Precondition(m) if m.contains("re-run setup")));
    assert!(!target.security_locked);
    assert!(!host.ran("sshd_config"), "sshd must not be touched");

    let failed = sink.failed();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].message.contains("the host was not changed"));
}

#[tokio::test]
async fn verification_mismatch_reports_applied_steps() {
    let host = compliant_host();
    host.on("sshd -T", ok("permitrootlogin yes\npasswordauthentication no\npubkeyauthentication yes\n"));
    let (manager, sink) = manager(&host);
    let mut target = target();

    let err = manager
        .run(&CallContext::new(), &mut target)
        .await
        .expect_err("sshd still permits root");

    assert_eq!(err.step(), Some("verify"));
    assert!(err.to_string().contains("PermitRootLogin=yes"));
    assert!(!target.security_locked);
    let failed = sink.failed();
    assert!(failed[0].message.contains(
        "already applied: disable_password_auth, disable_root_login, configure_firewall, install_ban_policy"
    ));
}

#[tokio::test]
async fn inactive_firewall_fails_verification() {
    let host = compliant_host();
    host.on("ufw status", ok("Status: inactive\n"));
    let (manager, _) = manager(&host);
    let mut target = target();

    let err = manager
        .run(&CallContext::new(), &mut target)
        .await
        .expect_err("firewall inactive");

    assert_eq!(err.step(), Some("verify"));
    assert!(err.to_string().contains("firewall is not active"));
}

#[tokio::test]
async fn rejected_drop_in_is_removed_and_sshd_not_reloaded() {
    let host = compliant_host();
    host.on("sshd -t", fail(255, "Bad configuration option"))
        .on("sshd -t -f", ok(""));
    let (manager, _) = manager(&host);
    let mut target = target();

    let err = manager
        .run(&CallContext::new(), &mut target)
        .await
        .expect_err("drop-in rejected");

    assert_eq!(err.step(), Some("disable_password_auth"));
    assert!(host.ran(&format!("rm -f {SSHD_DROP_IN}")));
    assert!(!host.ran("systemctl reload"));
}

#[tokio::test]
async fn failed_drop_in_cleanup_still_reports_the_rejection() {
    let host = compliant_host();
    host.on("sshd -t", fail(255, "Bad configuration option"))
        .on("sshd -t -f", ok(""))
        .on(&format!("rm -f {SSHD_DROP_IN}"), fail(1, "Read-only file system"));
    let (manager, _) = manager(&host);
    let mut target = target();

    let err = manager
        .run(&CallContext::new(), &mut target)
        .await
        .expect_err("drop-in rejected");

    assert_eq!(err.step(), Some("disable_password_auth"));
    let root = err.root().to_string();
    assert!(root.contains("Bad configuration option"), "{root}");
    assert!(!root.contains("Read-only"), "{root}");
    assert!(!host.ran("systemctl reload"));
}

#[tokio::test]
async fn rejected_requests_make_no_remote_calls() {
    let host = FakeHost::new();
    let (manager, _) = manager(&host);

    let locked = manager.start(locked_target()).err().expect("already locked");
    assert!(matches!(locked, DeployError::Precondition(m) if m.contains("already locked")));

    let fresh = manager.start(fresh_target()).err().expect("not set up");
    assert!(matches!(fresh, DeployError::Precondition(m) if m.contains("set up before lockdown")));

    let no_ssh = SecurityManager::new(
        executor(&host),
        Arc::new(RecordingSink::default()),
        SecurityConfig {
            allowed_ports: vec![PortRule::tcp(443)],
            ..SecurityConfig::default()
        },
    );
    let err = no_ssh.start(target()).err().expect("ssh port missing");
    assert!(matches!(err, DeployError::Validation(_)));

    let custom_port = ServerTarget {
        port: 2222,
        ..target()
    };
    let err = manager.start(custom_port).err().expect("2222 not allowed");
    assert!(matches!(err, DeployError::Validation(_)));

    assert_eq!(host.attempts(), 0);
}
