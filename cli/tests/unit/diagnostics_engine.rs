//! Diagnostics and auto-fix against the scripted host and fake local side.

#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use deployer_common::{AuthMode, DiagnosticStatus, Remediation, ServerTarget};
use pb_deployer::application::CallContext;
use pb_deployer::application::services::DiagnosticsEngine;
use pb_deployer::domain::diagnostics::{
    BAN_SUGGESTION, FAILURE_DETAIL, KEY_FILE, KNOWN_HOST, Overall, PRIVILEGED_AUTH,
    REMOTE_DIRECTORIES, SUDO_ACCESS, TCP_REACHABILITY,
};

use crate::mocks::{
    FakeHost, FakeLocal, MockNetwork, RecordingSink, Refusal, executor, fail, locked_target, ok,
    sshd_banner, target,
};

const KEY_PATH: &str = "/home/deploy/.ssh/id_ed25519";

fn engine(host: &FakeHost, network: MockNetwork, local: Arc<FakeLocal>) -> (DiagnosticsEngine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let engine = DiagnosticsEngine::new(
        host.connector(),
        executor(host),
        Arc::new(network),
        local,
        sink.clone(),
        Duration::from_secs(2),
    );
    (engine, sink)
}

fn known() -> Arc<FakeLocal> {
    Arc::new(FakeLocal::default().knowing("203.0.113.10", 22))
}

fn key_file_target() -> ServerTarget {
    ServerTarget {
        auth: AuthMode::KeyFile {
            path: PathBuf::from(KEY_PATH),
            passphrase_env: None,
        },
        ..target()
    }
}

fn steps(report: &pb_deployer::domain::diagnostics::DiagnosticReport) -> Vec<&str> {
    report.diagnostics.iter().map(|d| d.step.as_str()).collect()
}

#[tokio::test]
async fn unreachable_host_skips_remote_checks() {
    let host = FakeHost::new();
    let mut network = MockNetwork::new();
    network
        .expect_probe()
        .returning(|_, _, _| Err("connection timed out".to_string()));
    let (engine, _) = engine(&host, network, known());

    let report = engine.diagnose(&CallContext::new(), &target()).await;

    assert_eq!(steps(&report), vec![TCP_REACHABILITY, KEY_FILE]);
    assert_eq!(report.overall, Overall::Error);
    assert!(!report.ban_suspected);
    let tcp = report.get(TCP_REACHABILITY).expect("tcp");
    assert_eq!(tcp.detail.get(FAILURE_DETAIL).map(String::as_str), Some("timed_out"));
    assert_eq!(host.attempts(), 0);
}

#[tokio::test]
async fn healthy_server_passes_every_check() {
    let host = FakeHost::new();
    let (engine, sink) = engine(&host, sshd_banner(), known());

    let report = engine.diagnose(&CallContext::new(), &target()).await;

    assert_eq!(
        steps(&report),
        vec![
            TCP_REACHABILITY,
            KEY_FILE,
            KNOWN_HOST,
            PRIVILEGED_AUTH,
            "unprivileged_auth",
            SUDO_ACCESS,
            REMOTE_DIRECTORIES,
        ]
    );
    assert_eq!(report.overall, Overall::Healthy, "{:#?}", report.diagnostics);
    assert!(report.suggestions.is_empty());
    assert_eq!(sink.events().len(), 7);
    assert_eq!(
        sink.topics().into_iter().collect::<Vec<_>>(),
        vec!["server_diagnostics_srv1"]
    );
}

#[tokio::test]
async fn refused_login_after_tcp_success_looks_like_a_ban() {
    let host = FakeHost::new();
    host.refuse("root", Refusal::Refused);
    let (engine, _) = engine(&host, sshd_banner(), known());

    let report = engine.diagnose(&CallContext::new(), &target()).await;

    assert!(report.ban_suspected);
    assert_eq!(report.overall, Overall::Error);
    assert_eq!(report.suggestions.first().map(String::as_str), Some(BAN_SUGGESTION));
    let login = report.get(PRIVILEGED_AUTH).expect("privileged");
    assert_eq!(login.detail.get(FAILURE_DETAIL).map(String::as_str), Some("refused"));
}

#[tokio::test]
async fn locked_target_expects_privileged_login_to_be_disabled() {
    let host = FakeHost::new();
    let (engine, _) = engine(&host, sshd_banner(), known());

    let report = engine.diagnose(&CallContext::new(), &locked_target()).await;

    let privileged = report.get(PRIVILEGED_AUTH).expect("privileged");
    assert_eq!(privileged.status, DiagnosticStatus::Success);
    assert_eq!(
        privileged.detail.get("expected_disabled").map(String::as_str),
        Some("true")
    );
    assert!(!host.logins().iter().any(|u| u == "root"));
    assert_eq!(report.overall, Overall::Healthy);
}

#[tokio::test]
async fn sudo_failure_is_an_error_with_manual_advice() {
    let host = FakeHost::new();
    host.on("sudo -n sh -c true", fail(1, "sudo: a password is required"));
    let (engine, _) = engine(&host, sshd_banner(), known());

    let report = engine.diagnose(&CallContext::new(), &target()).await;

    let sudo = report.get(SUDO_ACCESS).expect("sudo");
    assert_eq!(sudo.status, DiagnosticStatus::Error);
    assert!(matches!(sudo.remediation, Some(Remediation::Manual { .. })));
    assert!(report.safe_remediations().is_empty());
}

#[tokio::test]
async fn auto_fix_repairs_what_is_safe_and_rediagnoses() {
    let host = FakeHost::new();
    host.once("for d in", ok("/opt/pocketbase/apps\n"));
    let local = Arc::new(FakeLocal::default().with_key(Path::new(KEY_PATH), 0o644));
    let (engine, _) = engine(&host, sshd_banner(), local.clone());

    let outcome = engine.auto_fix(&CallContext::new(), &key_file_target()).await;

    assert_eq!(outcome.before.overall, Overall::Degraded);
    assert_eq!(outcome.applied.len(), 3);
    assert!(outcome.applied.iter().all(|f| f.succeeded()));
    assert_eq!(local.mode(Path::new(KEY_PATH)), Some(0o600));
    assert_eq!(local.accepted(), 1);
    assert!(host.ran("mkdir -p /opt/pocketbase /opt/pocketbase/apps"));
    assert_eq!(outcome.after.overall, Overall::Healthy, "{:#?}", outcome.after.diagnostics);
}

#[tokio::test]
async fn auto_fix_never_applies_manual_remediations() {
    let host = FakeHost::new();
    let local = Arc::new(FakeLocal::default().knowing("203.0.113.10", 22));
    let (engine, _) = engine(&host, sshd_banner(), local);

    // No key at the configured path.
    let outcome = engine.auto_fix(&CallContext::new(), &key_file_target()).await;

    assert!(outcome.applied.is_empty());
    let key = outcome.after.get(KEY_FILE).expect("key check");
    assert_eq!(key.status, DiagnosticStatus::Error);
    assert!(matches!(key.remediation, Some(Remediation::Manual { .. })));
}
