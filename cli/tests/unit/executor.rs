//! Pooled executor: command wiring, timeouts and session condemnation.

#![allow(clippy::expect_used)]

use std::time::Duration;

use deployer_common::Identity;
use pb_deployer::application::CallContext;
use pb_deployer::application::ports::RemoteExecutor;
use pb_deployer::domain::{DeployError, RemoteCommand};

use crate::mocks::{FakeHost, executor, fail, ok, target};

#[tokio::test]
async fn sudo_commands_are_wrapped_for_the_service_account() {
    let host = FakeHost::new();
    let exec = executor(&host);
    let ctx = CallContext::new();

    exec.run(
        &ctx,
        &target(),
        Identity::Unprivileged,
        &RemoteCommand::new("systemctl restart pocketbase-blog").sudo(),
    )
    .await
    .expect("run");
    exec.run(
        &ctx,
        &target(),
        Identity::Privileged,
        &RemoteCommand::new("systemctl restart pocketbase-blog").sudo(),
    )
    .await
    .expect("run");

    assert_eq!(
        host.commands_as("pocketbase"),
        vec!["sudo -n sh -c 'systemctl restart pocketbase-blog'"]
    );
    assert_eq!(host.commands_as("root"), vec!["systemctl restart pocketbase-blog"]);
}

#[tokio::test]
async fn nonzero_exit_is_returned_not_raised() {
    let host = FakeHost::new();
    host.on("false", fail(3, "nope"));
    let exec = executor(&host);

    let out = exec
        .run(&CallContext::new(), &target(), Identity::Privileged, &RemoteCommand::new("false"))
        .await
        .expect("command ran");

    assert_eq!(out.exit_code, 3);
    assert_eq!(out.stderr, "nope");
    assert_eq!(host.logins().len(), 1);
}

#[tokio::test]
async fn transport_failure_condemns_the_session() {
    let host = FakeHost::new();
    let exec = executor(&host);
    let ctx = CallContext::new();
    let cmd = RemoteCommand::new("uptime");

    host.break_transport(true);
    let err = exec
        .run(&ctx, &target(), Identity::Privileged, &cmd)
        .await
        .expect_err("transport is down");
    assert!(err.is_transport_failure());

    host.break_transport(false);
    exec.run(&ctx, &target(), Identity::Privileged, &cmd)
        .await
        .expect("fresh session");
    assert_eq!(host.logins().len(), 2);
}

#[tokio::test]
async fn command_timeout_keeps_the_session() {
    let host = FakeHost::new();
    let exec = executor(&host);
    let ctx = CallContext::new();

    host.set_exec_delay(Some(Duration::from_millis(200)));
    let err = exec
        .run(
            &ctx,
            &target(),
            Identity::Privileged,
            &RemoteCommand::new("sleep 10").timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("times out");
    assert!(matches!(err, DeployError::Timeout { .. }));

    host.set_exec_delay(None);
    exec.run(&ctx, &target(), Identity::Privileged, &RemoteCommand::new("true"))
        .await
        .expect("same session still usable");
    assert_eq!(host.logins().len(), 1);
}

#[tokio::test]
async fn sensitive_commands_hide_their_text_in_errors() {
    let host = FakeHost::new();
    host.on("superuser upsert", fail(1, "bad password hunter2"));
    let exec = executor(&host);
    let cmd = RemoteCommand::new("./pocketbase superuser upsert a@b.c hunter2").sensitive();

    let err = exec
        .run(&CallContext::new(), &target(), Identity::Privileged, &cmd)
        .await
        .expect("ran")
        .check(&cmd)
        .expect_err("nonzero exit");

    let text = err.to_string();
    assert!(!text.contains("hunter2"), "leaked: {text}");
    assert!(text.contains("<redacted>"));
}

#[tokio::test]
async fn uploads_and_downloads_go_through_the_session() {
    let host = FakeHost::new();
    let exec = executor(&host);
    let ctx = CallContext::new();

    exec.upload(&ctx, &target(), Identity::Privileged, b"payload", "/tmp/x", 0o600)
        .await
        .expect("upload");
    let back = exec
        .download(&ctx, &target(), Identity::Privileged, "/tmp/x")
        .await
        .expect("download");

    assert_eq!(back, b"payload");
    assert_eq!(host.uploads(), vec!["/tmp/x"]);
}

#[tokio::test]
async fn missing_remote_file_keeps_the_session() {
    let host = FakeHost::new();
    let exec = executor(&host);
    let ctx = CallContext::new();

    let err = exec
        .download(&ctx, &target(), Identity::Privileged, "/missing")
        .await
        .expect_err("no such file");
    assert!(matches!(err, DeployError::Transfer { .. }));

    exec.run(&ctx, &target(), Identity::Privileged, &RemoteCommand::new("true"))
        .await
        .expect("run");
    assert_eq!(host.logins().len(), 1);
    assert_eq!(host.closed(), 0);
}

#[tokio::test]
async fn transfer_error_on_a_dead_session_condemns_it() {
    let host = FakeHost::new();
    let exec = executor(&host);
    let ctx = CallContext::new();
    exec.run(&ctx, &target(), Identity::Privileged, &RemoteCommand::new("true"))
        .await
        .expect("warm up");

    host.break_transport(true);
    let err = exec
        .download(&ctx, &target(), Identity::Privileged, "/tmp/backup.tar.gz")
        .await
        .expect_err("stream dies");
    assert!(matches!(err, DeployError::Transfer { .. }));

    host.break_transport(false);
    exec.run(&ctx, &target(), Identity::Privileged, &RemoteCommand::new("true"))
        .await
        .expect("fresh session");
    assert_eq!(host.logins().len(), 2);
}

#[tokio::test]
async fn forget_drops_the_pooled_session() {
    let host = FakeHost::new();
    host.on("whoami", ok("root\n"));
    let exec = executor(&host);
    let ctx = CallContext::new();
    let cmd = RemoteCommand::new("whoami");

    exec.run(&ctx, &target(), Identity::Privileged, &cmd).await.expect("run");
    exec.forget(&target(), Identity::Privileged).await;
    exec.run(&ctx, &target(), Identity::Privileged, &cmd).await.expect("run");

    assert_eq!(host.closed(), 1);
    assert_eq!(host.logins().len(), 2);
}
