//! Connection pool: reuse, identity separation, retries, capacity and
//! lifecycle, against the scripted host.

#![allow(clippy::expect_used)]

use std::time::Duration;

use deployer_common::Identity;
use pb_deployer::application::CallContext;
use pb_deployer::domain::DeployError;
use pb_deployer::domain::config::PoolConfig;

use crate::mocks::{FakeHost, Refusal, fail, fast_pool_config, locked_target, pool_with, target};

#[tokio::test]
async fn sequential_acquires_reuse_one_session() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());
    let ctx = CallContext::new();

    for _ in 0..3 {
        let lease = pool
            .acquire(&ctx, &target(), Identity::Privileged)
            .await
            .expect("acquire");
        assert_eq!(lease.key().to_string(), "root@203.0.113.10:22");
    }

    assert_eq!(host.logins(), vec!["root"]);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn identities_get_separate_sessions() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());
    let ctx = CallContext::new();

    let root = pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("root");
    let app = pool.acquire(&ctx, &target(), Identity::Unprivileged).await.expect("app");
    assert_ne!(root.key(), app.key());
    assert_eq!(pool.stats().in_use, 2);
    drop((root, app));

    let mut logins = host.logins();
    logins.sort();
    assert_eq!(logins, vec!["pocketbase", "root"]);
}

#[tokio::test]
async fn privileged_login_on_locked_target_fails_without_connecting() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());

    let err = pool
        .acquire(&CallContext::new(), &locked_target(), Identity::Privileged)
        .await
        .err()
        .expect("must refuse");

    assert!(matches!(err, DeployError::LoginDisabled { ref user, .. } if user == "root"));
    assert!(!err.is_retryable());
    assert_eq!(host.attempts(), 0);
}

#[tokio::test]
async fn transient_connect_failures_are_retried() {
    let host = FakeHost::new();
    host.fail_next_connects(2);
    let pool = pool_with(&host, fast_pool_config());

    pool.acquire(&CallContext::new(), &target(), Identity::Privileged)
        .await
        .expect("third attempt succeeds");

    assert_eq!(host.attempts(), 3);
    assert_eq!(host.logins().len(), 1);
}

#[tokio::test]
async fn retries_stop_at_the_configured_attempts() {
    let host = FakeHost::new();
    host.refuse("root", Refusal::Refused);
    let pool = pool_with(
        &host,
        PoolConfig {
            connect_attempts: 2,
            ..fast_pool_config()
        },
    );

    let err = pool
        .acquire(&CallContext::new(), &target(), Identity::Privileged)
        .await
        .err()
        .expect("must fail");

    assert!(matches!(err, DeployError::Connection { .. }));
    assert_eq!(host.attempts(), 2);
}

#[tokio::test]
async fn condemned_session_is_replaced() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());
    let ctx = CallContext::new();

    let mut lease = pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("acquire");
    lease.condemn();
    drop(lease);

    let lease = pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("reacquire");
    assert!(lease.session().is_some());
    assert_eq!(host.logins().len(), 2);
}

#[tokio::test]
async fn expired_sessions_are_not_reused() {
    let host = FakeHost::new();
    let pool = pool_with(
        &host,
        PoolConfig {
            idle_timeout_secs: 0,
            ..fast_pool_config()
        },
    );
    let ctx = CallContext::new();

    drop(pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("first"));
    drop(pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("second"));

    assert_eq!(host.logins().len(), 2);
}

#[tokio::test]
async fn full_pool_evicts_another_keys_idle_session() {
    let host = FakeHost::new();
    let pool = pool_with(
        &host,
        PoolConfig {
            max_connections: 1,
            ..fast_pool_config()
        },
    );
    let ctx = CallContext::new();

    drop(pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("root"));
    let app = pool
        .acquire(&ctx, &target(), Identity::Unprivileged)
        .await
        .expect("evicts idle root session");

    assert_eq!(host.closed(), 1);
    assert_eq!(app.key().username, "pocketbase");
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test]
async fn full_pool_waits_until_the_deadline() {
    let host = FakeHost::new();
    let pool = pool_with(
        &host,
        PoolConfig {
            max_connections: 1,
            ..fast_pool_config()
        },
    );
    let ctx = CallContext::new();

    let _busy = pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("root");
    let err = pool
        .acquire(
            &ctx.with_timeout(Duration::from_millis(50)),
            &target(),
            Identity::Unprivileged,
        )
        .await
        .err()
        .expect("no capacity");

    assert!(matches!(err, DeployError::Timeout { .. }));
}

#[tokio::test]
async fn full_pool_waiter_takes_over_when_another_key_is_released() {
    let host = FakeHost::new();
    let pool = pool_with(
        &host,
        PoolConfig {
            max_connections: 1,
            ..fast_pool_config()
        },
    );
    let root = pool
        .acquire(&CallContext::new(), &target(), Identity::Privileged)
        .await
        .expect("root");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let ctx = CallContext::new().with_timeout(Duration::from_secs(3));
            pool.acquire(&ctx, &target(), Identity::Unprivileged)
                .await
                .map(|lease| lease.key().username.clone())
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(root);

    let user = waiter.await.expect("join").expect("idle root session is evicted");
    assert_eq!(user, "pocketbase");
    assert_eq!(host.logins(), vec!["root".to_string(), "pocketbase".to_string()]);
    assert_eq!(host.closed(), 1);
}

#[tokio::test]
async fn waiting_for_a_busy_key_observes_cancellation() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());
    let _held = pool
        .acquire(&CallContext::new(), &target(), Identity::Privileged)
        .await
        .expect("hold");

    let waiter = CallContext::new();
    let cancel = waiter.token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let err = pool
        .acquire(&waiter, &target(), Identity::Privileged)
        .await
        .err()
        .expect("cancelled");

    assert!(matches!(err, DeployError::Cancelled));
}

#[tokio::test]
async fn health_check_evicts_dead_sessions_and_keeps_live_ones() {
    let host = FakeHost::new();
    let pool = pool_with(
        &host,
        PoolConfig {
            failure_threshold: 1,
            ..fast_pool_config()
        },
    );
    let ctx = CallContext::new();
    drop(pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("root"));

    let report = pool.health_check().await;
    assert_eq!((report.checked, report.healthy, report.evicted), (1, 1, 0));

    host.break_transport(true);
    let report = pool.health_check().await;
    assert_eq!(report.evicted, 1);
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test]
async fn health_check_evicts_after_the_failure_threshold() {
    let host = FakeHost::new();
    let pool = pool_with(
        &host,
        PoolConfig {
            failure_threshold: 3,
            ..fast_pool_config()
        },
    );
    let ctx = CallContext::new();
    drop(pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("root"));

    host.on("true", fail(1, "no shell"));
    let evicted: Vec<usize> = [
        pool.health_check().await,
        pool.health_check().await,
        pool.health_check().await,
    ]
    .iter()
    .map(|r| r.evicted)
    .collect();
    assert_eq!(evicted, vec![0, 0, 1]);

    drop(pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("reconnect"));
    assert_eq!(host.logins().len(), 2);
}

#[tokio::test]
async fn health_check_skips_sessions_in_use() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());
    let _lease = pool
        .acquire(&CallContext::new(), &target(), Identity::Privileged)
        .await
        .expect("acquire");

    let report = pool.health_check().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.checked, 0);
}

#[tokio::test]
async fn evict_closes_the_idle_session() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());
    drop(
        pool.acquire(&CallContext::new(), &target(), Identity::Privileged)
            .await
            .expect("acquire"),
    );

    pool.evict(&target(), Identity::Privileged).await;

    assert_eq!(host.closed(), 1);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test]
async fn shutdown_closes_sessions_and_refuses_new_work() {
    let host = FakeHost::new();
    let pool = pool_with(&host, fast_pool_config());
    let ctx = CallContext::new();
    drop(pool.acquire(&ctx, &target(), Identity::Privileged).await.expect("root"));
    drop(pool.acquire(&ctx, &target(), Identity::Unprivileged).await.expect("app"));

    pool.shutdown().await;

    assert_eq!(host.closed(), 2);
    let err = pool
        .acquire(&ctx, &target(), Identity::Privileged)
        .await
        .err()
        .expect("closed");
    assert!(matches!(err, DeployError::PoolClosed));
}
