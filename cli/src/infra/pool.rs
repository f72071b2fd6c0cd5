//! Connection pool: at most one authenticated session per
//! `(host, port, username)`, handed to one caller at a time.
//!
//! Each key owns a slot guarded by an async mutex; holding the guard is
//! holding the session. A semaphore bounds the number of open sessions
//! across all keys. When it is exhausted, an idle session of another key is
//! closed to make room; otherwise acquisition waits until a session is
//! released and tries again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use deployer_common::{Identity, ServerTarget};
use serde::Serialize;
use tokio::sync::{Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::context::CallContext;
use crate::application::ports::{RemoteSession, SessionConnector};
use crate::domain::config::PoolConfig;
use crate::domain::{ConnectionKey, DeployError};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
/// Upper bound on waiting for a busy key or a free slot when the caller
/// set no deadline.
const QUEUE_LIMIT: Duration = Duration::from_secs(10 * 60);

type SlotState = Option<PooledConnection>;

struct Slot {
    conn: Arc<tokio::sync::Mutex<SlotState>>,
}

struct PooledConnection {
    session: Box<dyn RemoteSession>,
    created_at: Instant,
    last_used: Instant,
    failures: u32,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn is_reusable(&self, config: &PoolConfig, now: Instant) -> bool {
        !self.session.is_closed()
            && self.failures < config.failure_threshold.max(1)
            && now.duration_since(self.created_at) < config.max_age()
            && now.duration_since(self.last_used) < config.idle_timeout()
    }
}

/// Exclusive use of a pooled session. Returned to the pool on drop.
pub struct PooledSession {
    guard: Option<OwnedMutexGuard<SlotState>>,
    key: ConnectionKey,
    condemned: bool,
    released: Arc<Notify>,
}

impl PooledSession {
    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// The session, or `None` if it was already condemned.
    #[must_use]
    pub fn session(&self) -> Option<&dyn RemoteSession> {
        self.guard
            .as_deref()
            .and_then(Option::as_ref)
            .map(|c| c.session.as_ref())
    }

    /// Close the session instead of returning it to the pool.
    pub fn condemn(&mut self) {
        self.condemned = true;
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        if self.condemned {
            if let Some(conn) = guard.take() {
                tracing::info!(key = %self.key, "condemned pooled session");
                close_later(conn);
            }
        } else if let Some(conn) = guard.as_mut() {
            conn.last_used = Instant::now();
        }
        // Unlock before waking so waiters can evict this slot.
        drop(guard);
        self.released.notify_waiters();
    }
}

/// Result of one [`ConnectionPool::health_check`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub evicted: usize,
    /// Busy sessions are not probed.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub capacity: usize,
}

pub struct ConnectionPool {
    connector: Arc<dyn SessionConnector>,
    config: PoolConfig,
    slots: Mutex<HashMap<ConnectionKey, Arc<Slot>>>,
    capacity: Arc<Semaphore>,
    released: Arc<Notify>,
    closed: CancellationToken,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(connector: Arc<dyn SessionConnector>, config: PoolConfig) -> Self {
        let capacity = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Self {
            connector,
            config,
            slots: Mutex::new(HashMap::new()),
            capacity,
            released: Arc::new(Notify::new()),
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get exclusive use of the session for `(target, identity)`, opening
    /// one if needed.
    ///
    /// # Errors
    ///
    /// - [`DeployError::LoginDisabled`] for the privileged identity of a
    ///   locked-down target, without touching the network.
    /// - [`DeployError::PoolClosed`] after [`ConnectionPool::shutdown`].
    /// - Connection, authentication or timeout errors once retries run out.
    /// - [`DeployError::Cancelled`] if `ctx` is cancelled while waiting.
    pub async fn acquire(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        identity: Identity,
    ) -> Result<PooledSession, DeployError> {
        if self.closed.is_cancelled() {
            return Err(DeployError::PoolClosed);
        }
        let key = ConnectionKey::for_target(target, identity);
        if identity == Identity::Privileged && target.security_locked {
            return Err(DeployError::LoginDisabled {
                target: key.address(),
                user: key.username,
            });
        }

        let slot = self.slot(&key);
        let mut guard = ctx
            .run(&format!("wait for session {key}"), QUEUE_LIMIT, async {
                Ok(Arc::clone(&slot.conn).lock_owned().await)
            })
            .await?;
        if self.closed.is_cancelled() {
            return Err(DeployError::PoolClosed);
        }

        let now = Instant::now();
        if let Some(conn) = guard.as_ref()
            && !conn.is_reusable(&self.config, now)
        {
            tracing::debug!(%key, "discarding stale session");
            if let Some(stale) = guard.take() {
                close_later(stale);
            }
        }

        if guard.is_none() {
            let permit = self.reserve(ctx, &key).await?;
            let session = self.connect(ctx, target, &key).await?;
            tracing::info!(%key, "session established");
            *guard = Some(PooledConnection {
                session,
                created_at: now,
                last_used: now,
                failures: 0,
                _permit: permit,
            });
        }

        Ok(PooledSession {
            guard: Some(guard),
            key,
            condemned: false,
            released: Arc::clone(&self.released),
        })
    }

    /// Close the idle session for `(target, identity)`, if any.
    pub async fn evict(&self, target: &ServerTarget, identity: Identity) {
        let key = ConnectionKey::for_target(target, identity);
        let Some(slot) = self.existing_slot(&key) else {
            return;
        };
        let mut guard = slot.conn.lock().await;
        if let Some(conn) = guard.take() {
            tracing::info!(%key, "evicted session");
            conn.session.close().await;
        }
    }

    /// Probe every idle session; condemn dead, expired and repeatedly
    /// failing ones.
    pub async fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        for (key, slot) in self.snapshot() {
            let Ok(mut guard) = Arc::clone(&slot.conn).try_lock_owned() else {
                report.skipped += 1;
                continue;
            };
            let Some(conn) = guard.as_mut() else {
                continue;
            };
            report.checked += 1;

            let now = Instant::now();
            let expired = now.duration_since(conn.created_at) >= self.config.max_age()
                || now.duration_since(conn.last_used) >= self.config.idle_timeout();
            let alive = !expired
                && !conn.session.is_closed()
                && matches!(
                    tokio::time::timeout(HEALTH_PROBE_TIMEOUT, conn.session.exec("true")).await,
                    Ok(Ok(out)) if out.success()
                );

            if alive {
                conn.failures = 0;
                report.healthy += 1;
                continue;
            }
            conn.failures += 1;
            if expired || conn.session.is_closed() || conn.failures >= self.config.failure_threshold.max(1) {
                tracing::info!(%key, expired, failures = conn.failures, "health check evicted session");
                if let Some(dead) = guard.take() {
                    dead.session.close().await;
                }
                report.evicted += 1;
            } else {
                tracing::warn!(%key, failures = conn.failures, "session failed health check");
            }
        }
        self.prune_slots();
        report
    }

    /// Run [`ConnectionPool::health_check`] every `health_interval` until shutdown.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let interval = pool.config.health_interval();
            loop {
                tokio::select! {
                    () = pool.closed.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        let report = pool.health_check().await;
                        tracing::debug!(?report, "pool health check");
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.config.max_connections.max(1),
            ..PoolStats::default()
        };
        for (_, slot) in self.snapshot() {
            match slot.conn.try_lock() {
                Ok(guard) => {
                    if guard.is_some() {
                        stats.idle += 1;
                    }
                }
                Err(_) => stats.in_use += 1,
            }
        }
        stats.total = stats.idle + stats.in_use;
        stats
    }

    /// Refuse new acquisitions and close every session. Busy sessions get a
    /// short grace period to be returned.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let slots = self.snapshot();
        for (key, slot) in slots {
            match tokio::time::timeout(SHUTDOWN_WAIT, slot.conn.lock()).await {
                Ok(mut guard) => {
                    if let Some(conn) = guard.take() {
                        conn.session.close().await;
                    }
                }
                Err(_) => tracing::warn!(%key, "session still busy at shutdown"),
            }
        }
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("connection pool shut down");
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn slot(&self, key: &ConnectionKey) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
            Arc::new(Slot {
                conn: Arc::new(tokio::sync::Mutex::new(None)),
            })
        }))
    }

    fn existing_slot(&self, key: &ConnectionKey) -> Option<Arc<Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn snapshot(&self) -> Vec<(ConnectionKey, Arc<Slot>)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect()
    }

    /// Drop empty slots nobody else references.
    fn prune_slots(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.conn.try_lock().map_or(true, |guard| guard.is_some())
        });
    }

    /// Take a capacity permit, closing another key's idle session if full.
    ///
    /// A session returned to the pool keeps its permit while idle, so a
    /// waiter retries eviction every time any lease is released.
    async fn reserve(&self, ctx: &CallContext, key: &ConnectionKey) -> Result<OwnedSemaphorePermit, DeployError> {
        ctx.run("wait for pool capacity", QUEUE_LIMIT, async {
            let mut waiting = false;
            loop {
                let released = self.released.notified();
                tokio::pin!(released);
                released.as_mut().enable();

                if let Ok(permit) = Arc::clone(&self.capacity).try_acquire_owned() {
                    return Ok(permit);
                }
                if self.evict_idle_other_than(key).await
                    && let Ok(permit) = Arc::clone(&self.capacity).try_acquire_owned()
                {
                    return Ok(permit);
                }
                if self.closed.is_cancelled() {
                    return Err(DeployError::PoolClosed);
                }
                if !waiting {
                    tracing::debug!(%key, "pool at capacity; waiting for a session to be released");
                    waiting = true;
                }
                tokio::select! {
                    permit = Arc::clone(&self.capacity).acquire_owned() => {
                        return permit.map_err(|_| DeployError::PoolClosed);
                    }
                    () = &mut released => {}
                }
            }
        })
        .await
    }

    async fn evict_idle_other_than(&self, key: &ConnectionKey) -> bool {
        for (other, slot) in self.snapshot() {
            if &other == key {
                continue;
            }
            let Ok(mut guard) = slot.conn.try_lock() else {
                continue;
            };
            if let Some(conn) = guard.take() {
                drop(guard);
                tracing::info!(key = %other, "evicted idle session to make room");
                conn.session.close().await;
                return true;
            }
        }
        false
    }

    /// Connect with linear backoff between retryable failures.
    async fn connect(
        &self,
        ctx: &CallContext,
        target: &ServerTarget,
        key: &ConnectionKey,
    ) -> Result<Box<dyn RemoteSession>, DeployError> {
        let attempts = self.config.connect_attempts.max(1);
        let timeout = self.config.connect_timeout();
        let mut attempt = 1;
        loop {
            let result = ctx
                .run(
                    &format!("connect to {key}"),
                    timeout,
                    self.connector.connect(target, key, timeout),
                )
                .await;
            match result {
                Ok(session) => return Ok(session),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(%key, attempt, error = %e, ?delay, "connect failed; retrying");
                    ctx.sleep(delay).await?;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(%key, attempt, error = %e, "connect failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Close a session off the caller's path.
fn close_later(conn: PooledConnection) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                conn.session.close().await;
            });
        }
        Err(_) => drop(conn),
    }
}
