//! Domain types and validators for pb-deployer configuration.
//!
//! Pure functions only. No I/O, no async, no filesystem access.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;
use crate::domain::security::{BanPolicy, PortRule};

// ── Constants ────────────────────────────────────────────────────────────────

pub const VALID_CONFIG_KEYS: &[&str] = &[
    "pool.max_connections",
    "pool.idle_timeout_secs",
    "pool.max_age_secs",
    "pool.health_interval_secs",
    "pool.failure_threshold",
    "pool.connect_timeout_secs",
    "pool.connect_attempts",
    "pool.retry_backoff_ms",
    "executor.default_timeout_secs",
    "ssh.host_key_policy",
    "ssh.known_hosts",
    "deploy.health_attempts",
    "deploy.health_interval_secs",
    "deploy.health_path",
    "deploy.backup_retention",
    "security.allowed_ports",
    "security.ban.max_retry",
    "security.ban.ban_time_secs",
    "security.ban.find_time_secs",
    "security.ban.services",
];
pub const VALID_HOST_KEY_POLICIES: &[&str] = &["accept-new", "strict"];

// ── Config schema ────────────────────────────────────────────────────────────

/// Top-level configuration stored in `~/.pb-deployer/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DeployerConfig {
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
    pub ssh: SshConfig,
    pub deploy: DeployConfig,
    pub security: SecurityConfig,
}

/// Connection pool limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub max_age_secs: u64,
    pub health_interval_secs: u64,
    /// Consecutive failed health checks before a session is condemned.
    pub failure_threshold: u32,
    pub connect_timeout_secs: u64,
    pub connect_attempts: u32,
    /// Linear backoff: attempt `n` waits `n × retry_backoff_ms` before retrying.
    pub retry_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout_secs: 300,
            max_age_secs: 3600,
            health_interval_secs: 30,
            failure_threshold: 3,
            connect_timeout_secs: 15,
            connect_attempts: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub default_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// What to do with a host key that is not yet in known_hosts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Trust on first use and record the key.
    #[default]
    AcceptNew,
    /// Reject unknown keys.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SshConfig {
    pub host_key_policy: HostKeyPolicy,
    /// Defaults to `~/.pb-deployer/known_hosts` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployConfig {
    pub health_attempts: u32,
    pub health_interval_secs: u64,
    pub health_path: String,
    /// Local backups kept per application.
    pub backup_retention: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            health_attempts: 10,
            health_interval_secs: 3,
            health_path: "/api/health".to_string(),
            backup_retention: 3,
        }
    }
}

impl DeployConfig {
    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    pub allowed_ports: Vec<PortRule>,
    pub ban: BanPolicy,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_ports: vec![
                PortRule::tcp(22),
                PortRule::tcp(80),
                PortRule::tcp(443),
            ],
            ban: BanPolicy::default(),
        }
    }
}

// ── Validators ───────────────────────────────────────────────────────────────

/// Validates a configuration key against the whitelist.
///
/// # Errors
///
/// Returns an error if the key is not in the allowed list.
pub fn validate_config_key(key: &str) -> Result<()> {
    if !VALID_CONFIG_KEYS.contains(&key) {
        return Err(unknown_key(key));
    }
    Ok(())
}

fn unknown_key(key: &str) -> anyhow::Error {
    ConfigError::UnknownKey {
        key: key.to_string(),
        valid: VALID_CONFIG_KEYS.join(", "),
    }
    .into()
}

/// Validates a configuration value for the given key.
///
/// # Errors
///
/// Returns an error if the value is not valid for the key.
pub fn validate_config_value(key: &str, value: &str) -> Result<()> {
    let mut probe = DeployerConfig::default();
    set_config_value(&mut probe, key, value)
}

/// Parses `value` and stores it under `key`.
///
/// # Errors
///
/// Returns an error if the key is unknown or the value does not parse.
pub fn set_config_value(config: &mut DeployerConfig, key: &str, value: &str) -> Result<()> {
    validate_config_key(key)?;
    let value = value.trim();
    match key {
        "pool.max_connections" => config.pool.max_connections = positive(key, value)?,
        "pool.idle_timeout_secs" => config.pool.idle_timeout_secs = positive(key, value)?,
        "pool.max_age_secs" => config.pool.max_age_secs = positive(key, value)?,
        "pool.health_interval_secs" => config.pool.health_interval_secs = positive(key, value)?,
        "pool.failure_threshold" => config.pool.failure_threshold = positive(key, value)?,
        "pool.connect_timeout_secs" => config.pool.connect_timeout_secs = positive(key, value)?,
        "pool.connect_attempts" => config.pool.connect_attempts = positive(key, value)?,
        "pool.retry_backoff_ms" => config.pool.retry_backoff_ms = number(key, value)?,
        "executor.default_timeout_secs" => {
            config.executor.default_timeout_secs = positive(key, value)?;
        }
        "ssh.host_key_policy" => {
            config.ssh.host_key_policy = match value {
                "accept-new" => HostKeyPolicy::AcceptNew,
                "strict" => HostKeyPolicy::Strict,
                _ => return Err(invalid(key, value, &VALID_HOST_KEY_POLICIES.join(", "))),
            };
        }
        "ssh.known_hosts" => {
            if value.is_empty() {
                return Err(invalid(key, value, "a file path"));
            }
            config.ssh.known_hosts = Some(PathBuf::from(value));
        }
        "deploy.health_attempts" => config.deploy.health_attempts = positive(key, value)?,
        "deploy.health_interval_secs" => config.deploy.health_interval_secs = number(key, value)?,
        "deploy.health_path" => {
            if !value.starts_with('/') || value.contains(char::is_whitespace) {
                return Err(invalid(key, value, "an absolute URL path such as /api/health"));
            }
            config.deploy.health_path = value.to_string();
        }
        "deploy.backup_retention" => config.deploy.backup_retention = positive(key, value)?,
        "security.allowed_ports" => {
            let rules = split_list(value)
                .map(|r| r.parse::<PortRule>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| invalid(key, value, "comma-separated rules such as 22/tcp,443/tcp"))?;
            if rules.is_empty() {
                return Err(invalid(key, value, "at least one port rule"));
            }
            config.security.allowed_ports = rules;
        }
        "security.ban.max_retry" => config.security.ban.max_retry = positive(key, value)?,
        "security.ban.ban_time_secs" => config.security.ban.ban_time_secs = positive(key, value)?,
        "security.ban.find_time_secs" => config.security.ban.find_time_secs = positive(key, value)?,
        "security.ban.services" => {
            let mut ban = config.security.ban.clone();
            ban.services = split_list(value).map(ToString::to_string).collect();
            ban.validate()
                .map_err(|_| invalid(key, value, "comma-separated fail2ban jail names"))?;
            config.security.ban = ban;
        }
        _ => return Err(unknown_key(key)),
    }
    Ok(())
}

/// Renders the current value stored under `key`.
///
/// # Errors
///
/// Returns an error if the key is unknown.
pub fn get_config_value(config: &DeployerConfig, key: &str) -> Result<String> {
    validate_config_key(key)?;
    let join = |items: Vec<String>| items.join(",");
    Ok(match key {
        "pool.max_connections" => config.pool.max_connections.to_string(),
        "pool.idle_timeout_secs" => config.pool.idle_timeout_secs.to_string(),
        "pool.max_age_secs" => config.pool.max_age_secs.to_string(),
        "pool.health_interval_secs" => config.pool.health_interval_secs.to_string(),
        "pool.failure_threshold" => config.pool.failure_threshold.to_string(),
        "pool.connect_timeout_secs" => config.pool.connect_timeout_secs.to_string(),
        "pool.connect_attempts" => config.pool.connect_attempts.to_string(),
        "pool.retry_backoff_ms" => config.pool.retry_backoff_ms.to_string(),
        "executor.default_timeout_secs" => config.executor.default_timeout_secs.to_string(),
        "ssh.host_key_policy" => match config.ssh.host_key_policy {
            HostKeyPolicy::AcceptNew => "accept-new".to_string(),
            HostKeyPolicy::Strict => "strict".to_string(),
        },
        "ssh.known_hosts" => config
            .ssh
            .known_hosts
            .as_ref()
            .map_or_else(|| "(default)".to_string(), |p| p.display().to_string()),
        "deploy.health_attempts" => config.deploy.health_attempts.to_string(),
        "deploy.health_interval_secs" => config.deploy.health_interval_secs.to_string(),
        "deploy.health_path" => config.deploy.health_path.clone(),
        "deploy.backup_retention" => config.deploy.backup_retention.to_string(),
        "security.allowed_ports" => join(
            config
                .security
                .allowed_ports
                .iter()
                .map(ToString::to_string)
                .collect(),
        ),
        "security.ban.max_retry" => config.security.ban.max_retry.to_string(),
        "security.ban.ban_time_secs" => config.security.ban.ban_time_secs.to_string(),
        "security.ban.find_time_secs" => config.security.ban.find_time_secs.to_string(),
        "security.ban.services" => join(config.security.ban.services.clone()),
        _ => return Err(unknown_key(key)),
    })
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| invalid(key, value, "a non-negative integer"))
}

fn positive<T: std::str::FromStr + PartialEq + Default>(key: &str, value: &str) -> Result<T> {
    let n: T = value
        .parse()
        .map_err(|_| invalid(key, value, "a positive integer"))?;
    if n == T::default() {
        return Err(invalid(key, value, "a positive integer"));
    }
    Ok(n)
}

fn invalid(key: &str, value: &str, valid: &str) -> anyhow::Error {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        valid: valid.to_string(),
    }
    .into()
}
