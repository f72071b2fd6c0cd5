//! systemd service status parsing and unit rendering.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::domain::command::shell_quote;
use crate::domain::error::DeployError;

pub const MIN_LOG_LINES: u32 = 1;
pub const MAX_LOG_LINES: u32 = 10_000;
pub const DEFAULT_LOG_LINES: u32 = 100;

/// Name of the application binary inside the install path.
pub const APP_BINARY: &str = "pocketbase";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    #[must_use]
    pub fn verb(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Failed,
    Unknown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", with = "secs_opt")]
    pub uptime: Option<Duration>,
}

mod secs_opt {
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: serde::Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_u64(d.as_secs()),
            None => serializer.serialize_none(),
        }
    }
}

// ── Validators ────────────────────────────────────────────────────────────────

/// systemd unit base names: `[A-Za-z0-9:_.@-]+`, without the `.service` suffix.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if the name is empty or has other characters.
pub fn validate_service_name(name: &str) -> Result<(), DeployError> {
    if name.is_empty()
        || name.len() > 200
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ":_.@-".contains(c))
    {
        return Err(DeployError::Validation(format!(
            "invalid service name '{name}'"
        )));
    }
    Ok(())
}

#[must_use]
pub fn clamp_log_lines(lines: u32) -> u32 {
    lines.clamp(MIN_LOG_LINES, MAX_LOG_LINES)
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[must_use]
pub fn control_command(action: ServiceAction, service: &str) -> String {
    format!("systemctl {} {}", action.verb(), shell_quote(service))
}

/// `systemctl show` for the fields [`parse_status`] reads, followed by the remote clock.
#[must_use]
pub fn status_command(service: &str) -> String {
    format!(
        "systemctl show {} --property=LoadState,ActiveState,SubState,MainPID,ActiveEnterTimestamp --timestamp=unix && date +%s",
        shell_quote(service)
    )
}

#[must_use]
pub fn logs_command(service: &str, lines: u32) -> String {
    format!(
        "journalctl -u {} -n {} --no-pager -o short-iso",
        shell_quote(service),
        clamp_log_lines(lines)
    )
}

/// Whether `systemctl` stderr says the unit does not exist.
#[must_use]
pub fn is_unit_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("could not be found") || lower.contains("not loaded")
}

/// Parse `systemctl show … && date +%s` output.
///
/// # Errors
///
/// Returns [`DeployError::ServiceNotFound`] when `LoadState=not-found`.
pub fn parse_status(service: &str, output: &str) -> Result<ServiceStatus, DeployError> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    let mut now: Option<u64> = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some((k, v)) = line.split_once('=') {
            fields.insert(k, v);
        } else if let Ok(ts) = line.parse::<u64>() {
            now = Some(ts);
        }
    }

    if fields.get("LoadState") == Some(&"not-found") {
        return Err(DeployError::ServiceNotFound(service.to_string()));
    }

    let state = match fields.get("ActiveState").copied() {
        Some("active" | "reloading" | "activating") => ServiceState::Running,
        Some("inactive" | "deactivating") => ServiceState::Stopped,
        Some("failed") => ServiceState::Failed,
        _ => ServiceState::Unknown,
    };

    let pid = fields
        .get("MainPID")
        .and_then(|p| p.parse::<u32>().ok())
        .filter(|p| *p != 0);

    let uptime = match (state, fields.get("ActiveEnterTimestamp"), now) {
        (ServiceState::Running, Some(ts), Some(now)) => ts
            .trim_start_matches('@')
            .parse::<u64>()
            .ok()
            .filter(|started| *started > 0)
            .map(|started| Duration::from_secs(now.saturating_sub(started))),
        _ => None,
    };

    Ok(ServiceStatus { state, pid, uptime })
}

// ── Unit file ─────────────────────────────────────────────────────────────────

#[must_use]
pub fn unit_path(service: &str) -> String {
    format!("/etc/systemd/system/{service}.service")
}

/// systemd unit for one application, bound to loopback on `port`.
#[must_use]
pub fn render_unit(description: &str, install_path: &str, user: &str, port: u16) -> String {
    format!(
        "# Managed by pb-deployer. Do not edit.\n\
         [Unit]\n\
         Description={description}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         Group={user}\n\
         WorkingDirectory={install_path}\n\
         ExecStart={install_path}/{APP_BINARY} serve --http=127.0.0.1:{port}\n\
         Restart=always\n\
         RestartSec=5s\n\
         LimitNOFILE=4096\n\
         StandardOutput=journal\n\
         StandardError=journal\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}
