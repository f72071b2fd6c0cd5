//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use std::time::Duration;

use thiserror::Error;

// ── Deploy errors ─────────────────────────────────────────────────────────────

/// Coarse classification used for retry decisions and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Authentication,
    Timeout,
    RemoteCommand,
    Precondition,
    Validation,
    Cancelled,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Authentication => "authentication",
            Self::Timeout => "timeout",
            Self::RemoteCommand => "remote_command",
            Self::Precondition => "precondition",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Every failure the pool, executor and managers can report.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Cannot connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    #[error("Authentication failed for {user}@{target}: {reason}")]
    Authentication {
        target: String,
        user: String,
        reason: String,
    },

    /// Privileged login on a locked-down server. Expected, never retried.
    #[error("Login as '{user}' on {target} is disabled (server is locked down)")]
    LoginDisabled { target: String, user: String },

    #[error("Timed out after {}s: {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("Remote command failed (exit {exit_code}): {command}{}", stderr_suffix(.stderr))]
    RemoteCommand {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Service '{0}' not found on the server. Has the app been deployed?")]
    ServiceNotFound(String),

    #[error("{0}")]
    Precondition(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("Transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task aborted: {0}")]
    TaskAborted(String),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<DeployError>,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{trimmed}")
    }
}

impl DeployError {
    /// Wrap `self` with the name of the workflow step that failed.
    /// Already-wrapped errors keep their innermost step.
    #[must_use]
    pub fn at_step(self, step: &str) -> Self {
        match self {
            Self::Step { .. } => self,
            other => Self::Step {
                step: step.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The failing step name, if this error was raised inside a workflow.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    /// The error with any step wrapper removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::Connection { .. } | Self::PoolClosed | Self::Transfer { .. } => {
                ErrorKind::Connection
            }
            Self::Authentication { .. } | Self::LoginDisabled { .. } => ErrorKind::Authentication,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RemoteCommand { .. } | Self::ServiceNotFound(_) => ErrorKind::RemoteCommand,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io { .. } | Self::TaskAborted(_) | Self::Step { .. } => ErrorKind::Internal,
        }
    }

    /// Whether establishing a session may be attempted again.
    ///
    /// `LoginDisabled` is an expected state and never retried, and neither is
    /// anything raised by a command that already ran.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::Connection { .. } | Self::Authentication { .. } | Self::Timeout { .. }
        )
    }

    /// Whether the underlying transport is dead and the session must not be reused.
    ///
    /// A `Transfer` error is a file-level failure on a working channel.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(self.root(), Self::Connection { .. })
    }
}

// ── Config errors ─────────────────────────────────────────────────────────────

/// Errors related to configuration key/value validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown setting: {key}\n\nValid settings: {valid}")]
    UnknownKey { key: String, valid: String },

    #[error("Invalid value for {key}: {value}\n\nExpected: {valid}")]
    InvalidValue {
        key: String,
        value: String,
        valid: String,
    },
}

// ── Inventory errors ──────────────────────────────────────────────────────────

/// Lookups against the local record inventory.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Server '{0}' not found in inventory.")]
    ServerNotFound(String),

    #[error("App '{0}' not found in inventory.")]
    AppNotFound(String),

    #[error("Version '{version}' not found for app '{app}'.")]
    VersionNotFound { app: String, version: String },
}
