//! Remote command shapes and shell quoting.

use std::time::Duration;

use crate::domain::error::DeployError;

/// Placeholder shown instead of a sensitive command line.
pub const REDACTED: &str = "<redacted>";

/// A single command to run on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub cmd: String,
    /// Run through `sudo -n` unless the session user is already root.
    pub sudo: bool,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
    /// Never logged or echoed in errors (carries credentials).
    pub sensitive: bool,
}

impl RemoteCommand {
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            sudo: false,
            timeout: None,
            sensitive: false,
        }
    }

    #[must_use]
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Command line as sent over the wire for a session logged in as `username`.
    #[must_use]
    pub fn wire_command(&self, username: &str) -> String {
        if self.sudo && username != "root" {
            format!("sudo -n sh -c {}", shell_quote(&self.cmd))
        } else {
            self.cmd.clone()
        }
    }

    /// Form safe for logs and error messages.
    #[must_use]
    pub fn display(&self) -> &str {
        if self.sensitive { REDACTED } else { &self.cmd }
    }
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a nonzero exit into [`DeployError::RemoteCommand`].
    pub fn check(self, command: &RemoteCommand) -> Result<Self, DeployError> {
        if self.success() {
            Ok(self)
        } else {
            Err(DeployError::RemoteCommand {
                command: command.display().to_string(),
                exit_code: self.exit_code,
                stderr: if command.sensitive {
                    String::new()
                } else {
                    self.stderr
                },
            })
        }
    }
}

/// POSIX single-quote `s` so it survives one round of `sh` parsing.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
