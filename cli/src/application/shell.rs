//! A remote shell bound to one target, identity and call context.
//!
//! Managers issue their commands through this helper instead of repeating the
//! executor arguments on every call.

use deployer_common::{Identity, ServerTarget};

use crate::application::context::CallContext;
use crate::application::ports::RemoteExecutor;
use crate::domain::command::shell_quote;
use crate::domain::deployment::staging_path;
use crate::domain::{CommandOutput, DeployError, RemoteCommand};

pub struct RemoteShell<'a> {
    executor: &'a dyn RemoteExecutor,
    ctx: &'a CallContext,
    target: &'a ServerTarget,
    identity: Identity,
}

impl<'a> RemoteShell<'a> {
    #[must_use]
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        ctx: &'a CallContext,
        target: &'a ServerTarget,
        identity: Identity,
    ) -> Self {
        Self {
            executor,
            ctx,
            target,
            identity,
        }
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.target.username(self.identity)
    }

    /// Run `command` and return its output whatever the exit code.
    ///
    /// # Errors
    ///
    /// Transport, timeout and cancellation errors only.
    pub async fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, DeployError> {
        self.executor
            .run(self.ctx, self.target, self.identity, command)
            .await
    }

    /// Run `command`, treating a nonzero exit as an error.
    ///
    /// # Errors
    ///
    /// [`DeployError::RemoteCommand`] on nonzero exit, plus transport errors.
    pub async fn run_checked(&self, command: &RemoteCommand) -> Result<CommandOutput, DeployError> {
        self.run(command).await?.check(command)
    }

    /// `run_checked` with sudo.
    ///
    /// # Errors
    ///
    /// See [`RemoteShell::run_checked`].
    pub async fn sudo(&self, cmd: &str) -> Result<CommandOutput, DeployError> {
        self.run_checked(&RemoteCommand::new(cmd).sudo()).await
    }

    /// Whether `cmd` (run with sudo) exits 0.
    ///
    /// # Errors
    ///
    /// Transport errors only.
    pub async fn sudo_succeeds(&self, cmd: &str) -> Result<bool, DeployError> {
        Ok(self.run(&RemoteCommand::new(cmd).sudo()).await?.success())
    }

    /// # Errors
    ///
    /// Transport errors only.
    pub async fn file_exists(&self, path: &str) -> Result<bool, DeployError> {
        self.sudo_succeeds(&format!("test -e {}", shell_quote(path)))
            .await
    }

    /// # Errors
    ///
    /// [`DeployError::RemoteCommand`] if the file cannot be read.
    pub async fn read_file(&self, path: &str) -> Result<String, DeployError> {
        Ok(self
            .sudo(&format!("cat {}", shell_quote(path)))
            .await?
            .stdout)
    }

    /// Upload `data` to a scratch file owned by the login user.
    ///
    /// # Errors
    ///
    /// [`DeployError::Transfer`] and transport errors.
    pub async fn stage(&self, data: &[u8]) -> Result<String, DeployError> {
        let scratch = staging_path(&uuid::Uuid::new_v4().simple().to_string(), "");
        self.executor
            .upload(self.ctx, self.target, self.identity, data, &scratch, 0o600)
            .await?;
        Ok(scratch)
    }

    /// Install `data` at `path` with `mode` (and `owner`, default root).
    ///
    /// Staged under `/tmp` first, then moved into place with `install`, so
    /// the final path never holds a partial file.
    ///
    /// # Errors
    ///
    /// Transfer, remote-command and transport errors.
    pub async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        mode: u32,
        owner: Option<&str>,
    ) -> Result<(), DeployError> {
        self.write_file_validated(path, data, mode, owner, None)
            .await
    }

    /// Like [`RemoteShell::write_file`], but runs `validate(scratch_path)` first
    /// and leaves `path` untouched if validation fails.
    ///
    /// # Errors
    ///
    /// [`DeployError::RemoteCommand`] if validation fails, plus the errors of
    /// [`RemoteShell::write_file`].
    pub async fn write_file_validated(
        &self,
        path: &str,
        data: &[u8],
        mode: u32,
        owner: Option<&str>,
        validate: Option<&(dyn Fn(&str) -> String + Sync)>,
    ) -> Result<(), DeployError> {
        let scratch = self.stage(data).await?;
        if let Some(validate) = validate
            && let Err(e) = self.sudo(&validate(&scratch)).await
        {
            if let Err(cleanup) = self.sudo(&format!("rm -f {}", shell_quote(&scratch))).await {
                tracing::warn!(error = %cleanup, path = %scratch, "could not remove rejected scratch file");
            }
            return Err(e);
        }
        let owner_flags = owner.map_or_else(String::new, |o| {
            format!(" -o {o} -g {o}", o = shell_quote(o))
        });
        self.sudo(&format!(
            "install -m {mode:o}{owner_flags} {src} {dst} && rm -f {src}",
            src = shell_quote(&scratch),
            dst = shell_quote(path),
        ))
        .await?;
        Ok(())
    }
}
