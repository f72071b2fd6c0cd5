//! Human-readable terminal renderer.

use std::path::Path;

use anyhow::{Context, Result};
use deployer_common::{DiagnosticStatus, ServerTarget};
use owo_colors::OwoColorize as _;

use crate::application::services::{AutoFixOutcome, DeployOutcome};
use crate::domain::DeployerConfig;
use crate::domain::diagnostics::{DiagnosticReport, Overall};
use crate::domain::service::{ServiceState, ServiceStatus};
use crate::output::OutputContext;

/// Renders domain types as human-readable terminal output using `OutputContext`.
pub struct HumanRenderer<'a> {
    ctx: &'a OutputContext,
}

impl<'a> HumanRenderer<'a> {
    /// Create a new `HumanRenderer` wrapping the given output context.
    #[must_use]
    pub fn new(ctx: &'a OutputContext) -> Self {
        Self { ctx }
    }

    pub fn render_version(&self, version: &str) {
        println!("pbdeploy {version}");
    }

    /// Summary after setup or lockdown finished.
    pub fn render_server(&self, target: &ServerTarget, done: &str) {
        self.ctx.success(&format!("{done}: {}", target.label()));
        self.ctx.kv("Setup complete:", yes_no(target.setup_complete));
        self.ctx.kv("Locked down:   ", yes_no(target.security_locked));
        if target.security_locked {
            self.ctx.info(&format!(
                "Root login is disabled; operations now run as '{}'.",
                target.unprivileged_user
            ));
        }
    }

    pub fn render_deployment(&self, outcome: &DeployOutcome) {
        let record = &outcome.record;
        let took = record
            .duration()
            .map(|d| format!(" in {}s", d.num_seconds()))
            .unwrap_or_default();
        if outcome.succeeded() {
            self.ctx.success(&format!(
                "{} {} deployed{took}",
                outcome.app.name, record.version_label
            ));
        } else {
            self.ctx.error(&format!(
                "Deployment of {} {} failed{took}",
                outcome.app.name, record.version_label
            ));
        }
        self.ctx.kv("Deployment:", &record.id);
        self.ctx.kv("Status:    ", &outcome.app.status.to_string());
        if let Some(current) = &outcome.app.current_version {
            self.ctx.kv("Current:   ", current);
        }
        if let Some(backup) = &outcome.backup {
            self.ctx.kv("Backup:    ", &backup.path.display().to_string());
        }
    }

    pub fn render_service_action(&self, verb: &str, service: &str) {
        self.ctx.success(&format!("{service}: {verb}"));
    }

    pub fn render_service_status(&self, service: &str, status: &ServiceStatus) {
        let state = status.state.to_string();
        let state = match status.state {
            ServiceState::Running => state.style(self.ctx.styles.success).to_string(),
            ServiceState::Failed => state.style(self.ctx.styles.error).to_string(),
            ServiceState::Stopped | ServiceState::Unknown => {
                state.style(self.ctx.styles.warning).to_string()
            }
        };
        self.ctx.header(service);
        self.ctx.kv("State: ", &state);
        if let Some(pid) = status.pid {
            self.ctx.kv("PID:   ", &pid.to_string());
        }
        if let Some(uptime) = status.uptime {
            self.ctx.kv("Uptime:", &format_uptime(uptime.as_secs()));
        }
    }

    pub fn render_logs(&self, logs: &str) {
        print!("{logs}");
        if !logs.is_empty() && !logs.ends_with('\n') {
            println!();
        }
    }

    pub fn render_report(&self, report: &DiagnosticReport) {
        for d in &report.diagnostics {
            let line = format!("{}: {} ({}ms)", d.step, d.message, d.duration_ms);
            match d.status {
                DiagnosticStatus::Success => self.ctx.success(&line),
                DiagnosticStatus::Warning => self.ctx.warn(&line),
                DiagnosticStatus::Error => self.ctx.error(&line),
            }
        }
        println!();
        match report.overall {
            Overall::Healthy => self.ctx.success("Everything looks good!"),
            Overall::Degraded => self.ctx.warn("Some checks need attention"),
            Overall::Error => self.ctx.error("Some checks failed"),
        }
        if report.ban_suspected {
            self.ctx.warn("This machine may be banned by fail2ban on the server");
        }
        for s in &report.suggestions {
            self.ctx.info(s);
        }
    }

    pub fn render_fix(&self, outcome: &AutoFixOutcome) {
        if outcome.applied.is_empty() {
            self.ctx.info("No automatic fixes apply");
        }
        for fix in &outcome.applied {
            let what = format_remediation(&fix.remediation);
            match &fix.error {
                None => self.ctx.success(&format!("Fixed: {what}")),
                Some(e) => self.ctx.error(&format!("Could not fix {what}: {e}")),
            }
        }
        println!();
        self.ctx.header("After fixes:");
        self.render_report(&outcome.after);
    }

    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized.
    pub fn render_config(&self, config: &DeployerConfig, path: &Path) -> Result<()> {
        self.ctx.kv("Configuration", &format!("({})", path.display()));
        println!();
        let yaml = serde_yaml::to_string(config).context("cannot serialize config")?;
        for line in yaml.lines() {
            println!("  {line}");
        }
        Ok(())
    }

    pub fn render_config_set(&self, key: &str, value: &str) {
        self.ctx.success(&format!("Set {key} = {value}"));
    }

    pub fn render_config_value(&self, value: &str) {
        println!("{value}");
    }
}

fn yes_no(v: bool) -> &'static str {
    if v { "yes" } else { "no" }
}

/// `2d 3h`, `2h 34m`, or `5m`.
#[must_use]
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let minutes = (seconds % 3600) / 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[must_use]
pub fn format_remediation(r: &deployer_common::Remediation) -> String {
    use deployer_common::Remediation;
    match r {
        Remediation::FixKeyPermissions { path } => format!("permissions of {}", path.display()),
        Remediation::AcceptHostKey { host, port } => format!("host key of {host}:{port}"),
        Remediation::CreateDirectories { paths } => format!("directories {}", paths.join(", ")),
        Remediation::Manual { instructions } => instructions.clone(),
    }
}
