//! Output formatting module

pub mod human;
pub mod json;
pub mod progress;
pub mod reporter;
pub mod styles;

use std::path::Path;

use anyhow::Result;
use console::Term;
use deployer_common::ServerTarget;
use owo_colors::OwoColorize as _;
pub use human::HumanRenderer;
pub use json::JsonRenderer;
pub use reporter::TerminalSink;
pub use styles::Styles;

use crate::application::services::{AutoFixOutcome, DeployOutcome};
use crate::domain::DeployerConfig;
use crate::domain::diagnostics::DiagnosticReport;
use crate::domain::service::ServiceStatus;

/// Output context carrying styling and terminal state.
pub struct OutputContext {
    /// Stylesheet for colored output.
    pub styles: Styles,
    /// Whether stdout is a TTY.
    pub is_tty: bool,
    /// Whether to suppress non-error output.
    pub quiet: bool,
}

impl OutputContext {
    /// Create output context based on CLI flags and environment.
    #[must_use]
    pub fn new(no_color: bool, quiet: bool) -> Self {
        let is_tty = Term::stdout().is_term();
        let use_colors = !no_color && is_tty && std::env::var("NO_COLOR").is_err();

        let mut styles = Styles::default();
        if use_colors {
            styles.colorize();
        }

        Self {
            styles,
            is_tty,
            quiet,
        }
    }

    /// Check if progress indicators should be shown.
    #[must_use]
    pub fn show_progress(&self) -> bool {
        self.is_tty && !self.quiet
    }

    /// Print a success message prefixed with `✓`. Suppressed when `quiet`.
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("  {} {msg}", "✓".style(self.styles.success));
        }
    }

    /// Print a warning message prefixed with `⚠`. Suppressed when `quiet`.
    pub fn warn(&self, msg: &str) {
        if !self.quiet {
            println!("  {} {msg}", "⚠".style(self.styles.warning));
        }
    }

    /// Print an error message prefixed with `✗` to stderr. Never suppressed.
    pub fn error(&self, msg: &str) {
        eprintln!("  {} {msg}", "✗".style(self.styles.error));
    }

    /// Print an info message prefixed with `ℹ`. Suppressed when `quiet`.
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("  {} {msg}", "ℹ".style(self.styles.info));
        }
    }

    /// Print a section header. Suppressed when `quiet`.
    pub fn header(&self, msg: &str) {
        if !self.quiet {
            println!("  {}", msg.style(self.styles.header));
        }
    }

    /// Print a key-value pair with the key dimmed. Suppressed when `quiet`.
    pub fn kv(&self, key: &str, value: &str) {
        if !self.quiet {
            println!("  {}  {value}", key.style(self.styles.dim));
        }
    }
}

/// Human or JSON rendering, chosen once per invocation.
pub enum Renderer<'a> {
    Human(HumanRenderer<'a>),
    Json(JsonRenderer),
}

impl Renderer<'_> {
    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_version(&self, version: &str) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_version(version);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_version(version),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_server(&self, target: &ServerTarget, done: &str) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_server(target, done);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_server(target),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_deployment(&self, outcome: &DeployOutcome) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_deployment(outcome);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_deployment(outcome),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_service_action(&self, verb: &str, service: &str) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_service_action(verb, service);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_service_action(verb, service),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_service_status(&self, service: &str, status: &ServiceStatus) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_service_status(service, status);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_service_status(service, status),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_logs(&self, service: &str, logs: &str) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_logs(logs);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_logs(service, logs),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_report(&self, report: &DiagnosticReport) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_report(report);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_report(report),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_fix(&self, outcome: &AutoFixOutcome) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_fix(outcome);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_fix(outcome),
        }
    }

    /// # Errors
    ///
    /// Serialization failures.
    pub fn render_config(&self, config: &DeployerConfig, path: &Path) -> Result<()> {
        match self {
            Self::Human(r) => r.render_config(config, path),
            Self::Json(_) => JsonRenderer::render_config(config, path),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_config_set(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_config_set(key, value);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_config_value(key, value),
        }
    }

    /// # Errors
    ///
    /// JSON serialization failures.
    pub fn render_config_value(&self, key: &str, value: &str) -> Result<()> {
        match self {
            Self::Human(r) => {
                r.render_config_value(value);
                Ok(())
            }
            Self::Json(_) => JsonRenderer::render_config_value(key, value),
        }
    }
}
