//! JSON output helpers.
//!
//! Every `--json` code path prints one pretty-printed object on stdout.
//! Failures use the error object from [`format_error`].

use anyhow::{Context, Result};
use deployer_common::ServerTarget;
use serde::Serialize;

use crate::application::services::{AutoFixOutcome, DeployOutcome};
use crate::domain::DeployerConfig;
use crate::domain::diagnostics::DiagnosticReport;
use crate::domain::service::ServiceStatus;

/// Format a JSON error object.
///
/// Output (pretty-printed):
/// ```json
/// {
///   "error": true,
///   "message": "...",
///   "code": "..."
/// }
/// ```
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn format_error(message: &str, code: &str) -> Result<String> {
    let obj = serde_json::json!({
        "error": true,
        "message": message,
        "code": code,
    });
    serde_json::to_string_pretty(&obj).context("JSON serialization failed")
}

/// Renders domain types as JSON on stdout.
pub struct JsonRenderer;

impl JsonRenderer {
    fn print(value: &impl Serialize) -> Result<()> {
        let out = serde_json::to_string_pretty(value).context("JSON serialization failed")?;
        println!("{out}");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_version(version: &str) -> Result<()> {
        Self::print(&serde_json::json!({ "version": version }))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_server(target: &ServerTarget) -> Result<()> {
        Self::print(target)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_deployment(outcome: &DeployOutcome) -> Result<()> {
        Self::print(&serde_json::json!({
            "success": outcome.succeeded(),
            "deployment": outcome.record,
            "app": outcome.app,
            "backup": outcome.backup.as_ref().map(|b| b.path.display().to_string()),
            "error": outcome.error.as_ref().map(ToString::to_string),
        }))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_service_action(verb: &str, service: &str) -> Result<()> {
        Self::print(&serde_json::json!({ "service": service, "action": verb, "success": true }))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_service_status(service: &str, status: &ServiceStatus) -> Result<()> {
        Self::print(&serde_json::json!({ "service": service, "status": status }))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_logs(service: &str, logs: &str) -> Result<()> {
        let lines: Vec<&str> = logs.lines().collect();
        Self::print(&serde_json::json!({ "service": service, "lines": lines }))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_report(report: &DiagnosticReport) -> Result<()> {
        Self::print(report)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_fix(outcome: &AutoFixOutcome) -> Result<()> {
        Self::print(outcome)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_config(config: &DeployerConfig, path: &std::path::Path) -> Result<()> {
        Self::print(&serde_json::json!({
            "path": path.display().to_string(),
            "config": config,
        }))
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_config_value(key: &str, value: &str) -> Result<()> {
        Self::print(&serde_json::json!({ "key": key, "value": value }))
    }
}
