//! Diagnostic report assembly and failure classification.
//!
//! Pure functions only. The checks themselves run in
//! `application::services::diagnostics`.

use chrono::{DateTime, Utc};
use deployer_common::{Diagnostic, DiagnosticStatus, Remediation};
use serde::Serialize;

// ── Check names ───────────────────────────────────────────────────────────────

pub const TCP_REACHABILITY: &str = "tcp_reachability";
pub const KEY_FILE: &str = "key_file";
pub const KNOWN_HOST: &str = "known_host";
pub const PRIVILEGED_AUTH: &str = "privileged_auth";
pub const UNPRIVILEGED_AUTH: &str = "unprivileged_auth";
pub const SUDO_ACCESS: &str = "sudo_access";
pub const REMOTE_DIRECTORIES: &str = "remote_directories";

/// Detail key carrying the [`FailureClass`] of a failed check.
pub const FAILURE_DETAIL: &str = "failure";

pub const BAN_SUGGESTION: &str = "The server accepted TCP connections and then refused SSH: this is \
     the signature of an intrusion-ban lockout (fail2ban). Wait for the ban to expire or unban your \
     address from the provider console (fail2ban-client set sshd unbanip <ip>).";

// ── Classification ────────────────────────────────────────────────────────────

/// Coarse cause of a failed connection or login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Refused,
    TimedOut,
    Unreachable,
    DnsFailure,
    HostKeyMismatch,
    AuthRejected,
    LoginDisabled,
    Other,
}

impl FailureClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Refused => "refused",
            Self::TimedOut => "timed_out",
            Self::Unreachable => "unreachable",
            Self::DnsFailure => "dns_failure",
            Self::HostKeyMismatch => "host_key_mismatch",
            Self::AuthRejected => "auth_rejected",
            Self::LoginDisabled => "login_disabled",
            Self::Other => "other",
        }
    }

    /// Human advice for this class of failure.
    #[must_use]
    pub fn suggestion(self) -> &'static str {
        match self {
            Self::Refused => "Check that sshd is running and listening on the configured port.",
            Self::TimedOut => "Check security groups, firewall rules and the server's public address.",
            Self::Unreachable => "Check the network route to the server and that it is powered on.",
            Self::DnsFailure => "Check the host name; it does not resolve.",
            Self::HostKeyMismatch => {
                "The server's host key changed. Verify it out-of-band before removing the old entry from the known_hosts file."
            }
            Self::AuthRejected => {
                "Make sure your public key is in the account's authorized_keys and the key is loaded in ssh-agent."
            }
            Self::LoginDisabled => "Root login is disabled after lockdown; use the service account.",
            Self::Other => "Re-run with --verbose for transport details.",
        }
    }
}

/// Classify a connection or authentication error message.
#[must_use]
pub fn classify_failure(message: &str) -> FailureClass {
    let m = message.to_ascii_lowercase();
    if m.contains("locked down") || m.contains("login is disabled") {
        FailureClass::LoginDisabled
    } else if m.contains("host key") && (m.contains("changed") || m.contains("mismatch")) {
        FailureClass::HostKeyMismatch
    } else if m.contains("refused") || m.contains("reset by peer") || m.contains("connection closed")
    {
        FailureClass::Refused
    } else if m.contains("timed out") || m.contains("timeout") {
        FailureClass::TimedOut
    } else if m.contains("failed to lookup")
        || m.contains("name or service not known")
        || m.contains("no address")
        || m.contains("resolve")
    {
        FailureClass::DnsFailure
    } else if m.contains("unreachable") || m.contains("no route") {
        FailureClass::Unreachable
    } else if m.contains("authentication") || m.contains("permission denied") {
        FailureClass::AuthRejected
    } else {
        FailureClass::Other
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Healthy,
    Degraded,
    Error,
}

/// Post-processed outcome of one diagnostic run.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub target_id: String,
    pub overall: Overall,
    pub diagnostics: Vec<Diagnostic>,
    pub suggestions: Vec<String>,
    pub ban_suspected: bool,
    pub generated_at: DateTime<Utc>,
}

impl DiagnosticReport {
    #[must_use]
    pub fn build(target_id: &str, diagnostics: Vec<Diagnostic>) -> Self {
        let ban_suspected = ban_signature(&diagnostics);
        let mut suggestions = dedupe_suggestions(&diagnostics);
        if ban_suspected && !suggestions.iter().any(|s| s == BAN_SUGGESTION) {
            suggestions.insert(0, BAN_SUGGESTION.to_string());
        }
        Self {
            target_id: target_id.to_string(),
            overall: summarize(&diagnostics),
            diagnostics,
            suggestions,
            ban_suspected,
            generated_at: Utc::now(),
        }
    }

    /// Remediations that may be applied without asking, in check order.
    #[must_use]
    pub fn safe_remediations(&self) -> Vec<Remediation> {
        let mut out: Vec<Remediation> = Vec::new();
        for d in &self.diagnostics {
            if d.status == DiagnosticStatus::Success {
                continue;
            }
            if let Some(r) = &d.remediation
                && r.is_safe()
                && !out.contains(r)
            {
                out.push(r.clone());
            }
        }
        out
    }

    #[must_use]
    pub fn get(&self, step: &str) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.step == step)
    }
}

/// `healthy` when every check passed, `error` if any failed, else `degraded`.
#[must_use]
pub fn summarize(diagnostics: &[Diagnostic]) -> Overall {
    match diagnostics.iter().map(|d| d.status).max() {
        None | Some(DiagnosticStatus::Success) => Overall::Healthy,
        Some(DiagnosticStatus::Warning) => Overall::Degraded,
        Some(DiagnosticStatus::Error) => Overall::Error,
    }
}

/// Suggestions in check order, first occurrence kept.
#[must_use]
pub fn dedupe_suggestions(diagnostics: &[Diagnostic]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in diagnostics.iter().filter_map(|d| d.suggestion.as_ref()) {
        if !out.contains(s) {
            out.push(s.clone());
        }
    }
    out
}

/// TCP reachable, then an SSH login refused: a probable fail2ban lockout.
#[must_use]
pub fn ban_signature(diagnostics: &[Diagnostic]) -> bool {
    let reachable = diagnostics
        .iter()
        .any(|d| d.step == TCP_REACHABILITY && d.status == DiagnosticStatus::Success);
    reachable
        && diagnostics.iter().any(|d| {
            (d.step == PRIVILEGED_AUTH || d.step == UNPRIVILEGED_AUTH)
                && d.status == DiagnosticStatus::Error
                && d.detail.get(FAILURE_DETAIL).map(String::as_str)
                    == Some(FailureClass::Refused.as_str())
        })
}
