//! Lockdown steps, sshd_config rewriting and firewall/ban policy rendering.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::command::shell_quote;
use crate::domain::error::DeployError;

pub const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";
pub const SSHD_DROP_IN_DIR: &str = "/etc/ssh/sshd_config.d";
/// Sorted first so its values win over distro drop-ins (sshd keeps the first value seen).
pub const SSHD_DROP_IN: &str = "/etc/ssh/sshd_config.d/00-pb-deployer.conf";
pub const JAIL_LOCAL: &str = "/etc/fail2ban/jail.local";

/// sshd options enforced by lockdown, with their required values.
pub const HARDENED_SSHD_OPTIONS: &[(&str, &str)] = &[
    ("PasswordAuthentication", "no"),
    ("KbdInteractiveAuthentication", "no"),
    ("PubkeyAuthentication", "yes"),
    ("PermitRootLogin", "no"),
];

// ── Steps ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownStep {
    Init,
    VerifyAccess,
    DisablePasswordAuth,
    DisableRootLogin,
    ConfigureFirewall,
    InstallBanPolicy,
    Verify,
    Complete,
}

impl LockdownStep {
    pub const ALL: [Self; 8] = [
        Self::Init,
        Self::VerifyAccess,
        Self::DisablePasswordAuth,
        Self::DisableRootLogin,
        Self::ConfigureFirewall,
        Self::InstallBanPolicy,
        Self::Verify,
        Self::Complete,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::VerifyAccess => "verify_access",
            Self::DisablePasswordAuth => "disable_password_auth",
            Self::DisableRootLogin => "disable_root_login",
            Self::ConfigureFirewall => "configure_firewall",
            Self::InstallBanPolicy => "install_ban_policy",
            Self::Verify => "verify",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn percent(self) -> u8 {
        match self {
            Self::Init => 5,
            Self::VerifyAccess => 15,
            Self::DisablePasswordAuth => 35,
            Self::DisableRootLogin => 50,
            Self::ConfigureFirewall => 70,
            Self::InstallBanPolicy => 85,
            Self::Verify => 95,
            Self::Complete => 100,
        }
    }

    /// Whether the host may have been changed once this step starts.
    #[must_use]
    pub fn mutates_host(self) -> bool {
        !matches!(self, Self::Init | Self::VerifyAccess)
    }
}

// ── Firewall ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// One firewall allow rule, written as `22/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRule {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortRule {
    #[must_use]
    pub const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{proto}", self.port)
    }
}

impl FromStr for PortRule {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = s.trim().split_once('/').unwrap_or((s.trim(), "tcp"));
        let port: u16 = port
            .parse()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| DeployError::Validation(format!("invalid port in rule '{s}'")))?;
        let protocol = match proto {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => {
                return Err(DeployError::Validation(format!(
                    "invalid protocol '{other}' in rule '{s}' (expected tcp or udp)"
                )));
            }
        };
        Ok(Self { port, protocol })
    }
}

impl Serialize for PortRule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// ufw commands that replace all rules with exactly `rules`.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if `rules` does not allow `ssh_port`,
/// since enabling the firewall would cut the session off.
pub fn firewall_commands(rules: &[PortRule], ssh_port: u16) -> Result<Vec<String>, DeployError> {
    if !rules
        .iter()
        .any(|r| r.port == ssh_port && r.protocol == Protocol::Tcp)
    {
        return Err(DeployError::Validation(format!(
            "firewall allow-list must include the SSH port {ssh_port}/tcp"
        )));
    }
    let mut cmds = vec![
        "ufw --force reset".to_string(),
        "ufw default deny incoming".to_string(),
        "ufw default allow outgoing".to_string(),
    ];
    cmds.extend(rules.iter().map(|r| format!("ufw allow {r}")));
    cmds.push("ufw --force enable".to_string());
    Ok(cmds)
}

/// Ports listed by `ufw status` as ALLOW, e.g. `["22/tcp", "80/tcp"]`.
#[must_use]
pub fn parse_ufw_allowed(status: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in status.lines() {
        let mut parts = line.split_whitespace();
        let (Some(rule), Some(action)) = (parts.next(), parts.next()) else {
            continue;
        };
        if action == "ALLOW" && !line.contains("(v6)") && !out.iter().any(|r| r == rule) {
            out.push(rule.to_string());
        }
    }
    out
}

// ── Ban policy ────────────────────────────────────────────────────────────────

/// fail2ban settings rendered into `jail.local`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanPolicy {
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_ban_time_secs")]
    pub ban_time_secs: u64,
    #[serde(default = "default_find_time_secs")]
    pub find_time_secs: u64,
    #[serde(default = "default_ban_services")]
    pub services: Vec<String>,
}

fn default_max_retry() -> u32 {
    5
}

fn default_ban_time_secs() -> u64 {
    3600
}

fn default_find_time_secs() -> u64 {
    600
}

fn default_ban_services() -> Vec<String> {
    vec!["sshd".to_string()]
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            ban_time_secs: default_ban_time_secs(),
            find_time_secs: default_find_time_secs(),
            services: default_ban_services(),
        }
    }
}

impl BanPolicy {
    /// # Errors
    ///
    /// Returns [`DeployError::Validation`] for zero limits or odd jail names.
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.max_retry == 0 || self.ban_time_secs == 0 || self.find_time_secs == 0 {
            return Err(DeployError::Validation(
                "ban policy values must be greater than zero".to_string(),
            ));
        }
        if self.services.is_empty() {
            return Err(DeployError::Validation(
                "ban policy must watch at least one service".to_string(),
            ));
        }
        for service in &self.services {
            if service.is_empty()
                || !service
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(DeployError::Validation(format!(
                    "invalid jail name '{service}'"
                )));
            }
        }
        Ok(())
    }

    /// `jail.local` contents.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "# Managed by pb-deployer. Do not edit.\n\
             [DEFAULT]\n\
             bantime = {}\n\
             findtime = {}\n\
             maxretry = {}\n\
             backend = systemd\n",
            self.ban_time_secs, self.find_time_secs, self.max_retry
        );
        for service in &self.services {
            out.push_str(&format!("\n[{service}]\nenabled = true\n"));
        }
        out
    }
}

// ── sshd_config ───────────────────────────────────────────────────────────────

/// Set `key` to `value` in sshd_config text.
///
/// The first active occurrence in the global section is rewritten in place and
/// later global duplicates are dropped. If there is none, the option is
/// inserted before the first `Match` block so it stays global. Commented lines
/// and `Match` blocks are left untouched.
#[must_use]
pub fn set_sshd_option(config: &str, key: &str, value: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut written = false;
    let mut in_match = false;
    for line in config.lines() {
        let trimmed = line.trim_start();
        if !in_match && first_word(trimmed).eq_ignore_ascii_case("match") {
            in_match = true;
            if !written {
                out.push(format!("{key} {value}"));
                written = true;
            }
        }
        if !in_match && !trimmed.starts_with('#') && first_word(trimmed).eq_ignore_ascii_case(key)
        {
            if !written {
                out.push(format!("{key} {value}"));
                written = true;
            }
            continue;
        }
        out.push(line.to_string());
    }
    if !written {
        out.push(format!("{key} {value}"));
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Global value of `key` in sshd_config text (first active occurrence wins).
#[must_use]
pub fn sshd_option<'a>(config: &'a str, key: &str) -> Option<&'a str> {
    for line in config.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            continue;
        }
        let word = first_word(trimmed);
        if word.eq_ignore_ascii_case("match") {
            return None;
        }
        if word.eq_ignore_ascii_case(key) {
            return Some(trimmed[word.len()..].trim_start_matches([' ', '\t', '=']).trim());
        }
    }
    None
}

/// Apply every entry of [`HARDENED_SSHD_OPTIONS`].
#[must_use]
pub fn harden_sshd_config(config: &str, options: &[(&str, &str)]) -> String {
    options
        .iter()
        .fold(config.to_string(), |acc, (k, v)| set_sshd_option(&acc, k, v))
}

/// Drop-in file contents carrying the same options.
#[must_use]
pub fn render_sshd_drop_in(options: &[(&str, &str)]) -> String {
    let mut out = String::from("# Managed by pb-deployer. Do not edit.\n");
    for (k, v) in options {
        out.push_str(&format!("{k} {v}\n"));
    }
    out
}

/// Compare `sshd -T` output against the required options.
///
/// Returns the list of `option=actual` mismatches (empty when compliant).
#[must_use]
pub fn effective_sshd_mismatches(sshd_t_output: &str, required: &[(&str, &str)]) -> Vec<String> {
    let mut mismatches = Vec::new();
    for (key, want) in required {
        let lower = key.to_ascii_lowercase();
        let actual = sshd_t_output.lines().find_map(|l| {
            let mut parts = l.split_whitespace();
            (parts.next() == Some(lower.as_str())).then(|| parts.next().unwrap_or_default())
        });
        match actual {
            Some(v) if v.eq_ignore_ascii_case(want) => {}
            // sshd builds without keyboard-interactive support omit the option.
            None if lower == "kbdinteractiveauthentication" => {}
            other => mismatches.push(format!("{key}={}", other.unwrap_or("<unset>"))),
        }
    }
    mismatches
}

fn first_word(line: &str) -> &str {
    line.split(|c: char| c.is_whitespace() || c == '=')
        .next()
        .unwrap_or_default()
}

/// Backup name for a file edited in place, e.g. `/etc/ssh/sshd_config.pb-deployer.20260101T000000`.
#[must_use]
pub fn backup_path(path: &str, stamp: &str) -> String {
    format!("{path}.pb-deployer.{stamp}")
}

#[must_use]
pub fn validate_sshd_command(candidate: &str) -> String {
    format!("sshd -t -f {}", shell_quote(candidate))
}

/// Reload sshd under either unit name (Debian `ssh`, others `sshd`).
#[must_use]
pub fn reload_sshd_command() -> &'static str {
    "systemctl reload ssh 2>/dev/null || systemctl reload sshd"
}
