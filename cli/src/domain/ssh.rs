//! known_hosts line handling and public key validation.
//!
//! Pure functions only: the file itself is owned by `infra::known_hosts`.

use crate::domain::error::DeployError;

/// Key types accepted for `authorized_keys` and host keys.
pub const ACCEPTED_KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

/// Result of looking a presented host key up in known_hosts content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// No entry for this host.
    Unknown,
    /// An entry matches the presented key.
    Trusted,
    /// The host is known under a different key of the same type.
    Changed { known: String },
}

/// Host column for a known_hosts line: bare for port 22, `[host]:port` otherwise.
#[must_use]
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

/// Render one known_hosts line. `key` is the OpenSSH `type base64` form.
#[must_use]
pub fn format_known_host(host: &str, port: u16, key: &str) -> String {
    format!("{} {}", host_pattern(host, port), key.trim())
}

/// Compare `presented` (OpenSSH `type base64 [comment]`) against `content`.
///
/// Hashed (`|1|`) and marker (`@cert-authority`, `@revoked`) lines are skipped.
#[must_use]
pub fn check_host_key(content: &str, host: &str, port: u16, presented: &str) -> HostKeyStatus {
    let pattern = host_pattern(host, port);
    let Some((kind, material)) = split_key(presented) else {
        return HostKeyStatus::Unknown;
    };
    let mut changed = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(hosts), Some(k), Some(m)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if !hosts.split(',').any(|h| h == pattern) {
            continue;
        }
        if k == kind && m == material {
            return HostKeyStatus::Trusted;
        }
        if k == kind {
            changed = Some(format!("{k} {m}"));
        }
    }
    changed.map_or(HostKeyStatus::Unknown, |known| HostKeyStatus::Changed { known })
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split_whitespace();
    Some((parts.next()?, parts.next()?))
}

/// Validate a single-line OpenSSH public key (`type base64 [comment]`).
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if the key spans lines, has an
/// unsupported type, or has no base64 material.
pub fn validate_public_key(line: &str) -> Result<(), DeployError> {
    let line = line.trim();
    if line.contains('\n') || line.contains('\r') {
        return Err(DeployError::Validation(
            "public key must be a single line".to_string(),
        ));
    }
    let (kind, material) = split_key(line).ok_or_else(|| {
        DeployError::Validation("public key must look like '<type> <base64> [comment]'".into())
    })?;
    if !ACCEPTED_KEY_TYPES.contains(&kind) {
        return Err(DeployError::Validation(format!(
            "unsupported public key type '{kind}' (expected one of: {})",
            ACCEPTED_KEY_TYPES.join(", ")
        )));
    }
    if material.len() < 16
        || !material
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
    {
        return Err(DeployError::Validation(
            "public key material is not valid base64".to_string(),
        ));
    }
    Ok(())
}

/// Merge `keys` into existing `authorized_keys` content, skipping keys that are
/// already present (compared on type and material, ignoring comments).
#[must_use]
pub fn merge_authorized_keys(existing: &str, keys: &[String]) -> String {
    let mut out = existing.trim_end().to_string();
    let mut present: Vec<(String, String)> = existing
        .lines()
        .filter_map(|l| split_key(l).map(|(k, m)| (k.to_string(), m.to_string())))
        .collect();
    for key in keys {
        let Some((k, m)) = split_key(key) else {
            continue;
        };
        if present.iter().any(|(pk, pm)| pk == k && pm == m) {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(key.trim());
        present.push((k.to_string(), m.to_string()));
    }
    out.push('\n');
    out
}
