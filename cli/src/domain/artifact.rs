//! Release archive inspection.
//!
//! A release is a gzipped tarball with the `pocketbase` binary at its root and
//! a `pb_public/` directory; `pb_migrations/` and `pb_hooks/` are optional.
//! Inspection works on in-memory bytes and never touches the filesystem.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::domain::error::DeployError;
use crate::domain::service::APP_BINARY;

pub const PUBLIC_DIR: &str = "pb_public";
pub const MIGRATIONS_DIR: &str = "pb_migrations";
pub const HOOKS_DIR: &str = "pb_hooks";

/// Top-level entries a deploy replaces. `pb_data` is never among them.
pub const MANAGED_ENTRIES: &[&str] = &[APP_BINARY, PUBLIC_DIR, MIGRATIONS_DIR, HOOKS_DIR];

/// What a validated archive contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactManifest {
    pub sha256: String,
    pub size: u64,
    pub entries: usize,
    pub has_migrations: bool,
    pub has_hooks: bool,
}

/// Validate a release archive.
///
/// # Errors
///
/// Returns [`DeployError::Validation`] if the bytes are not a gzipped tar,
/// an entry escapes the archive root, the binary is missing (or not a regular
/// file), or `pb_public/` is missing.
pub fn inspect_artifact(bytes: &[u8]) -> Result<ArtifactManifest, DeployError> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| invalid(format!("not a tar.gz archive: {e}")))?;

    let mut has_binary = false;
    let mut has_public = false;
    let mut has_migrations = false;
    let mut has_hooks = false;
    let mut count = 0usize;

    for entry in entries {
        let entry = entry.map_err(|e| invalid(format!("corrupt archive: {e}")))?;
        let raw = entry
            .path()
            .map_err(|e| invalid(format!("unreadable entry name: {e}")))?
            .into_owned();
        let path = normalize_entry(&raw)?;
        let kind = entry.header().entry_type();

        if kind.is_symlink() || kind.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(|e| invalid(format!("unreadable link target: {e}")))?
                .ok_or_else(|| invalid(format!("link {} has no target", raw.display())))?;
            if target.is_absolute() || target.components().any(|c| c == Component::ParentDir) {
                return Err(invalid(format!(
                    "link {} points outside the archive",
                    raw.display()
                )));
            }
        }

        let Some(top) = path.components().next() else {
            continue;
        };
        count += 1;
        let top = top.as_os_str().to_string_lossy();
        let nested = path.components().count() > 1;
        match top.as_ref() {
            APP_BINARY if !nested => {
                if !kind.is_file() {
                    return Err(invalid(format!("'{APP_BINARY}' must be a regular file")));
                }
                has_binary = true;
            }
            PUBLIC_DIR => has_public = true,
            MIGRATIONS_DIR => has_migrations = true,
            HOOKS_DIR => has_hooks = true,
            _ => {}
        }
    }

    if count == 0 {
        return Err(invalid("archive is empty".to_string()));
    }
    if !has_binary {
        return Err(invalid(format!(
            "archive is missing the '{APP_BINARY}' binary at its root"
        )));
    }
    if !has_public {
        return Err(invalid(format!("archive is missing the '{PUBLIC_DIR}/' directory")));
    }

    Ok(ArtifactManifest {
        sha256: sha256_hex(bytes),
        size: bytes.len() as u64,
        entries: count,
        has_migrations,
        has_hooks,
    })
}

/// Strip `./` and reject absolute paths or `..` components.
fn normalize_entry(raw: &Path) -> Result<PathBuf, DeployError> {
    let mut out = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(format!(
                    "entry '{}' escapes the archive root",
                    raw.display()
                )));
            }
        }
    }
    Ok(out)
}

fn invalid(msg: String) -> DeployError {
    DeployError::Validation(format!("invalid release archive: {msg}"))
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_encode(&Sha256::digest(bytes))
}

/// Lowercase hex encoding.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
    }
    out
}
