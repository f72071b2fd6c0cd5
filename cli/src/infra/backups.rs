//! Filesystem `BackupStore` under `~/.pb-deployer/backups/<app>/`.
//!
//! Each backup is `<id>.tar.gz` plus a `<id>.json` sidecar with its metadata.
//! Ids start with a UTC timestamp so lexical order is chronological.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::ports::{BackupEntry, BackupStore};
use crate::domain::DeployError;

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version_label: Option<String>,
    created_at: DateTime<Utc>,
}

pub struct FsBackupStore {
    root: PathBuf,
}

impl FsBackupStore {
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self, DeployError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DeployError::Precondition("cannot determine home directory".into()))?;
        Ok(Self::with_root(home.join(".pb-deployer").join("backups")))
    }

    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    fn app_dir(&self, app_id: &str) -> Result<PathBuf, DeployError> {
        if app_id.is_empty() || app_id.contains(['/', '\\']) || app_id.starts_with('.') {
            return Err(DeployError::Validation(format!("invalid app id for backup: {app_id}")));
        }
        Ok(self.root.join(app_id))
    }
}

fn sidecar_path(archive: &Path) -> PathBuf {
    archive.with_extension("").with_extension("json")
}

#[async_trait]
impl BackupStore for FsBackupStore {
    async fn save(
        &self,
        app_id: &str,
        version_label: Option<&str>,
        data: &[u8],
    ) -> Result<BackupEntry, DeployError> {
        let dir = self.app_dir(app_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DeployError::io(format!("create {}", dir.display()), e))?;

        let created_at = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", created_at.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8]);
        let path = dir.join(format!("{id}.tar.gz"));

        tokio::fs::write(&path, data)
            .await
            .map_err(|e| DeployError::io(format!("write {}", path.display()), e))?;
        let sidecar = Sidecar {
            app_id: app_id.to_string(),
            version_label: version_label.map(str::to_string),
            created_at,
        };
        let meta = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| DeployError::Precondition(format!("cannot encode backup metadata: {e}")))?;
        let meta_path = sidecar_path(&path);
        tokio::fs::write(&meta_path, meta)
            .await
            .map_err(|e| DeployError::io(format!("write {}", meta_path.display()), e))?;

        tracing::info!(app = app_id, backup = %path.display(), bytes = data.len(), "saved backup");
        Ok(BackupEntry {
            id,
            app_id: app_id.to_string(),
            version_label: sidecar.version_label,
            path,
            created_at,
        })
    }

    async fn load(&self, entry: &BackupEntry) -> Result<Vec<u8>, DeployError> {
        tokio::fs::read(&entry.path)
            .await
            .map_err(|e| DeployError::io(format!("read backup {}", entry.path.display()), e))
    }

    async fn list(&self, app_id: &str) -> Result<Vec<BackupEntry>, DeployError> {
        let dir = self.app_dir(app_id)?;
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DeployError::io(format!("list {}", dir.display()), e)),
        };

        let mut entries = Vec::new();
        while let Some(item) = read_dir
            .next_entry()
            .await
            .map_err(|e| DeployError::io(format!("list {}", dir.display()), e))?
        {
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".tar.gz") else {
                continue;
            };
            let Ok(meta) = tokio::fs::read(sidecar_path(&path)).await else {
                tracing::debug!(path = %path.display(), "backup without metadata ignored");
                continue;
            };
            let Ok(sidecar) = serde_json::from_slice::<Sidecar>(&meta) else {
                continue;
            };
            entries.push(BackupEntry {
                id: id.to_string(),
                app_id: sidecar.app_id,
                version_label: sidecar.version_label,
                path: path.clone(),
                created_at: sidecar.created_at,
            });
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn prune(&self, app_id: &str, keep: usize) -> Result<usize, DeployError> {
        let entries = self.list(app_id).await?;
        let mut removed = 0;
        for entry in entries.iter().skip(keep) {
            tokio::fs::remove_file(&entry.path)
                .await
                .map_err(|e| DeployError::io(format!("remove {}", entry.path.display()), e))?;
            let _ = tokio::fs::remove_file(sidecar_path(&entry.path)).await;
            removed += 1;
        }
        Ok(removed)
    }
}
