//! JSON inventory of servers, applications, versions and deployments.
//!
//! Records are edited by hand or by an external persistence layer; the CLI
//! reads them and writes back flag and status changes. Saves are atomic
//! (temp file + rename).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use deployer_common::{DeploymentRecord, ManagedApplication, ReleaseVersion, ServerTarget};
use serde::{Deserialize, Serialize};

use crate::domain::InventoryError;
use crate::infra::known_hosts::set_permissions;

/// Deployment records kept per application.
const DEPLOYMENT_HISTORY: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Inventory {
    pub servers: Vec<ServerTarget>,
    pub apps: Vec<ManagedApplication>,
    pub versions: Vec<ReleaseVersion>,
    pub deployments: Vec<DeploymentRecord>,
}

impl Inventory {
    /// Look a server up by id, then by name.
    ///
    /// # Errors
    ///
    /// [`InventoryError::ServerNotFound`] if neither matches.
    pub fn server(&self, id_or_name: &str) -> Result<&ServerTarget, InventoryError> {
        self.servers
            .iter()
            .find(|s| s.id == id_or_name)
            .or_else(|| self.servers.iter().find(|s| s.name == id_or_name))
            .ok_or_else(|| InventoryError::ServerNotFound(id_or_name.to_string()))
    }

    /// Look an application up by id, then by name.
    ///
    /// # Errors
    ///
    /// [`InventoryError::AppNotFound`] if neither matches.
    pub fn app(&self, id_or_name: &str) -> Result<&ManagedApplication, InventoryError> {
        self.apps
            .iter()
            .find(|a| a.id == id_or_name)
            .or_else(|| self.apps.iter().find(|a| a.name == id_or_name))
            .ok_or_else(|| InventoryError::AppNotFound(id_or_name.to_string()))
    }

    /// The version of `app_id` with the given label.
    ///
    /// # Errors
    ///
    /// [`InventoryError::VersionNotFound`] if the app has no such version.
    pub fn version(&self, app_id: &str, label: &str) -> Result<&ReleaseVersion, InventoryError> {
        self.versions
            .iter()
            .find(|v| v.app_id == app_id && v.label == label)
            .ok_or_else(|| InventoryError::VersionNotFound {
                app: app_id.to_string(),
                version: label.to_string(),
            })
    }

    /// Replace the server with the same id, or append it.
    pub fn put_server(&mut self, server: ServerTarget) {
        match self.servers.iter_mut().find(|s| s.id == server.id) {
            Some(slot) => *slot = server,
            None => self.servers.push(server),
        }
    }

    /// Replace the application with the same id, or append it.
    pub fn put_app(&mut self, app: ManagedApplication) {
        match self.apps.iter_mut().find(|a| a.id == app.id) {
            Some(slot) => *slot = app,
            None => self.apps.push(app),
        }
    }

    /// Register `artifact` as version `label` of `app_id`, reusing an
    /// existing record with that label.
    pub fn register_version(&mut self, app_id: &str, label: &str, artifact: &Path) -> ReleaseVersion {
        if let Some(existing) = self
            .versions
            .iter_mut()
            .find(|v| v.app_id == app_id && v.label == label)
        {
            existing.artifact_path = artifact.to_path_buf();
            return existing.clone();
        }
        let version = ReleaseVersion {
            id: uuid::Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            label: label.to_string(),
            artifact_path: artifact.to_path_buf(),
            notes: None,
            created_at: Utc::now(),
        };
        self.versions.push(version.clone());
        version
    }

    /// Store a finished deployment, trimming old history for that app.
    pub fn record_deployment(&mut self, record: DeploymentRecord) {
        self.deployments.retain(|d| d.id != record.id);
        let app_id = record.app_id.clone();
        self.deployments.push(record);
        let count = self.deployments.iter().filter(|d| d.app_id == app_id).count();
        let mut excess = count.saturating_sub(DEPLOYMENT_HISTORY);
        self.deployments.retain(|d| {
            if excess > 0 && d.app_id == app_id {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Deployments of `app_id`, oldest first.
    pub fn deployments_for<'a>(&'a self, app_id: &'a str) -> impl Iterator<Item = &'a DeploymentRecord> {
        self.deployments.iter().filter(move |d| d.app_id == app_id)
    }
}

/// Inventory file manager.
pub struct InventoryStore {
    path: PathBuf,
}

impl InventoryStore {
    /// `$PB_DEPLOYER_INVENTORY`, or `~/.pb-deployer/inventory.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self> {
        if let Ok(val) = std::env::var("PB_DEPLOYER_INVENTORY") {
            return Ok(Self::with_path(PathBuf::from(val)));
        }
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self::with_path(home.join(".pb-deployer").join("inventory.json")))
    }

    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty inventory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Inventory> {
        if !self.path.exists() {
            return Ok(Inventory::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading inventory {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing inventory {}", self.path.display()))
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, inventory: &Inventory) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(inventory).context("serializing inventory")?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        set_permissions(&temp_path, 0o600)?;
        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("finalizing inventory {}", self.path.display()))?;
        Ok(())
    }

    /// Load, apply `change`, save.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or saving fails, or whatever `change` returns.
    pub fn update<T>(&self, change: impl FnOnce(&mut Inventory) -> Result<T>) -> Result<T> {
        let mut inventory = self.load()?;
        let out = change(&mut inventory)?;
        self.save(&inventory)?;
        Ok(out)
    }
}
