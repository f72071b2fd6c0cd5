//! Application context: the state passed to every command handler.
//!
//! `AppContext` holds output settings and the local stores. The SSH engine
//! (pool, executor, managers) is built on demand with [`AppContext::engine`]
//! so commands that never touch a server do not open sockets.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::application::ports::{ConfigStore, ProgressSink};
use crate::application::services::{
    DeploymentPipeline, DiagnosticsEngine, SecurityManager, ServiceController, SetupManager,
};
use crate::domain::DeployerConfig;
use crate::infra::backups::FsBackupStore;
use crate::infra::config::YamlConfigStore;
use crate::infra::executor::PooledExecutor;
use crate::infra::http_probe::HttpHealthProbe;
use crate::infra::inventory::InventoryStore;
use crate::infra::known_hosts::KnownHostsStore;
use crate::infra::local_fixer::SshLocalFixer;
use crate::infra::network::TokioNetworkProbe;
use crate::infra::pool::ConnectionPool;
use crate::infra::progress::{FanoutSink, TracingSink};
use crate::infra::transport::SshConnector;
use crate::output::{HumanRenderer, JsonRenderer, OutputContext, Renderer, TerminalSink};

/// Output rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable terminal output (default).
    Human,
    /// Machine-readable JSON output.
    Json,
}

/// Output rendering flags.
pub struct OutputFlags {
    /// Disable ANSI color output.
    pub no_color: bool,
    /// Suppress non-error output.
    pub quiet: bool,
    /// Enable JSON output mode.
    pub json: bool,
}

/// Behaviour flags.
pub struct BehaviourFlags {
    /// Skip interactive prompts (also set by `CI` / `PB_DEPLOYER_YES` env vars).
    pub yes: bool,
}

/// Flags passed from the top-level CLI to `AppContext::new`.
pub struct AppFlags {
    /// Output rendering options.
    pub output: OutputFlags,
    /// Behaviour options.
    pub behaviour: BehaviourFlags,
}

/// Unified application context passed to every command handler.
pub struct AppContext {
    /// Terminal output context (colors, quiet mode).
    pub output: OutputContext,
    /// Output rendering mode (human vs JSON).
    pub mode: OutputMode,
    /// `config.yaml` store.
    pub config_store: YamlConfigStore,
    /// Server/app/version/deployment records.
    pub inventory: InventoryStore,
    /// When `true`, skip interactive prompts and use defaults.
    ///
    /// Set when `--yes` / `-y` is passed, or when the `CI` or
    /// `PB_DEPLOYER_YES` environment variables are present.
    pub non_interactive: bool,
}

impl AppContext {
    /// Construct an `AppContext` from top-level CLI flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new(flags: &AppFlags) -> Result<Self> {
        let ci_env = std::env::var("CI").is_ok() || std::env::var("PB_DEPLOYER_YES").is_ok();
        let non_interactive = flags.behaviour.yes || ci_env;

        let mode = if flags.output.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        };
        // JSON owns stdout; human chatter would corrupt it.
        let quiet = flags.output.quiet || flags.output.json;

        Ok(Self {
            output: OutputContext::new(flags.output.no_color, quiet),
            mode,
            config_store: YamlConfigStore::new()?,
            inventory: InventoryStore::new()?,
            non_interactive,
        })
    }

    /// Returns `true` when JSON output mode is active.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.mode == OutputMode::Json
    }

    /// Returns the appropriate `Renderer` variant for the current output mode.
    #[must_use]
    pub fn renderer(&self) -> Renderer<'_> {
        match self.mode {
            OutputMode::Human => Renderer::Human(HumanRenderer::new(&self.output)),
            OutputMode::Json => Renderer::Json(JsonRenderer),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn config(&self) -> Result<DeployerConfig> {
        self.config_store.load()
    }

    /// Ask the user for confirmation.
    ///
    /// When `non_interactive` is `true` (CI, `--yes` flag, or `PB_DEPLOYER_YES` env),
    /// returns `default` immediately without prompting.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal prompt fails (e.g. no TTY available).
    pub fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        if self.non_interactive {
            return Ok(default);
        }
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()?;
        Ok(confirmed)
    }

    /// Build the SSH engine from the current configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded or a local store
    /// cannot be located.
    pub fn engine(&self) -> Result<Engine> {
        let config = self.config()?;
        let known_hosts = Arc::new(match &config.ssh.known_hosts {
            Some(path) => KnownHostsStore::with_path(path.clone()),
            None => KnownHostsStore::new()?,
        });
        let connector = Arc::new(SshConnector::new(known_hosts, config.ssh.host_key_policy));
        let pool = Arc::new(ConnectionPool::new(connector.clone(), config.pool.clone()));
        let monitor = pool.spawn_health_monitor();
        let executor = Arc::new(PooledExecutor::new(Arc::clone(&pool), &config.executor));

        let sink: Arc<dyn ProgressSink> = if self.is_json() || self.output.quiet {
            Arc::new(TracingSink)
        } else {
            let terminal: Arc<dyn ProgressSink> = Arc::new(TerminalSink::new(&self.output));
            let log: Arc<dyn ProgressSink> = Arc::new(TracingSink);
            Arc::new(FanoutSink::new(vec![terminal, log]))
        };
        let health = Arc::new(HttpHealthProbe::new()?);
        let backups = Arc::new(FsBackupStore::new()?);
        let local = Arc::new(SshLocalFixer::new(
            Arc::clone(&connector),
            config.pool.connect_timeout(),
        ));

        Ok(Engine {
            setup: SetupManager::new(
                executor.clone(),
                Arc::clone(&sink),
                config.security.allowed_ports.clone(),
            ),
            security: SecurityManager::new(executor.clone(), Arc::clone(&sink), config.security.clone()),
            services: ServiceController::new(executor.clone()),
            pipeline: DeploymentPipeline::new(
                executor.clone(),
                Arc::clone(&sink),
                health,
                backups,
                config.deploy.clone(),
            ),
            diagnostics: DiagnosticsEngine::new(
                connector,
                executor,
                Arc::new(TokioNetworkProbe),
                local,
                sink,
                config.pool.connect_timeout(),
            ),
            pool,
            monitor,
        })
    }
}

/// The managers wired over one connection pool.
pub struct Engine {
    pub setup: SetupManager,
    pub security: SecurityManager,
    pub services: ServiceController,
    pub pipeline: DeploymentPipeline,
    pub diagnostics: DiagnosticsEngine,
    pub pool: Arc<ConnectionPool>,
    monitor: JoinHandle<()>,
}

impl Engine {
    /// Close every pooled session and stop the health monitor.
    pub async fn shutdown(self) {
        tracing::debug!(stats = ?self.pool.stats(), "closing connection pool");
        self.pool.shutdown().await;
        if tokio::time::timeout(Duration::from_secs(1), self.monitor)
            .await
            .is_err()
        {
            tracing::debug!("health monitor did not stop in time");
        }
    }
}

/// Read a local file with a readable error.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn read_file(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}
