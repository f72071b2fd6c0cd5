//! `pbdeploy config`: show, read and change settings.

use anyhow::Result;
use clap::Subcommand;

use crate::app::AppContext;
use crate::application::ports::ConfigStore;
use crate::domain::config::{get_config_value, set_config_value};

/// Config subcommands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Print one setting
    Get {
        /// Setting key, e.g. pool.max_connections
        key: String,
    },
    /// Set configuration value
    Set {
        /// Setting key, e.g. pool.max_connections
        key: String,
        /// New value
        value: String,
    },
}

/// Run the config command.
///
/// # Errors
///
/// Returns an error if the key or value is invalid or the file cannot be
/// read or written.
pub fn run(app: &AppContext, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let config = app.config_store.load()?;
            app.renderer().render_config(&config, app.config_store.path())
        }
        ConfigCommand::Get { key } => {
            let config = app.config_store.load()?;
            let value = get_config_value(&config, &key)?;
            app.renderer().render_config_value(&key, &value)
        }
        ConfigCommand::Set { key, value } => {
            let mut config = app.config_store.load()?;
            set_config_value(&mut config, &key, &value)?;
            app.config_store.save(&config)?;
            let stored = get_config_value(&config, &key)?;
            app.renderer().render_config_set(&key, &stored)
        }
    }
}
