//! Domain layer: pure business logic, types, and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All functions are synchronous and take data in, returning data out.

pub mod artifact;
pub mod command;
pub mod config;
pub mod deployment;
pub mod diagnostics;
pub mod error;
pub mod security;
pub mod service;
pub mod setup;
pub mod ssh;
pub mod target;

pub use command::{CommandOutput, RemoteCommand};
pub use config::{DeployerConfig, validate_config_key, validate_config_value};
pub use error::{ConfigError, DeployError, ErrorKind, InventoryError};
pub use target::ConnectionKey;
