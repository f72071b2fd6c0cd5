//! Infrastructure layer: concrete implementations of application port traits.
//!
//! This module contains all I/O-performing code: the russh transport, the
//! connection pool and executor, HTTP and TCP probes, and the local YAML/JSON
//! stores under `~/.pb-deployer/`.
//!
//! Imports from `crate::domain` and `crate::application` are allowed.
//! Imports from `crate::commands` or `crate::output` are forbidden.

pub mod backups;
pub mod config;
pub mod executor;
pub mod http_probe;
pub mod inventory;
pub mod known_hosts;
pub mod local_fixer;
pub mod network;
pub mod pool;
pub mod progress;
pub mod transport;
