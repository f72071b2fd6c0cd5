//! Application layer: port trait definitions and use-case orchestration.
//!
//! This module depends only on `crate::domain`, never on `crate::infra`,
//! `crate::commands`, or `crate::output`.

pub mod context;
pub mod ports;
pub mod services;
pub mod shell;
pub mod task;

pub use context::CallContext;
pub use ports::{
    BackupEntry, BackupStore, ConfigStore, HealthProbe, LocalFixer, NetworkProbe, NullSink,
    ProgressSink, RemoteExecutor, RemoteSession, SessionConnector, TcpProbe,
};
pub use task::{TaskHandle, spawn_operation};
