//! Unit tests for pb-deployer
//!
//! Services are exercised against [`mocks::FakeHost`], an in-memory stand-in
//! for an SSH server, so no test here opens a real connection.

mod deploy_pipeline;
mod diagnostics_engine;
mod executor;
mod mocks;
mod pool;
mod security_manager;
mod setup_manager;
