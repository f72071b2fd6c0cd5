//! Application services: use-case orchestration.
//!
//! Each service module implements a single use-case by composing domain logic
//! with port trait calls. Services import only from `crate::domain` and
//! `crate::application::ports`, never from `crate::infra`, `crate::commands`,
//! or `crate::output`.

pub mod deploy;
pub mod diagnostics;
pub mod security;
pub mod service_control;
pub mod setup;

use std::sync::Arc;

use deployer_common::ProgressEvent;

use crate::application::ports::ProgressSink;
use crate::domain::DeployError;

pub use deploy::{AdminCredentials, DeployOutcome, DeployRequest, DeploymentPipeline, DeploymentTask};
pub use diagnostics::{AppliedFix, AutoFixOutcome, DiagnosticsEngine};
pub use security::SecurityManager;
pub use service_control::ServiceController;
pub use setup::SetupManager;

/// Publishes step events for one operation's topic.
#[derive(Clone)]
pub(crate) struct StepEvents {
    sink: Arc<dyn ProgressSink>,
    topic: String,
}

impl StepEvents {
    pub(crate) fn new(sink: Arc<dyn ProgressSink>, topic: String) -> Self {
        Self { sink, topic }
    }

    pub(crate) fn running(&self, step: &str, message: impl Into<String>, percent: u8) {
        self.sink
            .emit(&self.topic, ProgressEvent::running(step, message, percent));
    }

    pub(crate) fn success(&self, step: &str, message: impl Into<String>, percent: u8) {
        self.sink
            .emit(&self.topic, ProgressEvent::success(step, message, percent));
    }

    pub(crate) fn failed(&self, step: &str, message: impl Into<String>, error: &DeployError, percent: u8) {
        self.sink.emit(
            &self.topic,
            ProgressEvent::failed(step, message, error.to_string(), percent),
        );
    }
}
