pub mod topics;
pub mod types;

pub use topics::{
    deployment_progress, server_diagnostics, server_security, server_setup, validate_topic_id,
};
pub use types::*;
