/// Subscription key prefixes for progress notifications
pub mod prefixes {
    /// Progress of a server setup run
    /// Format: server_setup_{server_id}
    pub const SERVER_SETUP: &str = "server_setup";

    /// Progress of a security lockdown run
    /// Format: server_security_{server_id}
    pub const SERVER_SECURITY: &str = "server_security";

    /// Progress of a deploy or rollback
    /// Format: deployment_progress_{deployment_id}
    pub const DEPLOYMENT_PROGRESS: &str = "deployment_progress";

    /// Diagnostic results as they are produced
    /// Format: server_diagnostics_{server_id}
    pub const SERVER_DIAGNOSTICS: &str = "server_diagnostics";
}

/// Longest identifier accepted in a topic.
pub const MAX_TOPIC_ID_LEN: usize = 64;

pub fn server_setup(server_id: &str) -> String {
    format!("{}_{server_id}", prefixes::SERVER_SETUP)
}

pub fn server_security(server_id: &str) -> String {
    format!("{}_{server_id}", prefixes::SERVER_SECURITY)
}

pub fn deployment_progress(deployment_id: &str) -> String {
    format!("{}_{deployment_id}", prefixes::DEPLOYMENT_PROGRESS)
}

pub fn server_diagnostics(server_id: &str) -> String {
    format!("{}_{server_id}", prefixes::SERVER_DIAGNOSTICS)
}

/// Validate an identifier before it is embedded in a topic.
/// Accepts 1..=64 chars of `[A-Za-z0-9_-]`, which keeps topics unambiguous
/// for subscribers that split on the prefix.
pub fn validate_topic_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("id must not be empty");
    }
    if id.len() > MAX_TOPIC_ID_LEN {
        return Err("id must be at most 64 characters");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("id may only contain [A-Za-z0-9_-]");
    }
    Ok(())
}
