//! Connection identity for pooled sessions.

use std::fmt;

use deployer_common::{Identity, ServerTarget};

/// `(host, port, username)`: one pooled session per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl ConnectionKey {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    #[must_use]
    pub fn for_target(target: &ServerTarget, identity: Identity) -> Self {
        Self::new(target.host.clone(), target.port, target.username(identity))
    }

    /// `host:port`, as used in error messages and known_hosts lookups.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.username == "root"
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
