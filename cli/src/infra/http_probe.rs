//! `HealthProbe` over reqwest.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::application::ports::HealthProbe;

pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pb-deployer/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        tracing::debug!(url, "health probe");
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) if e.is_timeout() => Err(format!("no response within {}s", timeout.as_secs())),
            Err(e) if e.is_connect() => Err(format!("connection failed: {e}")),
            Err(e) => Err(e.to_string()),
        }
    }
}
