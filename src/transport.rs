//! HTTP transport seam.
//!
//! The dispatch engine only needs "fetch this signed URL, give me the body".
//! Keeping that behind a trait lets tests script provider responses without
//! a network, and keeps reqwest out of every other module.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use reqwest::Client;

use crate::error::Result;

/// Shared HTTP client with connection pooling.
///
/// A singleton avoids recreating the client per transport instance, so all
/// default transports share one connection pool.
static DEFAULT_HTTP_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .pool_max_idle_per_host(100)
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("default HTTP client construction cannot fail with static options")
});

/// Sends one signed request and returns the raw response body.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a GET against the fully assembled, already-signed URL.
    ///
    /// # Errors
    ///
    /// Returns [`crate::GatewayError::Http`] on any transport-level fault.
    /// The dispatcher treats those as transient and retries within the
    /// operation deadline.
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Production transport backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport using the shared pooled client.
    #[must_use]
    pub fn new() -> Self {
        Self { client: DEFAULT_HTTP_CLIENT.clone() }
    }

    /// Creates a transport with a caller-provided client, for custom
    /// timeouts or proxies.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        Ok(response.text().await?)
    }
}
