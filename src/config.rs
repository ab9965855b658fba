//! Gateway and dispatch configuration.
//!
//! Configuration is deserialized from the host application's config file and
//! validated once at client construction. Missing required values are a
//! fatal startup error, never a runtime error.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// Static configuration for one gateway client.
///
/// # Examples
///
/// ```toml
/// app_id = "2021000000000000"
/// gateway_url = "https://openapi.alipay.com/gateway.do"
/// service_merchant_id = "2088000000000000"
/// notify_url = "https://shop.example.com/notify/alipay"
/// private_key_path = "/etc/paybridge/private.pem"
///
/// [dispatch]
/// deadline_secs = 600
/// retry_wait_secs = 1
/// poll_interval_secs = 3
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Application identifier issued by the provider.
    pub app_id: String,

    /// Base URL of the provider gateway.
    pub gateway_url: String,

    /// Top-level merchant identifier. Operations that resolve to a different
    /// merchant run in delegation mode and carry the Auth token on the wire;
    /// operations that resolve to this merchant must not.
    #[serde(default)]
    pub service_merchant_id: String,

    /// Asynchronous notification callback URL sent with payment requests.
    #[serde(default)]
    pub notify_url: String,

    /// PEM file holding the application's RSA private key, loaded once at
    /// client construction.
    pub private_key_path: PathBuf,

    /// Retry/poll/deadline tuning for the dispatch engine.
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl GatewayConfig {
    /// Validates required fields and dispatch bounds.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when `app_id` or `gateway_url` is
    /// empty, or when dispatch intervals are out of range.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            return Err(GatewayError::Config("app_id must not be empty".to_owned()));
        }
        if self.gateway_url.is_empty() {
            return Err(GatewayError::Config("gateway_url must not be empty".to_owned()));
        }
        self.dispatch.validate()
    }
}

/// Timing policy for the dispatch state machine.
///
/// The deadline bounds one *logical* operation: it starts at the first
/// attempt and is never reset by internal retries or polling.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Overall per-operation deadline in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Wait before resending after a transport fault or a
    /// retry-immediately outcome, in seconds.
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,

    /// Interval between status probes while an async outcome is pending,
    /// in seconds. Shorter than the retry wait by design of the protocol.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            retry_wait_secs: default_retry_wait_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl DispatchConfig {
    /// Validates interval bounds.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if any interval is zero, the
    /// deadline exceeds one hour, or the poll interval is not shorter than
    /// the deadline.
    pub fn validate(&self) -> Result<()> {
        if self.deadline_secs == 0 || self.deadline_secs > 3600 {
            return Err(GatewayError::Config(
                "dispatch.deadline_secs must be between 1 and 3600".to_owned(),
            ));
        }
        if self.retry_wait_secs == 0 || self.retry_wait_secs > 60 {
            return Err(GatewayError::Config(
                "dispatch.retry_wait_secs must be between 1 and 60".to_owned(),
            ));
        }
        if self.poll_interval_secs == 0 || self.poll_interval_secs >= self.deadline_secs {
            return Err(GatewayError::Config(
                "dispatch.poll_interval_secs must be nonzero and below the deadline".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns the overall deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Returns the resend wait as a [`Duration`].
    #[must_use]
    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    /// Returns the poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_deadline_secs() -> u64 {
    600
}

fn default_retry_wait_secs() -> u64 {
    1
}

fn default_poll_interval_secs() -> u64 {
    3
}
