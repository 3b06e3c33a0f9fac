//! Client configuration
//!
//! Stored as camelCase JSON. Every field has a default, so an empty object
//! is a valid configuration.

use crate::error::{ClientError, Result};
use crate::role::{RoleMap, ServerRole};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Server URL per role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUrls {
    #[serde(default = "default_caching_url")]
    pub caching: String,

    #[serde(default = "default_upload_url")]
    pub upload: String,

    #[serde(default = "default_wallet_url")]
    pub wallet: String,
}

impl ServerUrls {
    pub fn get(&self, role: ServerRole) -> &str {
        match role {
            ServerRole::Caching => &self.caching,
            ServerRole::Upload => &self.upload,
            ServerRole::Wallet => &self.wallet,
        }
    }

    /// Parse every URL, requiring a ws:// or wss:// scheme.
    pub fn resolve(&self) -> Result<RoleMap<Url>> {
        RoleMap::try_from_fn(|role| parse_ws_url(self.get(role)))
    }
}

impl Default for ServerUrls {
    fn default() -> Self {
        Self {
            caching: default_caching_url(),
            upload: default_upload_url(),
            wallet: default_wallet_url(),
        }
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// First retry delay
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single retry delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// A connection that stays up this long resets the backoff counter
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Deadline for a single connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Fraction of each delay randomized, 0.0 to 1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            grace_period_ms: default_grace_period_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub servers: ServerUrls,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Default deadline for request/response calls
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Default deadline for subscriptions; `None` means unbounded
    #[serde(default)]
    pub subscription_timeout_ms: Option<u64>,

    /// How long to wait for an OK from each publish destination
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Capacity of the seen-event cache
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
}

impl ClientConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.servers.resolve()?;
        if self.reconnect.base_delay_ms == 0 {
            return Err(ClientError::Config("baseDelayMs must be positive".to_string()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ClientError::Config(
                "maxDelayMs must not be below baseDelayMs".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ClientError::Config("jitter must be within 0.0..=1.0".to_string()));
        }
        if self.seen_capacity == 0 {
            return Err(ClientError::Config("seenCapacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn subscription_timeout(&self) -> Option<Duration> {
        self.subscription_timeout_ms.map(Duration::from_millis)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: ServerUrls::default(),
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            subscription_timeout_ms: None,
            publish_timeout_ms: default_publish_timeout_ms(),
            seen_capacity: default_seen_capacity(),
        }
    }
}

/// Parse a URL and require a WebSocket scheme.
pub fn parse_ws_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            url.scheme()
        )));
    }
    Ok(url)
}

fn default_caching_url() -> String {
    "wss://cache.example.com/v1".to_string()
}

fn default_upload_url() -> String {
    "wss://uploads.example.com/v1".to_string()
}

fn default_wallet_url() -> String {
    "wss://wallet.example.com/v1".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_seen_capacity() -> usize {
    10_000
}
