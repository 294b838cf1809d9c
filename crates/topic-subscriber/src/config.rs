use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

pub(crate) const DEFAULT_MAX_RETRY_INTERVAL_MS: u64 = 2000;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Tunables for a [`Consumer`](crate::Consumer).
///
/// Every field has a default, so a YAML file only needs the keys it changes:
///
/// ```yaml
/// max_retry_interval_ms: 500
/// max_retries: 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Upper bound (exclusive) of the jittered delay used both for ack-wait
    /// resends and for reconnect backoff.
    pub max_retry_interval_ms: u64,
    /// Consecutive retries (ack resends, reconnects and redirects) before a
    /// topic is dropped. A success ack resets the count. `None` retries
    /// forever.
    pub max_retries: Option<u32>,
    /// Drop messages whose payload checksum does not match the wire value.
    pub verify_checksums: bool,
    /// Bound on the WebSocket handshake of a single connection attempt.
    pub connect_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retry_interval_ms: DEFAULT_MAX_RETRY_INTERVAL_MS,
            max_retries: None,
            verify_checksums: false,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ConsumerConfig {
    /// Parse and validate a config from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let config: ConsumerConfig =
            serde_yaml_ng::from_str(content).map_err(|e| Error::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_retry_interval_ms == 0 {
            return Err(Error::Config(
                "max_retry_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Whether `attempts` consecutive retries exceed the configured bound.
    pub(crate) fn retries_exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts > max)
    }
}

/// Load and validate a consumer config from a YAML file.
pub async fn load(path: &Path) -> Result<ConsumerConfig, Error> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    ConsumerConfig::from_yaml(&content)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}
