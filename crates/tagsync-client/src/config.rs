//! Client configuration

use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tagsync_protocol::{Codec, DEFAULT_MAX_MESSAGE_SIZE};

/// Sync client configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// resend_updates_after_ms = 5000
/// resend_updates_interval_ms = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base delay before an unacknowledged update is sent again
    pub resend_updates_after_ms: u64,
    /// How often the resend timer checks for overdue updates
    pub resend_updates_interval_ms: u64,
    /// Cap on the backoff growth: the delay grows up to `2^max` times the base
    pub max_resend_backoff_exponent: u32,
    /// Largest encoded message the transport accepts
    pub max_message_size: usize,
    /// Ask the server for temporary branches when watching
    pub temporary_branches: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resend_updates_after_ms: 5000,
            resend_updates_interval_ms: 1000,
            max_resend_backoff_exponent: 3,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            temporary_branches: false,
        }
    }
}

impl ClientConfig {
    /// Parse and validate a TOML configuration
    pub fn from_toml_str(source: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            toml::from_str(source).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> ClientResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.resend_updates_after_ms == 0 {
            return Err(ClientError::Config(
                "resend_updates_after_ms must be greater than zero".into(),
            ));
        }
        if self.resend_updates_interval_ms == 0 {
            return Err(ClientError::Config(
                "resend_updates_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_resend_backoff_exponent > 16 {
            return Err(ClientError::Config(format!(
                "max_resend_backoff_exponent {} exceeds 16",
                self.max_resend_backoff_exponent
            )));
        }
        Ok(())
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_updates_interval_ms)
    }

    /// Wire codec honoring `max_message_size`
    pub fn codec(&self) -> Codec {
        Codec::new(self.max_message_size)
    }
}
