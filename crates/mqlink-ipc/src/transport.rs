//! Transport configuration

use crate::channel::IpcError;
use crate::name::MAX_QUEUE_NAME_LEN;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Transport configuration
///
/// Every field has a default, so a JSON document only needs to name the
/// values it overrides:
///
/// ```rust,ignore
/// let config = TransportConfig::from_json(r#"{ "queue_depth": 8 }"#)?;
/// assert_eq!(config.max_message_size, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of message slots in the locally created queue
    pub queue_depth: usize,
    /// Maximum size of a single message in bytes
    pub max_message_size: usize,
    /// Priority every message is sent with
    pub message_priority: u32,
    /// How long `connect` waits for the server's confirmation
    pub handshake_timeout_ms: u64,
    /// How long a pull `receive` waits; `None` waits forever
    pub receive_timeout_ms: Option<u64>,
    /// Permission bits of the locally created queue
    pub queue_mode: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_depth: 5,
            max_message_size: 1024,
            message_priority: 10,
            handshake_timeout_ms: 5000,
            receive_timeout_ms: Some(5000),
            queue_mode: 0o770,
        }
    }
}

impl TransportConfig {
    /// Create a builder for transport configuration
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, IpcError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IpcError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the limits the queue primitive and the handshake rely on
    pub fn validate(&self) -> Result<(), IpcError> {
        if self.queue_depth == 0 {
            return Err(IpcError::InvalidConfig(
                "queue_depth must be at least 1".into(),
            ));
        }
        // A handshake message carries a queue name and must fit in one slot.
        if self.max_message_size <= MAX_QUEUE_NAME_LEN {
            return Err(IpcError::InvalidConfig(format!(
                "max_message_size must exceed {} bytes, got {}",
                MAX_QUEUE_NAME_LEN, self.max_message_size
            )));
        }
        if self.queue_mode & !0o777 != 0 {
            return Err(IpcError::InvalidConfig(format!(
                "queue_mode {:#o} has bits outside 0o777",
                self.queue_mode
            )));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }
}

/// Builder for transport configuration
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
        }
    }

    /// Set the number of queue slots
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = depth;
        self
    }

    /// Set the maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the send priority
    pub fn message_priority(mut self, priority: u32) -> Self {
        self.config.message_priority = priority;
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = millis(timeout);
        self
    }

    /// Set the pull receive timeout (`None` blocks forever)
    pub fn receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.receive_timeout_ms = timeout.map(millis);
        self
    }

    /// Set the permission bits of created queues
    pub fn queue_mode(mut self, mode: u32) -> Self {
        self.config.queue_mode = mode;
        self
    }

    /// Build the configuration
    pub fn build(self) -> TransportConfig {
        self.config
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole milliseconds in `timeout`, saturating at `u64::MAX`
fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.queue_depth, 5);
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.message_priority, 10);
        assert_eq!(config.handshake_timeout(), Duration::from_millis(5000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TransportConfig::builder()
            .queue_depth(8)
            .max_message_size(4096)
            .handshake_timeout(Duration::from_millis(250))
            .receive_timeout(None)
            .build();

        assert_eq!(config.queue_depth, 8);
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.handshake_timeout_ms, 250);
        assert_eq!(config.receive_timeout(), None);
    }

    #[test]
    fn test_builder_saturates_huge_timeouts() {
        let config = TransportConfig::builder()
            .handshake_timeout(Duration::MAX)
            .receive_timeout(Some(Duration::MAX))
            .build();

        assert_eq!(config.handshake_timeout_ms, u64::MAX);
        assert_eq!(config.receive_timeout_ms, Some(u64::MAX));
        assert_eq!(config.handshake_timeout(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_from_json_partial() {
        let config = TransportConfig::from_json(r#"{ "queue_depth": 3, "message_priority": 1 }"#)
            .unwrap();
        assert_eq!(config.queue_depth, 3);
        assert_eq!(config.message_priority, 1);
        assert_eq!(config.max_message_size, 1024);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = TransportConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, IpcError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_message_size_must_fit_name() {
        let config = TransportConfig::builder().max_message_size(255).build();
        assert!(matches!(config.validate(), Err(IpcError::InvalidConfig(_))));

        let config = TransportConfig::builder().max_message_size(256).build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_depth() {
        let config = TransportConfig::builder().queue_depth(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_mode() {
        let config = TransportConfig::builder().queue_mode(0o4700).build();
        assert!(config.validate().is_err());
    }
}
