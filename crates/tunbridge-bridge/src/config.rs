//! Bridge session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tunbridge_overlay::{DEFAULT_BUFFER_SIZE, DEFAULT_POOL_SIZE};

/// Per-session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Size of each receive buffer
    pub buffer_size: usize,
    /// Receive buffers per session; bounds the data in flight towards the overlay
    pub pool_size: usize,
    /// Close after this long without traffic. Zero disables.
    #[serde(with = "duration_millis", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            idle_timeout: Duration::ZERO,
        }
    }
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size == 0 {
            return Err("buffer_size must be greater than zero".to_string());
        }
        if self.pool_size == 0 {
            return Err("pool_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Builder for BridgeConfig
#[derive(Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn pool_size(mut self, count: usize) -> Self {
        self.config.pool_size = count;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<BridgeConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
