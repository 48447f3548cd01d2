//! CLI configuration file
//!
//! A JSON file listing the services reachable over the overlay and the
//! bridge tuning shared by every session:
//!
//! ```json
//! {
//!   "services": [
//!     {
//!       "name": "web",
//!       "relay": "relay.example.com:7000",
//!       "intercepts": [
//!         { "protocols": ["tcp"], "addresses": ["*.internal"], "port_ranges": [{ "low": 80, "high": 80 }] }
//!       ]
//!     }
//!   ],
//!   "bridge": { "buffer_size": 32768, "pool_size": 16, "idle_timeout_ms": 0 }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tunbridge_bridge::BridgeConfig;
use tunbridge_overlay::{ServiceDirectory, ServiceEntry};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunbridgeConfig {
    #[serde(default)]
    pub services: ServiceDirectory,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl TunbridgeConfig {
    /// Load the configuration file, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        let config: TunbridgeConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", path))?;

        config
            .bridge
            .validate()
            .map_err(anyhow::Error::msg)
            .context(format!("Invalid bridge section in {:?}", path))?;

        Ok(config)
    }

    /// Register `service` at `relay`, keeping the intercepts of an existing
    /// entry with the same name
    pub fn with_relay(mut self, service: &str, relay: Option<String>) -> Self {
        if let Some(relay) = relay {
            let intercepts = self
                .services
                .get(service)
                .map(|entry| entry.intercepts.clone())
                .unwrap_or_default();
            self.services.insert(ServiceEntry {
                name: service.to_string(),
                relay: Some(relay),
                intercepts,
            });
        }
        self
    }

    /// Override the idle timeout from the command line
    pub fn with_idle_timeout(mut self, secs: Option<u64>) -> Self {
        if let Some(secs) = secs {
            self.bridge.idle_timeout = Duration::from_secs(secs);
        }
        self
    }
}
