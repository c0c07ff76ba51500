use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Serial-radio link settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub queue_capacity: usize,
}

/// Alert escalation and retry settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertConfig {
    pub cooldown_secs: u64,
    pub retry_interval_secs: u64,
    pub max_retries: u32,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub link: LinkConfig,
    pub alerts: AlertConfig,
}

impl BridgeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&contents)?;
        Ok(config)
    }
}

impl LinkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            read_timeout_ms: 1000,
            queue_capacity: 10,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 10,
            retry_interval_secs: 4,
            max_retries: 4,
            poll_interval_secs: 1,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}
