use crate::workflow::transmission::KEY_LEN;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning, shared by every workflow on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Runs older than this are marked `timeout` before their next step
    #[serde(default = "default_max_execution_duration_secs")]
    pub max_execution_duration_secs: u64,

    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    #[serde(default = "default_init_retry_interval_ms")]
    pub init_retry_interval_ms: u64,

    /// 0 retries until the engine is closed
    #[serde(default)]
    pub init_max_retries: u32,

    #[serde(default = "default_unfinished_page_size")]
    pub unfinished_page_size: usize,

    /// Hex-encoded 16-byte secret shared by the DON, keys transmission schedules
    #[serde(default)]
    pub transmission_secret: Option<String>,
}

fn default_max_execution_duration_secs() -> u64 {
    600
}

fn default_max_concurrent_executions() -> usize {
    100
}

fn default_init_retry_interval_ms() -> u64 {
    5000
}

fn default_unfinished_page_size() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_execution_duration_secs: default_max_execution_duration_secs(),
            max_concurrent_executions: default_max_concurrent_executions(),
            init_retry_interval_ms: default_init_retry_interval_ms(),
            init_max_retries: 0,
            unfinished_page_size: default_unfinished_page_size(),
            transmission_secret: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("transmission secret is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("transmission secret must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

impl EngineConfig {
    pub fn max_execution_duration(&self) -> Duration {
        Duration::from_secs(self.max_execution_duration_secs)
    }

    pub fn init_retry_interval(&self) -> Duration {
        Duration::from_millis(self.init_retry_interval_ms)
    }

    /// Decoded transmission secret; all zeros when unset
    pub fn secret(&self) -> Result<[u8; KEY_LEN], ConfigError> {
        let mut secret = [0u8; KEY_LEN];
        let Some(encoded) = &self.transmission_secret else {
            return Ok(secret);
        };

        let bytes = hex::decode(encoded.trim_start_matches("0x"))?;
        if bytes.len() != KEY_LEN {
            return Err(ConfigError::InvalidLength {
                expected: KEY_LEN,
                actual: bytes.len(),
            });
        }
        secret.copy_from_slice(&bytes);
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_execution_duration(), Duration::from_secs(600));
        assert_eq!(config.secret().unwrap(), [0u8; KEY_LEN]);
    }

    #[test]
    fn test_secret_decoding() {
        let config = EngineConfig {
            transmission_secret: Some(format!("0x{}", "ab".repeat(KEY_LEN))),
            ..Default::default()
        };
        assert_eq!(config.secret().unwrap(), [0xab; KEY_LEN]);

        let config = EngineConfig {
            transmission_secret: Some("abcd".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.secret().unwrap_err(),
            ConfigError::InvalidLength { actual: 2, .. }
        ));

        let config = EngineConfig {
            transmission_secret: Some("zz".into()),
            ..Default::default()
        };
        assert!(matches!(config.secret().unwrap_err(), ConfigError::InvalidHex(_)));
    }
}
