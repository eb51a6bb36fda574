use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Which backend `init` falls back to when nothing has been registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendSelect {
    /// Use whatever registered; fall back to the loopback backend.
    Auto,
    Loopback,
    /// Require an explicitly registered backend.
    None,
}

impl Default for BackendSelect {
    fn default() -> Self {
        BackendSelect::Auto
    }
}

/// Limits advertised by the loopback backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopbackConfig {
    #[serde(default = "default_max_queues")]
    pub max_tx_queues: u32,
    #[serde(default = "default_max_queues")]
    pub max_rx_queues: u32,
    #[serde(default = "default_max_qlen")]
    pub max_tx_qlen: u32,
    #[serde(default = "default_max_qlen")]
    pub max_rx_qlen: u32,
    #[serde(default = "default_max_dma_len")]
    pub max_dma_len: u64,
}

fn default_max_queues() -> u32 {
    1024
}

fn default_max_qlen() -> u32 {
    // The completion index is 16 bits wide.
    1 << 15
}

fn default_max_dma_len() -> u64 {
    1 << 31
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            max_tx_queues: default_max_queues(),
            max_rx_queues: default_max_queues(),
            max_tx_qlen: default_max_qlen(),
            max_rx_qlen: default_max_qlen(),
            max_dma_len: default_max_dma_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<String>,
    #[serde(default)]
    pub backend: BackendSelect,
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_owned(),
            log_file: None,
            backend: BackendSelect::default(),
            loopback: LoopbackConfig::default(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config = toml::from_str(content)?;
        Ok(config)
    }
}
