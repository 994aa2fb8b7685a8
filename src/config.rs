//! Server configuration, read from a TOML file. Every field has a default so
//! a missing or partial file still produces a runnable server.

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LinkConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    Udp {
        host: String,
        port: u16,
    },
    Tcp {
        host: String,
        port: u16,
    },
    /// A SEGGER-style RTT telnet bridge reached over TCP.
    Rtt {
        host: String,
        #[serde(default = "default_rtt_port")]
        port: u16,
    },
    None,
}

fn default_baud() -> u32 {
    115_200
}

fn default_rtt_port() -> u16 {
    19021
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub link: LinkConfig,
    pub tick_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_pending_requests: usize,
    /// Server-side receive buffer; the device may ask for less via GetParams
    /// but never more.
    pub rx_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            link: LinkConfig::None,
            tick_interval_ms: 10,
            request_timeout_ms: 500,
            max_pending_requests: 32,
            rx_buffer_size: 4096,
        }
    }
}

pub async fn parse_config<P>(path: P) -> Result<Config, ConfigError>
where
    P: AsRef<std::path::Path>,
{
    if let Ok(config_file) = tokio::fs::read_to_string(&path).await {
        Ok(toml::from_str(&config_file)?)
    } else {
        warn!("unable to read config file, using default config");
        Ok(Config::default())
    }
}
