use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use inferlink_protocol::DEFAULT_SYSTEM_PROMPT;

#[derive(Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    /// Preamble placed at the top of every transcript. Empty disables it.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl BrokerConfig {
    /// Load from a TOML file when one is given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&contents)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            heartbeat_secs: default_heartbeat_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_outbound_buffer() -> usize {
    1024
}
