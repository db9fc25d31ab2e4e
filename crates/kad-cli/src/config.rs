//! Configuration for the `kad-cli` demo node.
//!
//! Modeled on the daemon's config struct: a `toml`-backed struct with
//! per-field defaults, falling back entirely to defaults when no config
//! file is present.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level demo node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP port to listen on. 0 lets the OS pick an ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Contacts to bootstrap against. Empty means "declare self the first node".
    #[serde(default)]
    pub bootstrap_contacts: Vec<BootstrapContact>,
    /// Fixed node id, as 128 hex chars. Random if absent.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Tracing filter directive, e.g. "info" or "kad_dht=debug".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Run in client mode (§4.9): lookups and stores only, never serves.
    #[serde(default)]
    pub client_mode: bool,
}

/// A single bootstrap contact, as written in `kad-cli.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapContact {
    pub node_id: String,
    pub host_ip: String,
    pub host_port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap_contacts: Vec::new(),
            node_id: None,
            log_level: default_log_level(),
            client_mode: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from the default config file location, falling
    /// back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Where bootstrap hints are saved on leave and loaded on join.
    pub fn hints_path(&self) -> PathBuf {
        Self::data_dir().join("hints.cbor")
    }

    fn config_path() -> PathBuf {
        Self::data_dir().join("kad-cli.toml")
    }

    fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("KAD_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".kad-cli"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/kad-cli"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, 0);
        assert!(config.bootstrap_contacts.is_empty());
        assert_eq!(config.log_level, "info");
        assert!(!config.client_mode);
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut config = NodeConfig::default();
        config.bootstrap_contacts.push(BootstrapContact {
            node_id: "ab".repeat(64),
            host_ip: "198.51.100.1".to_string(),
            host_port: 4433,
        });
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: NodeConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.bootstrap_contacts.len(), 1);
        assert_eq!(parsed.bootstrap_contacts[0].host_port, 4433);
    }
}
