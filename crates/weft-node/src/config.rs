//! Node configuration for the Weft node.
//!
//! [`NodeConfig`] starts from built-in defaults, then layers an optional TOML
//! file and `WEFT_*` environment variables on top via [`NodeConfig::load`].
//! Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use weft_core::error::NodeError;
use weft_core::types::Role;
use weft_network::NetworkConfig;

/// Prefix of environment variables read by [`NodeConfig::load`].
pub const ENV_PREFIX: &str = "WEFT";

/// Configuration for a node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// P2P network configuration. Its `data_dir` is the node's data root.
    pub network: NetworkConfig,
    /// Log level filter string (e.g. "info", "debug", "weft_network=trace").
    pub log_level: String,
    /// Log output format, "text" or "json".
    pub log_format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("weft");

        Self {
            network: NetworkConfig {
                data_dir,
                ..NetworkConfig::default()
            },
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

/// Settings accepted from a config file or the environment. Every field is
/// optional; absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    network: Option<String>,
    role: Option<String>,
    data_dir: Option<PathBuf>,
    port: Option<u16>,
    listen: Option<Vec<String>>,
    relays: Option<Vec<String>>,
    bootstrap: Option<Vec<String>>,
    max_connections: Option<u32>,
    protocol_prefix: Option<String>,
    stream_timeout_secs: Option<u64>,
    message_expiration_secs: Option<u64>,
    log_level: Option<String>,
    log_format: Option<String>,
}

impl NodeConfig {
    /// Load defaults, then `path` (if given), then `WEFT_*` environment variables.
    ///
    /// List values in the environment are comma-separated, e.g.
    /// `WEFT_BOOTSTRAP=/ip4/1.2.3.4/tcp/6006/p2p/12D3...,/dns4/...`.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("listen")
                .with_list_parse_key("relays")
                .with_list_parse_key("bootstrap"),
        );

        let file: FileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| NodeError::Config(e.to_string()))?;

        Self::default().merge(file)
    }

    fn merge(mut self, file: FileConfig) -> Result<Self, NodeError> {
        if let Some(role) = file.role {
            self.network.role = role
                .parse::<Role>()
                .map_err(|e| NodeError::Config(e.to_string()))?;
        }
        if let Some(network) = file.network {
            self.network.network_name = network;
        }
        if let Some(dir) = file.data_dir {
            self.network.data_dir = dir;
        }
        if let Some(port) = file.port {
            self.network.port = port;
        }
        if let Some(listen) = file.listen {
            self.network.listen_addrs = listen;
        }
        if let Some(relays) = file.relays {
            self.network.relay_addrs = relays;
        }
        if let Some(bootstrap) = file.bootstrap {
            self.network.bootstrap_peers = bootstrap;
        }
        if let Some(max) = file.max_connections {
            self.network.max_connections = max;
        }
        if let Some(prefix) = file.protocol_prefix {
            self.network.messages.protocol_prefix = prefix;
        }
        if let Some(secs) = file.stream_timeout_secs {
            self.network.messages.read_timeout = Duration::from_secs(secs);
            self.network.messages.send_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.message_expiration_secs {
            self.network.messages.message_expiration = Duration::from_secs(secs);
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if let Some(format) = file.log_format {
            self.log_format = format;
        }
        Ok(self)
    }

    /// Root directory for all persistent data.
    pub fn data_dir(&self) -> &Path {
        &self.network.data_dir
    }

    /// Path to the RocksDB record store: `<data_dir>/<network>/records`.
    pub fn db_path(&self) -> PathBuf {
        self.network
            .data_dir
            .join(&self.network.network_name)
            .join("records")
    }
}
