//! Weft node binary.
//!
//! Starts a `NODE` or `RELAY` peer, joins the mesh through the configured
//! bootstrap peers and relays, and floods messages until interrupted.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info};
use weft_core::types::Role;
use weft_node_lib::{Node, NodeConfig};

/// Weft peer-to-peer node.
#[derive(Parser, Debug)]
#[command(
    name = "weft-node",
    version,
    about = "Weft flood-propagation node with circuit relay support"
)]
struct Args {
    /// TOML config file (WEFT_* environment variables apply on top)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node role: NODE or RELAY
    #[arg(long)]
    role: Option<Role>,

    /// Network name; selects the identity and storage subdirectory
    #[arg(long)]
    net: Option<String>,

    /// Data directory for identity and storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// P2P listen port
    #[arg(long)]
    port: Option<u16>,

    /// Base listen addresses, port appended (comma-separated)
    #[arg(long, value_delimiter = ',')]
    listen: Vec<String>,

    /// Relay addresses ending in /p2p/<peer id> (comma-separated)
    #[arg(long, value_delimiter = ',')]
    relays: Vec<String>,

    /// Bootstrap peers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    bootstrap_peers: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Apply command-line overrides on top of a loaded config.
    fn apply(self, mut config: NodeConfig) -> NodeConfig {
        if let Some(role) = self.role {
            config.network.role = role;
        }
        if let Some(net) = self.net {
            config.network.network_name = net;
        }
        if let Some(dir) = self.data_dir {
            config.network.data_dir = dir;
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if !self.listen.is_empty() {
            config.network.listen_addrs = self.listen;
        }
        if !self.relays.is_empty() {
            config.network.relay_addrs = self.relays;
        }
        if !self.bootstrap_peers.is_empty() {
            config.network.bootstrap_peers = self.bootstrap_peers;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match NodeConfig::load(args.config.as_deref()) {
        Ok(config) => args.apply(config),
        Err(e) => {
            init_logging("info", "text");
            error!("failed to load config: {}", e);
            process::exit(1);
        }
    };

    init_logging(&config.log_level, &config.log_format);
    std::panic::set_hook(Box::new(|info| {
        error!("panic: {}", info);
        process::exit(1);
    }));

    info!("Weft Node v{}", env!("CARGO_PKG_VERSION"));
    info!("role: {}", config.network.role);
    info!("network: {}", config.network.network_name);
    info!("data_dir: {:?}", config.data_dir());
    info!("bootstrap_peers: {:?}", config.network.bootstrap_peers);
    info!("relays: {:?}", config.network.relay_addrs);

    // Create data directory if it doesn't exist.
    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        error!("failed to create data_dir: {}", e);
        process::exit(1);
    }

    let node = match Node::new(config).await {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {}", e);
            process::exit(1);
        }
    };

    info!(peer_id = %node.network().local_peer_id(), "Weft node running (Ctrl+C to stop)");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            process::exit(1);
        }
        info!("received Ctrl+C, shutting down...");
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                error!("node event loop failed: {}", e);
                process::exit(1);
            }
            info!("node event loop exited");
        }
        _ = shutdown_signal => {
            node.shutdown().await;
        }
    }

    info!("Weft node shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output (suitable for log
/// aggregation pipelines). Any other value defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from([
            "weft-node",
            "--role",
            "relay",
            "--port",
            "7000",
            "--bootstrap-peers",
            "/ip4/10.0.0.1/tcp/6006,/ip4/10.0.0.2/tcp/6006",
            "--log-format",
            "json",
        ]);
        let config = args.apply(NodeConfig::default());
        assert_eq!(config.network.role, Role::Relay);
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.bootstrap_peers.len(), 2);
        assert_eq!(config.log_format, "json");
    }

    #[test]
    fn absent_flags_keep_config() {
        let mut base = NodeConfig::default();
        base.network.port = 9100;
        base.network.listen_addrs = vec!["/ip4/127.0.0.1/tcp/".into()];
        let config = Args::parse_from(["weft-node"]).apply(base);
        assert_eq!(config.network.port, 9100);
        assert_eq!(config.network.listen_addrs, vec!["/ip4/127.0.0.1/tcp/".to_string()]);
        assert_eq!(config.network.role, Role::Node);
    }

    #[test]
    fn invalid_role_rejected() {
        assert!(Args::try_parse_from(["weft-node", "--role", "miner"]).is_err());
    }
}
