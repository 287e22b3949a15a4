//! Minimal example binary wiring `NodeIdentity`, `DiscoveryServer` and
//! `P2pService` together behind a CLI, logging a peer-count/stat snapshot on
//! a timer. Not a deliverable surface (spec's Non-goals exclude sample
//! binaries) — it only exercises the library's own public API, the same
//! role the teacher's `tos_daemon` binary plays over its own library crate.

use std::time::Duration;

use clap::Parser;
use log::info;

use p2p_net::connection::ConnectionConfig;
use p2p_net::discovery::{DiscoveryConfig, DiscoveryServer};
use p2p_net::identity::NodeIdentity;
use p2p_net::service::{P2pService, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "p2p_node", about = "Example p2p_net node")]
struct Cli {
    #[command(flatten)]
    discovery: DiscoveryConfig,

    #[command(flatten)]
    connection: ConnectionConfig,

    /// TCP port for the channel pipeline (§6 `port`).
    #[arg(long, default_value_t = 30303)]
    tcp_port: u16,

    /// Disable frame compression (§6 `frame.compression_enable`).
    #[arg(long)]
    no_compression: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let identity = match &cli.discovery.private_key {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key)?;
            let secret: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
            NodeIdentity::from_secret_bytes(&secret)?
        }
        None => NodeIdentity::generate(),
    };
    info!("home node id: {}", identity.node_id());

    let discovery = DiscoveryServer::new(cli.discovery, identity.clone()).await?;
    discovery.clone().start().await;

    let service_config = ServiceConfig {
        tcp_port: cli.tcp_port,
        frame_compression_enable: !cli.no_compression,
        ..ServiceConfig::default()
    };
    let service = P2pService::new(identity, service_config, cli.connection, discovery.clone());
    service.start().await?;

    let stats_service = service.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let stats = stats_service.stats();
            info!(
                "peers={} bytes_sent={} bytes_recv={} msgs_sent={} msgs_recv={}",
                stats.peer_count,
                stats.bytes_sent,
                stats.bytes_received,
                stats.messages_sent,
                stats.messages_received
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    service.stop();
    discovery.stop();
    Ok(())
}
