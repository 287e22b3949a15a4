//! `P2pService`: the external interface (§6) that wires discovery, the
//! connection manager and the channel pipeline into one running node.
//!
//! Owns its state by reference rather than through process-wide globals
//! (§5: "no process-wide globals") — callers build one `P2pService` per
//! node and pass it (or an `Arc` of it) to whatever needs to reach the
//! network, the same way `p2p/mod.rs`'s top-level `P2pServer` is the single
//! handle application code holds onto.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

use crate::channel::{
    Channel, DedupFilter, Direction, ForwardSelector, Hello, SourceCache, Status,
};
use crate::connection::{BanCache, ConnectionConfig, ConnectionError, ConnectionManager, ConnectionResult, Dialer};
use crate::discovery::DiscoveryServer;
use crate::identity::{Node, NodeIdentity};
use crate::wire::{Compression, DEFAULT_MAX_DECOMPRESSED, DEFAULT_MAX_FRAME};

use crate::channel::dispatch::{
    DEFAULT_BLOOM_EXPECTED_ITEMS, DEFAULT_BLOOM_FALSE_POSITIVE_RATE, DEFAULT_BLOOM_ROTATE_INTERVAL,
    DEFAULT_FORWARD_FRACTION, DEFAULT_SOURCE_CACHE_CAPACITY, DEFAULT_SOURCE_CACHE_TTL,
};

pub type OnConnect = Arc<dyn Fn(SocketAddr) + Send + Sync>;
pub type OnDisconnect = Arc<dyn Fn(SocketAddr) + Send + Sync>;
pub type OnMessage = Arc<dyn Fn(SocketAddr, &[u8]) + Send + Sync>;

struct HandlerRegistration {
    codes: Vec<u8>,
    on_connect: OnConnect,
    on_disconnect: OnDisconnect,
    on_message: OnMessage,
}

/// Snapshot returned by `stats()`: aggregate counters across every active
/// channel plus the connection pool's current occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceStats {
    pub peer_count: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Application-level configuration not already owned by `DiscoveryConfig`
/// or `ConnectionConfig` (§6: `port`, `network_id`, `network_version`,
/// `frame.compression_enable`, `frame.max_size`).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub tcp_port: u16,
    pub network_id: u8,
    pub network_version: i16,
    pub frame_max_size: usize,
    pub frame_compression_enable: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tcp_port: 30303,
            network_id: 1,
            network_version: 1,
            frame_max_size: DEFAULT_MAX_FRAME,
            frame_compression_enable: true,
        }
    }
}

pub struct P2pService {
    identity: Arc<NodeIdentity>,
    config: ServiceConfig,
    discovery: Arc<DiscoveryServer>,
    connection_manager: Arc<ConnectionManager>,
    channels: Arc<DashMap<SocketAddr, Arc<Channel>>>,
    dedup: Arc<DedupFilter>,
    source_cache: Arc<SourceCache>,
    forward_selector: Arc<ForwardSelector>,
    handlers: RwLock<Vec<HandlerRegistration>>,
    exit_tx: broadcast::Sender<()>,
}

/// Dials outbound TCP connections on behalf of the connection manager,
/// promoting admitted candidates into the channel pipeline the same way
/// the accept loop does for inbound ones.
struct TcpDialer {
    service: std::sync::Weak<P2pService>,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, node: &Node) -> ConnectionResult<()> {
        let Some(service) = self.service.upgrade() else {
            return Ok(());
        };
        let addr = node.socket_addr();
        let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout(addr))?
            .map_err(ConnectionError::Io)?;
        service.connection_manager.register_connected(addr);
        service.spawn_channel(stream, addr, Direction::Outbound).await;
        Ok(())
    }
}

impl P2pService {
    pub fn new(
        identity: NodeIdentity,
        config: ServiceConfig,
        connection_config: ConnectionConfig,
        discovery: Arc<DiscoveryServer>,
    ) -> Arc<Self> {
        let identity = Arc::new(identity);
        let ban_cache = Arc::new(BanCache::new());
        let routing_table = discovery.routing_table().clone();

        let (exit_tx, _) = broadcast::channel(1);

        Arc::new_cyclic(|weak: &std::sync::Weak<P2pService>| {
            let dialer = Arc::new(TcpDialer {
                service: weak.clone(),
            });
            let connection_manager = Arc::new(ConnectionManager::new(
                connection_config,
                identity.node_id(),
                routing_table,
                ban_cache,
                dialer,
            ));

            P2pService {
                identity,
                config,
                discovery,
                connection_manager,
                channels: Arc::new(DashMap::new()),
                dedup: Arc::new(DedupFilter::new(
                    DEFAULT_BLOOM_EXPECTED_ITEMS,
                    DEFAULT_BLOOM_FALSE_POSITIVE_RATE,
                    DEFAULT_BLOOM_ROTATE_INTERVAL,
                )),
                source_cache: Arc::new(SourceCache::new(
                    DEFAULT_SOURCE_CACHE_CAPACITY,
                    DEFAULT_SOURCE_CACHE_TTL,
                )),
                forward_selector: Arc::new(ForwardSelector::new(DEFAULT_FORWARD_FRACTION)),
                handlers: RwLock::new(Vec::new()),
                exit_tx,
            }
        })
    }

    /// Starts the TCP accept loop and the connection manager's candidate
    /// pool tick. Discovery is expected to already be running (or started
    /// separately by the caller) so candidates exist by the first tick.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.tcp_port)).await?;
        info!("p2p service listening on {}", listener.local_addr()?);

        let accept_service = self.clone();
        let mut exit_rx = self.exit_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => accept_service.handle_inbound(stream, addr).await,
                            Err(e) => warn!("accept failed: {e}"),
                        }
                    }
                    _ = exit_rx.recv() => break,
                }
            }
        });

        tokio::spawn(self.connection_manager.clone().run());
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.exit_tx.send(());
        self.connection_manager.stop();
        self.discovery.stop();
    }

    async fn handle_inbound(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = self.connection_manager.admit_inbound(addr) {
            debug!("rejecting inbound connection from {addr}: {e}");
            return;
        }
        self.connection_manager.register_connected(addr);
        self.spawn_channel(stream, addr, Direction::Inbound).await;
    }

    async fn spawn_channel(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, direction: Direction) {
        let hello = Hello {
            network_id: self.config.network_id,
            network_version: self.config.network_version,
            peer_descriptor: self.local_descriptor(),
        };
        let status = Status { app_data: Vec::new() };
        let compression = self
            .config
            .frame_compression_enable
            .then(|| Arc::new(Compression::new(DEFAULT_MAX_DECOMPRESSED)));

        let spawned = crate::channel::connection::spawn(
            stream,
            addr,
            direction,
            hello,
            status,
            self.config.frame_max_size,
            compression,
        )
        .await;

        let (channel, app_rx) = match spawned {
            Ok(pair) => pair,
            Err(e) => {
                warn!("channel setup with {addr} failed: {e}");
                self.connection_manager.remove_connection(&addr);
                return;
            }
        };

        let channel = Arc::new(channel);
        self.channels.insert(addr, channel.clone());
        self.fire_on_connect(addr).await;
        self.spawn_dispatch_task(addr, app_rx);
    }

    fn local_descriptor(&self) -> Node {
        let udp_addr = self.discovery.identity().node_id();
        // Advertise the TCP service's own endpoint; discovery's Node
        // descriptor already carries IP/port for the UDP side, reused here
        // since both protocols run on the same host.
        let _ = udp_addr;
        Node::new(
            Some(self.identity.node_id()),
            Some(std::net::Ipv4Addr::UNSPECIFIED),
            None,
            self.config.tcp_port,
            self.config.network_id,
            self.config.network_version,
        )
        .expect("tcp_port is validated nonzero by ServiceConfig construction")
    }

    fn spawn_dispatch_task(self: &Arc<Self>, addr: SocketAddr, mut app_rx: tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = app_rx.recv().await {
                service.dispatch_incoming(addr, payload).await;
            }
            service.channels.remove(&addr);
            service.connection_manager.remove_connection(&addr);
            service.fire_on_disconnect(addr).await;
        });
    }

    /// Runs a payload through the dedup filter, invokes matching handlers,
    /// then forwards to a fair subset of the remaining peers (§4.5, S6)
    /// unless it was already seen.
    async fn dispatch_incoming(&self, source: SocketAddr, payload: Vec<u8>) {
        if self.dedup.check_and_insert(&payload) {
            return;
        }
        self.source_cache.record(&payload, source).await;

        let code = payload.first().copied();
        let handlers = self.handlers.read().await;
        for registration in handlers.iter() {
            let matches = match code {
                Some(c) => registration.codes.contains(&c),
                None => true,
            };
            if matches {
                (registration.on_message)(source, &payload);
            }
        }
        drop(handlers);

        self.relay(source, &payload).await;
    }

    async fn relay(&self, source: SocketAddr, payload: &[u8]) {
        let peers = self.peers();
        let targets = self.forward_selector.select(&peers, Some(source));
        for target in targets {
            if let Some(channel) = self.channels.get(&target) {
                if let Err(e) = channel.send_app(payload.to_vec()).await {
                    debug!("forward to {target} failed: {e}");
                }
            }
        }
    }

    async fn fire_on_connect(&self, addr: SocketAddr) {
        for registration in self.handlers.read().await.iter() {
            (registration.on_connect)(addr);
        }
    }

    async fn fire_on_disconnect(&self, addr: SocketAddr) {
        for registration in self.handlers.read().await.iter() {
            (registration.on_disconnect)(addr);
        }
    }

    /// `register_handler(codes, on_connect, on_disconnect, on_message)`
    /// (§6). `codes` filters which first-byte-tagged application payloads
    /// reach `on_message`; an empty slice means "every payload."
    pub async fn register_handler(
        &self,
        codes: Vec<u8>,
        on_connect: OnConnect,
        on_disconnect: OnDisconnect,
        on_message: OnMessage,
    ) {
        self.handlers.write().await.push(HandlerRegistration {
            codes,
            on_connect,
            on_disconnect,
            on_message,
        });
    }

    /// `send(channel, bytes)` (§6): deliver `bytes` to exactly one peer.
    pub async fn send(&self, channel: SocketAddr, bytes: Vec<u8>) -> Option<()> {
        let entry = self.channels.get(&channel)?;
        entry.send_app(bytes).await.ok()
    }

    /// `broadcast(bytes)` (§6): deliver `bytes` to every currently active
    /// channel, independent of the gossip-relay fan-out used for
    /// previously-received payloads.
    pub async fn broadcast(&self, bytes: Vec<u8>) {
        for entry in self.channels.iter() {
            let _ = entry.send_app(bytes.clone()).await;
        }
    }

    /// `peers()` (§6): currently connected remote endpoints.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.channels.iter().map(|e| *e.key()).collect()
    }

    /// `stats()` (§6): aggregate counters across all active channels.
    pub fn stats(&self) -> ServiceStats {
        let mut stats = ServiceStats {
            peer_count: self.channels.len(),
            ..Default::default()
        };
        for entry in self.channels.iter() {
            let channel_stats = entry.stats();
            stats.bytes_sent += channel_stats.bytes_sent();
            stats.bytes_received += channel_stats.bytes_received();
            stats.messages_sent += channel_stats.messages_sent();
            stats.messages_received += channel_stats.messages_received();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_defaults_are_sane() {
        let config = ServiceConfig::default();
        assert!(config.tcp_port > 0);
        assert!(config.frame_max_size > 0);
    }
}
