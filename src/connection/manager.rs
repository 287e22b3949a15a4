//! Candidate selection, admission control and the connection set (§4.4).
//!
//! The live connection set is a concurrent map keyed by endpoint, grounded
//! on the peer-list bookkeeping style in `peer_list/peer.rs` (atomics for
//! counters) but backed by `dashmap` instead of a single `RwLock<HashMap>`
//! so insert/remove stay lock-free under concurrent dial/accept.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::discovery::RoutingTable;
use crate::identity::{Node, NodeId};

use super::ban::BanCache;
use super::config::ConnectionConfig;
use super::error::{ConnectionError, ConnectionResult};

struct ConnectionRecord {
    trusted: bool,
    connected_at: Instant,
}

/// Dials an outbound connection to `node`. Implemented by the channel
/// pipeline (C7); kept as a trait here so the connection manager has no
/// compile-time dependency on the channel module's transport details.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, node: &Node) -> ConnectionResult<()>;
}

/// The live connection set plus per-IP counters, kept separate from
/// `ConnectionManager` so admission checks (`same_endpoint`/`same_ip`) don't
/// need the routing table or config in scope.
pub struct ConnectionSet {
    connections: DashMap<SocketAddr, ConnectionRecord>,
    per_ip_counts: DashMap<IpAddr, AtomicUsize>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            per_ip_counts: DashMap::new(),
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.connections.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn same_ip_count(&self, ip: &IpAddr) -> usize {
        self.per_ip_counts
            .get(ip)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn insert(&self, addr: SocketAddr, trusted: bool) {
        self.connections.insert(
            addr,
            ConnectionRecord {
                trusted,
                connected_at: Instant::now(),
            },
        );
        self.per_ip_counts
            .entry(addr.ip())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove(&self, addr: &SocketAddr) {
        if self.connections.remove(addr).is_some() {
            if let Some(count) = self.per_ip_counts.get(&addr.ip()) {
                count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.connections.iter().map(|e| *e.key()).collect()
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    home_id: NodeId,
    routing_table: Arc<RoutingTable>,
    ban_cache: Arc<BanCache>,
    connections: ConnectionSet,
    dialer: Arc<dyn Dialer>,
    exit_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        home_id: NodeId,
        routing_table: Arc<RoutingTable>,
        ban_cache: Arc<BanCache>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (exit_tx, _) = broadcast::channel(1);
        Self {
            config,
            home_id,
            routing_table,
            ban_cache,
            connections: ConnectionSet::new(),
            dialer,
            exit_tx,
        }
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn stop(&self) {
        let _ = self.exit_tx.send(());
    }

    /// Admission check for an inbound accept (§4.4, §7:
    /// `TooManyPeers`/`DuplicatePeer`/`PeerBanned`, no ban applied here).
    pub fn admit_inbound(&self, addr: SocketAddr) -> ConnectionResult<()> {
        if self.ban_cache.is_banned(&addr.ip()) && !self.config.is_trusted(&addr) {
            return Err(ConnectionError::PeerBanned(addr.ip()));
        }
        if self.connections.contains(&addr) {
            return Err(ConnectionError::DuplicatePeer(addr));
        }
        if self.connections.len() >= self.config.max_connections {
            return Err(ConnectionError::TooManyPeers);
        }
        if !self.config.is_trusted(&addr)
            && self.connections.same_ip_count(&addr.ip()) >= self.config.max_connections_same_ip
        {
            return Err(ConnectionError::TooManySameIp(addr.ip()));
        }
        Ok(())
    }

    pub fn register_connected(&self, addr: SocketAddr) {
        let trusted = self.config.is_trusted(&addr);
        self.connections.insert(addr, trusted);
    }

    pub fn remove_connection(&self, addr: &SocketAddr) {
        self.connections.remove(addr);
    }

    /// Select up to `deficit` dial candidates: not self, not connected, not
    /// banned, not over the same-IP cap unless trusted; ranked by
    /// `last_update` descending (freshest first).
    pub async fn select_candidates(&self, deficit: usize) -> Vec<Node> {
        if deficit == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(Node, Instant)> = self
            .routing_table
            .all_nodes()
            .await
            .into_iter()
            .filter(|entry| entry.node.id != Some(self.home_id))
            .filter(|entry| !self.connections.contains(&entry.node.socket_addr()))
            .filter(|entry| {
                let addr = entry.node.socket_addr();
                !self.ban_cache.is_banned(&addr.ip()) || self.config.is_trusted(&addr)
            })
            .filter(|entry| {
                let addr = entry.node.socket_addr();
                self.config.is_trusted(&addr)
                    || self.connections.same_ip_count(&addr.ip()) < self.config.max_connections_same_ip
            })
            .map(|entry| (entry.node, entry.modified_at))
            .collect();

        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.into_iter().take(deficit).map(|(n, _)| n).collect()
    }

    /// Runs the `POOL_INTERVAL` candidate-selection tick until told to exit.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.pool_interval);
        let mut exit_rx = self.exit_tx.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = exit_rx.recv() => {
                    debug!("connection manager exiting");
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        let current = self.connections.len();
        let deficit = self.config.min_connections.saturating_sub(current);
        if deficit == 0 {
            return;
        }

        let candidates = self.select_candidates(deficit).await;
        info!(
            "connection pool deficit={deficit}, dialing {} candidates",
            candidates.len()
        );
        let dialer = self.dialer.clone();
        for node in candidates {
            let dialer = dialer.clone();
            tokio::spawn(async move {
                if let Err(e) = dialer.dial(&node).await {
                    warn!("dial to {:?} failed: {e}", node.socket_addr());
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use std::net::Ipv4Addr;

    struct NullDialer;
    #[async_trait]
    impl Dialer for NullDialer {
        async fn dial(&self, _node: &Node) -> ConnectionResult<()> {
            Ok(())
        }
    }

    fn manager() -> ConnectionManager {
        let identity = NodeIdentity::generate();
        let table = Arc::new(RoutingTable::new(identity.node_id(), 16));
        ConnectionManager::new(
            ConnectionConfig::default(),
            identity.node_id(),
            table,
            Arc::new(BanCache::new()),
            Arc::new(NullDialer),
        )
    }

    #[test]
    fn admits_fresh_inbound() {
        let manager = manager();
        let addr: SocketAddr = "10.0.0.1:30303".parse().unwrap();
        assert!(manager.admit_inbound(addr).is_ok());
    }

    #[test]
    fn rejects_duplicate_endpoint() {
        let manager = manager();
        let addr: SocketAddr = "10.0.0.1:30303".parse().unwrap();
        manager.register_connected(addr);
        assert!(matches!(
            manager.admit_inbound(addr),
            Err(ConnectionError::DuplicatePeer(_))
        ));
    }

    #[test]
    fn rejects_over_max_connections() {
        let mut config = ConnectionConfig::default();
        config.max_connections = 1;
        let identity = NodeIdentity::generate();
        let table = Arc::new(RoutingTable::new(identity.node_id(), 16));
        let manager = ConnectionManager::new(
            config,
            identity.node_id(),
            table,
            Arc::new(BanCache::new()),
            Arc::new(NullDialer),
        );
        manager.register_connected("10.0.0.1:1".parse().unwrap());
        assert!(matches!(
            manager.admit_inbound("10.0.0.2:1".parse().unwrap()),
            Err(ConnectionError::TooManyPeers)
        ));
    }

    #[test]
    fn rejects_over_same_ip_cap_unless_trusted() {
        let mut config = ConnectionConfig::default();
        config.max_connections_same_ip = 1;
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        config.trust_nodes.push(SocketAddr::new(ip.into(), 0));
        let identity = NodeIdentity::generate();
        let table = Arc::new(RoutingTable::new(identity.node_id(), 16));
        let manager = ConnectionManager::new(
            config,
            identity.node_id(),
            table,
            Arc::new(BanCache::new()),
            Arc::new(NullDialer),
        );
        manager.register_connected(SocketAddr::new(ip.into(), 1));
        // Trusted by IP regardless of port, so the same-ip cap doesn't apply.
        assert!(manager.admit_inbound(SocketAddr::new(ip.into(), 2)).is_ok());
    }

    #[test]
    fn rejects_banned_ip() {
        let manager = manager();
        let addr: SocketAddr = "10.0.0.9:1".parse().unwrap();
        manager.ban_cache.ban(addr.ip(), std::time::Duration::from_secs(60));
        assert!(matches!(
            manager.admit_inbound(addr),
            Err(ConnectionError::PeerBanned(_))
        ));
    }
}
