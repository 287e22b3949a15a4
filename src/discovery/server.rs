//! UDP server driving the Kademlia bonding protocol and iterative lookups.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;

use crate::identity::{bucket_distance, Node, NodeEntry, NodeId, NodeIdentity};

use super::config::{DiscoveryConfig, ALPHA, MAX_LOOP_NUM, REFRESH_INTERVAL, RETRY_COOLDOWN};
use super::error::{DiscoveryError, DiscoveryResult};
use super::messages::{
    message_code, DiscoveryMessage, KadFindNode, KadNeighbors, KadPing, KadPong, MAX_NEIGHBORS,
    MAX_PACKET_SIZE, MIN_PACKET_SIZE,
};
use super::routing_table::{InsertResult, RoutingTable};
use super::state_machine::DiscoveryPeerState;
use super::url::NodeUrl;

const SIGNATURE_LEN: usize = 65;

/// A discovery datagram on the wire: `signature(65) || code || body`. The
/// sender's public key is recovered from the signature rather than carried
/// explicitly, the same trick devp2p-style discovery protocols use.
struct SignedPacket {
    signature: [u8; SIGNATURE_LEN],
    body: Vec<u8>,
}

impl SignedPacket {
    fn sign(identity: &NodeIdentity, body: Vec<u8>) -> Self {
        let sig = identity.sign(&body);
        let signature = crate::identity::signature_to_bytes(&sig);
        Self { signature, body }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNATURE_LEN + self.body.len());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.body);
        out
    }

    fn decode(datagram: &[u8]) -> DiscoveryResult<(Self, NodeId)> {
        if datagram.len() < MIN_PACKET_SIZE || datagram.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::InvalidPacketSize(
                MIN_PACKET_SIZE,
                datagram.len(),
            ));
        }
        if datagram.len() < SIGNATURE_LEN + 1 {
            return Err(DiscoveryError::InvalidPacketSize(
                SIGNATURE_LEN + 1,
                datagram.len(),
            ));
        }
        let mut sig_bytes = [0u8; SIGNATURE_LEN];
        sig_bytes.copy_from_slice(&datagram[..SIGNATURE_LEN]);
        let body = datagram[SIGNATURE_LEN..].to_vec();

        let signature = crate::identity::signature_from_bytes(&sig_bytes)
            .map_err(|_| DiscoveryError::InvalidSignature)?;
        let public_key = crate::identity::NodeIdentity::recover_public_key(&body, &signature)
            .map_err(|_| DiscoveryError::InvalidSignature)?;

        Ok((
            Self {
                signature: sig_bytes,
                body,
            },
            NodeId::from_public_key(&public_key),
        ))
    }
}

/// Kademlia discovery server: owns the UDP socket, the routing table, and
/// the per-peer bonding state machines.
pub struct DiscoveryServer {
    socket: Arc<UdpSocket>,
    identity: Arc<NodeIdentity>,
    routing_table: Arc<RoutingTable>,
    config: DiscoveryConfig,
    running: AtomicBool,
    peers: RwLock<HashMap<SocketAddr, DiscoveryPeerState>>,
    exit_tx: broadcast::Sender<()>,
}

impl DiscoveryServer {
    pub async fn new(config: DiscoveryConfig, identity: NodeIdentity) -> DiscoveryResult<Arc<Self>> {
        let bind_address = config.get_bind_address();
        let socket = UdpSocket::bind(&bind_address)
            .await
            .map_err(|e| DiscoveryError::BindFailed(bind_address.clone(), e))?;

        info!(
            "discovery server listening on {bind_address} (node_id: {})",
            identity.node_id()
        );

        let routing_table = Arc::new(RoutingTable::new(identity.node_id(), config.bucket_size));
        let (exit_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            identity: Arc::new(identity),
            routing_table,
            config,
            running: AtomicBool::new(false),
            peers: RwLock::new(HashMap::new()),
            exit_tx,
        }))
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.exit_tx.send(());
        }
    }

    pub async fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("discovery server already running");
            return;
        }

        self.connect_bootstrap_nodes().await;

        let server = Arc::clone(&self);
        tokio::spawn(async move { server.receive_loop().await });

        let server = Arc::clone(&self);
        tokio::spawn(async move { server.refresh_loop().await });
    }

    async fn connect_bootstrap_nodes(&self) {
        for url_str in &self.config.bootstrap_nodes {
            match NodeUrl::parse(url_str) {
                Ok(url) => {
                    info!("connecting to bootstrap node: {url}");
                    if let Err(e) = self.bond(url.address).await {
                        warn!("failed to ping bootstrap node {url}: {e}");
                    }
                }
                Err(e) => error!("invalid bootstrap node url '{url_str}': {e}"),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        let mut exit_rx = self.exit_tx.subscribe();

        loop {
            tokio::select! {
                _ = exit_rx.recv() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            // Datagrams outside [MIN_PACKET_SIZE, MAX_PACKET_SIZE] are
                            // dropped silently; UDP is connectionless so no socket closes.
                            if len < MIN_PACKET_SIZE || len > MAX_PACKET_SIZE {
                                metrics::counter!("p2p_net_udp_oversized_total").increment(1);
                                trace!("dropped out-of-range datagram ({len} bytes) from {from}");
                                continue;
                            }
                            let data = buf[..len].to_vec();
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_packet(&data, from).await {
                                    debug!("error handling discovery packet from {from}: {e}");
                                }
                            });
                        }
                        Err(e) => error!("error receiving discovery packet: {e}"),
                    }
                }
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = interval(REFRESH_INTERVAL);
        let mut exit_rx = self.exit_tx.subscribe();
        let mut iteration: usize = 0;

        loop {
            tokio::select! {
                _ = exit_rx.recv() => break,
                _ = ticker.tick() => {
                    iteration += 1;
                    let target = if iteration % MAX_LOOP_NUM == 0 {
                        *self.routing_table.local_id()
                    } else {
                        NodeId::new(rand::random())
                    };
                    self.find_closest(&target).await;
                }
            }
        }
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) -> DiscoveryResult<()> {
        let (packet, sender_id) = SignedPacket::decode(data)?;
        let message = DiscoveryMessage::decode(&packet.body)?;

        match message {
            DiscoveryMessage::Ping(ping) => self.handle_ping(&ping, sender_id, from).await,
            DiscoveryMessage::Pong(pong) => self.handle_pong(&pong, sender_id, from).await,
            DiscoveryMessage::FindNode(find_node) => self.handle_find_node(&find_node, from).await,
            DiscoveryMessage::Neighbors(neighbors) => {
                self.handle_neighbors(&neighbors, from).await
            }
        }
    }

    /// `KAD_PING` triggers an immediate `KAD_PONG`, independent of bonding state.
    async fn handle_ping(&self, ping: &KadPing, sender_id: NodeId, from: SocketAddr) -> DiscoveryResult<()> {
        debug!("received KAD_PING from {from} ({sender_id})");

        {
            let mut peers = self.peers.write().await;
            peers
                .entry(from)
                .or_insert_with(|| DiscoveryPeerState::new(sender_id));
        }

        let pong = DiscoveryMessage::Pong(KadPong {
            network_id: self.config.network_id,
            network_version: self.config.network_version,
            timestamp: now_unix(),
        });
        self.send_message(&pong, from).await
    }

    /// `PingSent -> Alive` (or `Dead` on network mismatch); table insertion
    /// follows the eviction rules of §4.2.
    async fn handle_pong(&self, pong: &KadPong, sender_id: NodeId, from: SocketAddr) -> DiscoveryResult<()> {
        debug!("received KAD_PONG from {from} ({sender_id})");

        let network_id_matches = pong.network_id == self.config.network_id
            && pong.network_version == self.config.network_version;

        let was_eviction_challenge;
        {
            let mut peers = self.peers.write().await;
            let peer = peers
                .entry(from)
                .or_insert_with(|| DiscoveryPeerState::new(sender_id));
            was_eviction_challenge =
                peer.state() == super::state_machine::PeerState::EvictCandidate;
            if was_eviction_challenge {
                if network_id_matches {
                    peer.on_eviction_pong();
                } else {
                    peer.on_pong_received(false);
                }
            } else {
                peer.on_pong_received(network_id_matches);
            }
        }

        if !network_id_matches {
            return Ok(());
        }

        if was_eviction_challenge {
            // Incumbent survived; nothing to insert, table entry already present.
            self.routing_table.touch(&sender_id).await;
            return Ok(());
        }

        let node = Node::new(Some(sender_id), Some(ip_to_v4(from)), None, from.port(), self.config.network_id, self.config.network_version)
            .map_err(|_| DiscoveryError::InvalidSignature)?;
        self.insert_alive_node(node).await;

        Ok(())
    }

    async fn handle_find_node(&self, find_node: &KadFindNode, from: SocketAddr) -> DiscoveryResult<()> {
        let closest = self
            .routing_table
            .closest(&find_node.target_id, MAX_NEIGHBORS)
            .await;
        let neighbors = DiscoveryMessage::Neighbors(KadNeighbors {
            from_node: self.home_node(from),
            neighbors: closest.into_iter().map(|e| e.node).collect(),
            timestamp: now_unix(),
        });
        self.send_message(&neighbors, from).await
    }

    async fn handle_neighbors(&self, neighbors: &KadNeighbors, _from: SocketAddr) -> DiscoveryResult<()> {
        for node in &neighbors.neighbors {
            let Some(id) = node.id else { continue };
            if id == *self.routing_table.local_id() {
                continue;
            }
            if let Some(addr) = node_addr(node) {
                if !self.routing_table.contains(&id).await {
                    let _ = self.bond(addr).await;
                }
            }
        }
        Ok(())
    }

    /// Table insertion per §4.2: append if the bucket has room; if full and
    /// the oldest entry is stale, challenge it; otherwise drop the new node.
    async fn insert_alive_node(&self, node: Node) {
        let entry = NodeEntry::new(node);
        match self.routing_table.insert(entry).await {
            InsertResult::Inserted | InsertResult::Updated => {}
            InsertResult::EvictionCandidate(incumbent_id) => {
                if let Some(incumbent) = self.routing_table.get(&incumbent_id).await {
                    if let Some(addr) = node_addr(&incumbent.node) {
                        let mut peers = self.peers.write().await;
                        let state = peers
                            .entry(addr)
                            .or_insert_with(|| DiscoveryPeerState::new(incumbent_id));
                        state.on_eviction_challenge();
                        drop(peers);
                        let _ = self.bond(addr).await;
                    }
                }
            }
            InsertResult::Dropped | InsertResult::SelfInsert => {}
        }
    }

    async fn send_message(&self, message: &DiscoveryMessage, to: SocketAddr) -> DiscoveryResult<()> {
        let body = message.encode();
        let packet = SignedPacket::sign(&self.identity, body);
        let data = packet.encode();
        if data.len() > MAX_PACKET_SIZE {
            return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
        }
        self.socket.send_to(&data, to).await?;
        Ok(())
    }

    fn home_node(&self, observed_from: SocketAddr) -> Node {
        Node::new(
            Some(*self.routing_table.local_id()),
            Some(ip_to_v4(observed_from)),
            None,
            observed_from.port(),
            self.config.network_id,
            self.config.network_version,
        )
        .expect("home node always has a valid address")
    }

    /// `Discovered -> PingSent`: send a `KAD_PING` and start the bonding timer.
    /// A `Dead` peer still within `RETRY_COOLDOWN` is skipped entirely (S2,
    /// §4.2: "their endpoint is remembered for a short grace so retries are
    /// not spammed").
    pub async fn bond(&self, to: SocketAddr) -> DiscoveryResult<()> {
        {
            let mut peers = self.peers.write().await;
            let state = peers
                .entry(to)
                .or_insert_with(|| DiscoveryPeerState::new(NodeId::new([0u8; 20])));
            if state.in_retry_cooldown(RETRY_COOLDOWN) {
                trace!("skipping bond to {to}: still in retry cooldown");
                return Ok(());
            }
            state.on_ping_sent();
        }

        let ping = DiscoveryMessage::Ping(KadPing {
            from_node: self.home_node(to),
            to_node: self.home_node(to),
            network_id: self.config.network_id,
            network_version: self.config.network_version,
            timestamp: now_unix(),
        });
        self.send_message(&ping, to).await
    }

    /// Iterative `find_closest`: frontier of `ALPHA` known live nodes, each
    /// queried with `KAD_FIND_NODE`, repeated until no closer node is learned
    /// or `MAX_LOOP_NUM` cycles are spent.
    pub async fn find_closest(&self, target: &NodeId) -> Vec<NodeEntry> {
        let mut frontier = self.routing_table.closest(target, ALPHA).await;
        let mut queried = std::collections::HashSet::new();

        for _ in 0..MAX_LOOP_NUM {
            if frontier.is_empty() {
                break;
            }
            let mut progressed = false;
            for entry in &frontier {
                let Some(id) = entry.node.id else { continue };
                if !queried.insert(id) {
                    continue;
                }
                if let Some(addr) = node_addr(&entry.node) {
                    let find_node = DiscoveryMessage::FindNode(KadFindNode {
                        from_node: self.home_node(addr),
                        target_id: *target,
                        timestamp: now_unix(),
                    });
                    if self.send_message(&find_node, addr).await.is_ok() {
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            let refreshed = self.routing_table.closest(target, MAX_NEIGHBORS).await;
            if refreshed.len() <= frontier.len()
                && refreshed.iter().map(|e| e.node.id).eq(frontier.iter().map(|e| e.node.id))
            {
                break;
            }
            frontier = refreshed;
        }

        frontier
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn ip_to_v4(addr: SocketAddr) -> std::net::Ipv4Addr {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => std::net::Ipv4Addr::UNSPECIFIED,
    }
}

fn node_addr(node: &Node) -> Option<SocketAddr> {
    if node.port == 0 {
        return None;
    }
    Some(node.socket_addr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_creation_and_identity() {
        let config = DiscoveryConfig { port: 0, ..Default::default() };
        let identity = NodeIdentity::generate();
        let node_id = identity.node_id();

        let server = DiscoveryServer::new(config, identity).await.unwrap();
        assert_eq!(server.identity().node_id(), node_id);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn distance_matches_bucket_index_after_insert() {
        let config = DiscoveryConfig { port: 0, ..Default::default() };
        let identity = NodeIdentity::generate();
        let server = DiscoveryServer::new(config, identity).await.unwrap();

        let peer_id = NodeId::new([0x42u8; 20]);
        let node = Node::new(
            Some(peer_id),
            Some(std::net::Ipv4Addr::new(127, 0, 0, 2)),
            None,
            30302,
            1,
            1,
        )
        .unwrap();
        server.insert_alive_node(node).await;

        let expected = bucket_distance(server.routing_table().local_id(), &peer_id).unwrap();
        assert!(server.routing_table().contains(&peer_id).await);
        let stats = server.routing_table().bucket_stats().await;
        assert!(stats.iter().any(|(idx, _)| *idx == expected as usize));
    }

    #[tokio::test]
    async fn bond_skips_a_dead_peer_still_in_retry_cooldown() {
        let config = DiscoveryConfig { port: 0, ..Default::default() };
        let identity = NodeIdentity::generate();
        let server = DiscoveryServer::new(config, identity).await.unwrap();

        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let first_ping_at;
        {
            let mut peers = server.peers.write().await;
            let mut state = DiscoveryPeerState::new(NodeId::new([9u8; 20]));
            state.on_ping_sent();
            state.on_pong_received(false); // network mismatch -> Dead
            first_ping_at = state.last_ping_sent;
            peers.insert(addr, state);
        }

        server.bond(addr).await.unwrap();

        let peers = server.peers.read().await;
        let state = peers.get(&addr).unwrap();
        assert_eq!(state.state(), super::state_machine::PeerState::Dead);
        assert_eq!(state.last_ping_sent, first_ping_at);
    }
}
