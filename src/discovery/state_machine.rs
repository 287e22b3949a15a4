//! Per-peer bonding state machine.
//!
//! `Discovered -> PingSent -> Alive`, with `Alive -> EvictCandidate -> {Alive,
//! Dead}` when a full bucket must choose between an incumbent and a
//! challenger. `PingSent` also leads to `Dead` on timeout or network
//! mismatch. A `KAD_PING` received in any state elicits an immediate
//! `KAD_PONG`, independent of bonding state; that reply path lives in
//! `server.rs`, not here.

use std::time::{Duration, Instant};

use crate::identity::NodeId;

use super::config::{EVICT_TIMEOUT, PING_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    PingSent,
    Alive,
    EvictCandidate,
    Dead,
}

/// Per-peer bonding state plus the timestamps that drive its timers.
#[derive(Debug, Clone)]
pub struct DiscoveryPeerState {
    pub node_id: NodeId,
    state: PeerState,
    pub last_ping_sent: Option<Instant>,
    pub last_pong_received: Option<Instant>,
    pub last_find_node_sent: Option<Instant>,
    /// When this peer most recently became `Dead`; drives `RETRY_COOLDOWN`
    /// (§4.2: "their endpoint is remembered for a short grace so retries
    /// are not spammed").
    died_at: Option<Instant>,
}

impl DiscoveryPeerState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: PeerState::Discovered,
            last_ping_sent: None,
            last_pong_received: None,
            last_find_node_sent: None,
            died_at: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    fn mark_dead(&mut self) {
        self.state = PeerState::Dead;
        self.died_at = Some(Instant::now());
    }

    /// `Discovered -> PingSent`: a `KAD_PING` was just sent to this peer.
    pub fn on_ping_sent(&mut self) {
        self.state = PeerState::PingSent;
        self.last_ping_sent = Some(Instant::now());
    }

    /// `PingSent -> Alive` if the pong's network id/version match, otherwise `Dead`.
    pub fn on_pong_received(&mut self, network_id_matches: bool) {
        self.last_pong_received = Some(Instant::now());
        if network_id_matches {
            self.state = PeerState::Alive;
        } else {
            self.mark_dead();
        }
    }

    /// `PingSent -> Dead` when `PING_TIMEOUT` elapses with no pong.
    pub fn check_ping_timeout(&mut self) -> bool {
        if self.state == PeerState::PingSent {
            if let Some(sent) = self.last_ping_sent {
                if sent.elapsed() >= PING_TIMEOUT {
                    self.mark_dead();
                    return true;
                }
            }
        }
        false
    }

    /// `Alive -> EvictCandidate`: this (incumbent) peer's slot is contested;
    /// a fresh ping was just sent to confirm it is still alive.
    pub fn on_eviction_challenge(&mut self) {
        if self.state == PeerState::Alive {
            self.state = PeerState::EvictCandidate;
            self.last_ping_sent = Some(Instant::now());
        }
    }

    /// `EvictCandidate -> Alive`: the incumbent answered within `EVICT_TIMEOUT`.
    pub fn on_eviction_pong(&mut self) {
        if self.state == PeerState::EvictCandidate {
            self.state = PeerState::Alive;
            self.last_pong_received = Some(Instant::now());
        }
    }

    /// `EvictCandidate -> Dead`: the incumbent failed to answer in time; the
    /// challenger takes its slot.
    pub fn check_eviction_timeout(&mut self) -> bool {
        if self.state == PeerState::EvictCandidate {
            if let Some(sent) = self.last_ping_sent {
                if sent.elapsed() >= EVICT_TIMEOUT {
                    self.mark_dead();
                    return true;
                }
            }
        }
        false
    }

    pub fn on_find_node_sent(&mut self) {
        self.last_find_node_sent = Some(Instant::now());
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, PeerState::Alive | PeerState::EvictCandidate)
    }

    pub fn is_dead(&self) -> bool {
        self.state == PeerState::Dead
    }

    /// True while a `Dead` peer is still within its `cooldown` grace period
    /// (S2: "no further pings for `RETRY_COOLDOWN`").
    pub fn in_retry_cooldown(&self, cooldown: Duration) -> bool {
        self.state == PeerState::Dead
            && self.died_at.is_some_and(|died| died.elapsed() < cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> DiscoveryPeerState {
        DiscoveryPeerState::new(NodeId::new([1u8; 20]))
    }

    #[test]
    fn discovered_to_ping_sent_to_alive() {
        let mut p = peer();
        assert_eq!(p.state(), PeerState::Discovered);
        p.on_ping_sent();
        assert_eq!(p.state(), PeerState::PingSent);
        p.on_pong_received(true);
        assert_eq!(p.state(), PeerState::Alive);
        assert!(p.is_alive());
    }

    #[test]
    fn mismatched_network_id_kills_the_peer() {
        let mut p = peer();
        p.on_ping_sent();
        p.on_pong_received(false);
        assert_eq!(p.state(), PeerState::Dead);
        assert!(p.is_dead());
    }

    #[test]
    fn eviction_challenge_survives_on_timely_pong() {
        let mut p = peer();
        p.on_ping_sent();
        p.on_pong_received(true);
        p.on_eviction_challenge();
        assert_eq!(p.state(), PeerState::EvictCandidate);
        p.on_eviction_pong();
        assert_eq!(p.state(), PeerState::Alive);
    }

    #[test]
    fn ping_timeout_only_fires_from_ping_sent() {
        let mut p = peer();
        assert!(!p.check_ping_timeout());
        p.on_ping_sent();
        // last_ping_sent is fresh; timeout has not elapsed yet.
        assert!(!p.check_ping_timeout());
    }

    #[test]
    fn dead_peer_is_in_retry_cooldown_until_it_elapses() {
        let mut p = peer();
        p.on_ping_sent();
        p.on_pong_received(false);
        assert!(p.is_dead());
        assert!(p.in_retry_cooldown(Duration::from_secs(30)));
        assert!(!p.in_retry_cooldown(Duration::from_nanos(0)));
    }

    #[test]
    fn live_peer_is_never_in_cooldown() {
        let mut p = peer();
        p.on_ping_sent();
        p.on_pong_received(true);
        assert!(!p.in_retry_cooldown(Duration::from_secs(30)));
    }
}
