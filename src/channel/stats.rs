//! Per-channel counters (§3: `stats`). Lock-free so the read and write
//! halves of a channel can update them independently.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ChannelStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Invariant 3 (§8): every channel has `bytes_sent >= messages_sent`
    /// (every message frame is at least one byte on the wire).
    pub fn check_invariant(&self) -> bool {
        self.bytes_sent() >= self.messages_sent() && self.bytes_received() >= self.messages_received()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let stats = ChannelStats::new();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_received(3);

        assert_eq!(stats.bytes_sent(), 15);
        assert_eq!(stats.messages_sent(), 2);
        assert_eq!(stats.bytes_received(), 3);
        assert_eq!(stats.messages_received(), 1);
    }

    #[test]
    fn invariant_holds_for_nonempty_messages() {
        let stats = ChannelStats::new();
        assert!(stats.check_invariant());
        stats.record_sent(1);
        stats.record_received(1);
        assert!(stats.check_invariant());
    }
}
