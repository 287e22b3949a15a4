//! IP ban cache: lazy time-based expiry, `trust_nodes` bypass (§4.4).
//!
//! Grounded on the general expiring-entry shape in `compact_block_cache.rs`,
//! swapped from an LRU+timeout cache to a concurrent map since ban checks
//! happen on every admission decision and must not contend on a single lock.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// `ip -> ban_expires_at`. Expiry is checked lazily on lookup; a background
/// sweep is not required for correctness, only to bound memory growth.
pub struct BanCache {
    entries: DashMap<IpAddr, Instant>,
}

impl BanCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn ban(&self, ip: IpAddr, duration: Duration) {
        let expires_at = Instant::now() + duration;
        self.entries
            .entry(ip)
            .and_modify(|existing| {
                if expires_at > *existing {
                    *existing = expires_at;
                }
            })
            .or_insert(expires_at);
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        match self.entries.get(ip) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                drop(self.entries.remove(ip));
                false
            }
            None => false,
        }
    }

    pub fn unban(&self, ip: &IpAddr) {
        self.entries.remove(ip);
    }

    /// Drop every entry whose ban has already expired. Safe to call
    /// periodically to bound memory; not required for correctness.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expires_at| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for BanCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ban_then_check() {
        let cache = BanCache::new();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(!cache.is_banned(&ip));
        cache.ban(ip, Duration::from_secs(60));
        assert!(cache.is_banned(&ip));
    }

    #[test]
    fn expired_ban_is_lazily_evicted() {
        let cache = BanCache::new();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        cache.ban(ip, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cache.is_banned(&ip));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn rebanning_extends_rather_than_shortens() {
        let cache = BanCache::new();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
        cache.ban(ip, Duration::from_secs(60));
        cache.ban(ip, Duration::from_millis(1));
        // The longer ban must still be in effect.
        assert!(cache.is_banned(&ip));
    }

    #[test]
    fn unban_clears_entry() {
        let cache = BanCache::new();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4));
        cache.ban(ip, Duration::from_secs(60));
        cache.unban(&ip);
        assert!(!cache.is_banned(&ip));
    }
}
