//! Application-layer dedup and fan-out (§4.5, invariant 6, scenario S6).
//!
//! A rotating bloom filter suppresses re-forwarding the same payload;
//! `source_cache` remembers which peer a payload arrived from so it isn't
//! echoed back; `select_forward_targets` fans a payload out to a fair,
//! deterministic subset of the remaining peers.
//!
//! The bloom filter's rotate-behind-a-pointer-swap shape has no direct
//! counterpart in the pack (the teacher dedups with plain LRU caches, see
//! `compact_block_cache.rs`), so only the expiring-cache half of this file
//! is grounded there; the bloom rotation is new, built on `fastbloom`'s
//! atomic filter (already used for build-vs-empty bloom checks in the
//! pack, see `ethrex-storage`'s `layering.rs`) plus `arc-swap`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use fastbloom::BloomFilter;
use lru::LruCache;
use tokio::sync::Mutex;

pub const DEFAULT_BLOOM_EXPECTED_ITEMS: usize = 200_000;
pub const DEFAULT_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
pub const DEFAULT_BLOOM_ROTATE_INTERVAL: Duration = Duration::from_secs(120);

pub const DEFAULT_SOURCE_CACHE_CAPACITY: usize = 50_000;
pub const DEFAULT_SOURCE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default fraction of the remaining peer set a message is forwarded to.
pub const DEFAULT_FORWARD_FRACTION: f64 = 0.3;
/// Below this many eligible peers, forward to all of them.
pub const FORWARD_ALL_THRESHOLD: usize = 2;

fn digest(payload: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Wraps two `BloomFilter` generations behind an `ArcSwap` pointer: the
/// active generation and the previous one, both checked on lookup so a
/// rotation boundary never causes a false "not seen" just after it fires.
struct Generation {
    current: BloomFilter,
    previous: Option<BloomFilter>,
    rotated_at: Instant,
}

pub struct DedupFilter {
    generation: ArcSwap<Generation>,
    expected_items: usize,
    false_positive_rate: f64,
    rotate_interval: Duration,
}

impl DedupFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64, rotate_interval: Duration) -> Self {
        let filter = BloomFilter::with_false_pos(false_positive_rate).expected_items(expected_items);
        Self {
            generation: ArcSwap::from_pointee(Generation {
                current: filter,
                previous: None,
                rotated_at: Instant::now(),
            }),
            expected_items,
            false_positive_rate,
            rotate_interval,
        }
    }

    /// Returns `true` if `payload` was already seen (in the current or
    /// previous generation); marks it seen either way.
    pub fn check_and_insert(&self, payload: &[u8]) -> bool {
        self.rotate_if_due();
        let key = digest(payload);
        let generation = self.generation.load();
        let already_seen = generation.current.contains(&key)
            || generation.previous.as_ref().is_some_and(|p| p.contains(&key));
        // `BloomFilter::insert` takes `&mut self`; membership tests above are
        // read-only, so a fresh clone-on-write swap is how concurrent callers
        // observe their own insert without a lock on every check.
        let mut updated = (**generation).clone_shell();
        updated.current.insert(&key);
        self.generation.store(Arc::new(updated));
        already_seen
    }

    fn rotate_if_due(&self) {
        let generation = self.generation.load();
        if generation.rotated_at.elapsed() < self.rotate_interval {
            return;
        }
        let fresh = BloomFilter::with_false_pos(self.false_positive_rate).expected_items(self.expected_items);
        self.generation.store(Arc::new(Generation {
            current: fresh,
            previous: Some(generation.current.clone()),
            rotated_at: Instant::now(),
        }));
    }
}

impl Generation {
    /// Cheap clone used only to apply one more insert without losing
    /// concurrent inserts made between `load()` and `store()`; an
    /// occasional lost insert under contention only costs an extra forward,
    /// never incorrectly suppresses one, so this is safe to race.
    fn clone_shell(&self) -> Generation {
        Generation {
            current: self.current.clone(),
            previous: self.previous.clone(),
            rotated_at: self.rotated_at,
        }
    }
}

struct SourceEntry {
    source: SocketAddr,
    added_at: Instant,
}

/// Remembers which peer a payload arrived from, so fan-out can exclude it.
/// Grounded on `compact_block_cache.rs`'s LRU-plus-`Instant`-expiry shape.
pub struct SourceCache {
    entries: Mutex<LruCache<[u8; 32], SourceEntry>>,
    ttl: Duration,
}

impl SourceCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity.try_into().expect("capacity must be nonzero"))),
            ttl,
        }
    }

    pub async fn record(&self, payload: &[u8], source: SocketAddr) {
        let key = digest(payload);
        let mut entries = self.entries.lock().await;
        entries.put(
            key,
            SourceEntry {
                source,
                added_at: Instant::now(),
            },
        );
    }

    pub async fn source_of(&self, payload: &[u8]) -> Option<SocketAddr> {
        let key = digest(payload);
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if entry.added_at.elapsed() < self.ttl => Some(entry.source),
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }
}

/// Deterministic round-robin fan-out: a `FORWARD_FRACTION` slice of
/// `peers` (excluding `source`), starting after the last peer forwarded to,
/// unsorted so no single endpoint is consistently favoured by address
/// ordering. Forwards to everyone if `peers.len() <= FORWARD_ALL_THRESHOLD`.
pub struct ForwardSelector {
    cursor: AtomicUsize,
    fraction: f64,
}

impl ForwardSelector {
    pub fn new(fraction: f64) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            fraction,
        }
    }

    pub fn select(&self, peers: &[SocketAddr], source: Option<SocketAddr>) -> Vec<SocketAddr> {
        let eligible: Vec<SocketAddr> = peers.iter().copied().filter(|p| Some(*p) != source).collect();
        if eligible.len() <= FORWARD_ALL_THRESHOLD {
            return eligible;
        }

        let count = ((eligible.len() as f64) * self.fraction).ceil() as usize;
        let count = count.clamp(1, eligible.len());

        let start = self.cursor.fetch_add(count, Ordering::Relaxed) % eligible.len();
        let mut selected = VecDeque::with_capacity(count);
        for i in 0..count {
            selected.push_back(eligible[(start + i) % eligible.len()]);
        }
        selected.into_iter().collect()
    }
}

impl Default for ForwardSelector {
    fn default() -> Self {
        Self::new(DEFAULT_FORWARD_FRACTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_repeat_payloads() {
        let filter = DedupFilter::new(1_000, 0.01, Duration::from_secs(120));
        assert!(!filter.check_and_insert(b"hello"));
        assert!(filter.check_and_insert(b"hello"));
        assert!(!filter.check_and_insert(b"world"));
    }

    #[test]
    fn dedup_survives_across_a_rotation() {
        let filter = DedupFilter::new(1_000, 0.01, Duration::from_millis(1));
        assert!(!filter.check_and_insert(b"payload"));
        std::thread::sleep(Duration::from_millis(5));
        // Rotation happens lazily on the next check; the previous
        // generation still remembers "payload" was seen.
        assert!(filter.check_and_insert(b"payload"));
    }

    #[tokio::test]
    async fn source_cache_remembers_until_ttl_expires() {
        let cache = SourceCache::new(16, Duration::from_millis(10));
        let addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        cache.record(b"payload", addr).await;
        assert_eq!(cache.source_of(b"payload").await, Some(addr));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.source_of(b"payload").await, None);
    }

    #[test]
    fn forward_selector_excludes_source_and_forwards_all_below_threshold() {
        let selector = ForwardSelector::default();
        let peers = vec![
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:1".parse().unwrap(),
        ];
        let source = Some(peers[0]);
        let selected = selector.select(&peers, source);
        assert_eq!(selected, vec![peers[1]]);
    }

    #[test]
    fn forward_selector_picks_a_fraction_of_larger_peer_sets() {
        let selector = ForwardSelector::new(0.3);
        let peers: Vec<SocketAddr> = (0..20)
            .map(|i| format!("10.0.0.{i}:1").parse().unwrap())
            .collect();
        let selected = selector.select(&peers, None);
        assert_eq!(selected.len(), 6);
        for addr in &selected {
            assert!(peers.contains(addr));
        }
    }

    #[test]
    fn forward_selector_round_robins_across_calls() {
        let selector = ForwardSelector::new(0.5);
        let peers: Vec<SocketAddr> = (0..4).map(|i| format!("10.0.0.{i}:1").parse().unwrap()).collect();
        let first = selector.select(&peers, None);
        let second = selector.select(&peers, None);
        assert_ne!(first, second);
    }
}
