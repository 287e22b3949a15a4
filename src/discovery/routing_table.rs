//! Kademlia-style routing table for node discovery.
//!
//! Nodes are organized into k-buckets indexed by XOR distance (in bits) from
//! the local node's ID. Each bucket holds up to `K` entries, oldest-first.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::identity::{bucket_distance, compare_distance, NodeEntry, NodeId};

pub const NUM_BUCKETS: usize = 256;
pub const DEFAULT_BUCKET_SIZE: usize = 16;

use super::config::BUCKET_STALE;

/// Result of inserting a node into the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    Updated,
    /// Bucket is full and its oldest entry is stale; caller should ping it
    /// before deciding whether to evict.
    EvictionCandidate(NodeId),
    /// Bucket is full and its oldest entry is still fresh; the new node is
    /// dropped.
    Dropped,
    SelfInsert,
}

struct KBucket {
    nodes: VecDeque<NodeEntry>,
    capacity: usize,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    fn find_index(&self, id: &NodeId) -> Option<usize> {
        self.nodes
            .iter()
            .position(|e| e.node.id == Some(*id))
    }

    fn get(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.nodes.iter().find(|e| e.node.id == Some(*id))
    }

    fn insert(&mut self, entry: NodeEntry) -> InsertResult {
        if let Some(id) = entry.node.id {
            if let Some(index) = self.find_index(&id) {
                if let Some(mut existing) = self.nodes.remove(index) {
                    existing.node = entry.node;
                    existing.touch();
                    self.nodes.push_back(existing);
                }
                return InsertResult::Updated;
            }
        }

        if self.is_full() {
            if let Some(oldest) = self.nodes.front() {
                if oldest.modified_at.elapsed() >= BUCKET_STALE {
                    let id = oldest
                        .node
                        .id
                        .expect("routing table entries always have an id");
                    return InsertResult::EvictionCandidate(id);
                }
            }
            return InsertResult::Dropped;
        }

        self.nodes.push_back(entry);
        InsertResult::Inserted
    }

    fn remove(&mut self, id: &NodeId) -> Option<NodeEntry> {
        let index = self.find_index(id)?;
        self.nodes.remove(index)
    }

    fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter()
    }

    fn oldest(&self) -> Option<&NodeEntry> {
        self.nodes.front()
    }

    /// Remove the oldest entry if it still matches `id` (guards against a
    /// concurrent touch promoting it out of the front slot between the
    /// eviction check and the eviction itself).
    fn evict_if_oldest(&mut self, id: &NodeId) -> bool {
        if let Some(oldest) = self.nodes.front() {
            if oldest.node.id == Some(*id) {
                self.nodes.pop_front();
                return true;
            }
        }
        false
    }
}

/// `home_id -> bucket[0..256]`. The home node's own ID never appears in the table.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<RwLock<KBucket>>,
    bucket_size: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|_| RwLock::new(KBucket::new(bucket_size)))
            .collect();
        Self {
            local_id,
            buckets,
            bucket_size,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// `distance(home_id, id)`, or `None` for the home ID itself (no bucket).
    /// The home ID is excluded explicitly rather than relying on
    /// `bucket_distance` returning `None`, since identical IDs now land in
    /// bucket 0 (the smallest bucket) per spec, same as any other entry.
    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        if *id == self.local_id {
            return None;
        }
        bucket_distance(&self.local_id, id).map(|d| d as usize)
    }

    pub async fn insert(&self, entry: NodeEntry) -> InsertResult {
        let Some(id) = entry.node.id else {
            return InsertResult::SelfInsert;
        };
        let Some(bucket_idx) = self.bucket_index(&id) else {
            return InsertResult::SelfInsert;
        };
        let mut bucket = self.buckets[bucket_idx].write().await;
        bucket.insert(entry)
    }

    pub async fn touch(&self, id: &NodeId) -> bool {
        if let Some(bucket_idx) = self.bucket_index(id) {
            let mut bucket = self.buckets[bucket_idx].write().await;
            if let Some(index) = bucket.find_index(id) {
                if let Some(mut entry) = bucket.nodes.remove(index) {
                    entry.touch();
                    bucket.nodes.push_back(entry);
                    return true;
                }
            }
        }
        false
    }

    pub async fn remove(&self, id: &NodeId) -> Option<NodeEntry> {
        let bucket_idx = self.bucket_index(id)?;
        let mut bucket = self.buckets[bucket_idx].write().await;
        bucket.remove(id)
    }

    pub async fn evict_if_oldest(&self, id: &NodeId) -> bool {
        let Some(bucket_idx) = self.bucket_index(id) else {
            return false;
        };
        let mut bucket = self.buckets[bucket_idx].write().await;
        bucket.evict_if_oldest(id)
    }

    pub async fn oldest_in_bucket_of(&self, id: &NodeId) -> Option<NodeEntry> {
        let bucket_idx = self.bucket_index(id)?;
        let bucket = self.buckets[bucket_idx].read().await;
        bucket.oldest().cloned()
    }

    pub async fn get(&self, id: &NodeId) -> Option<NodeEntry> {
        let bucket_idx = self.bucket_index(id)?;
        let bucket = self.buckets[bucket_idx].read().await;
        bucket.get(id).cloned()
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.get(id).await.is_some()
    }

    /// Up to `count` nodes sorted by XOR distance to `target`.
    pub async fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeEntry> {
        let mut candidates = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            candidates.extend(bucket.nodes().cloned());
        }
        candidates.sort_by(|a, b| {
            compare_distance(
                target,
                a.node.id.as_ref().expect("table entries have ids"),
                b.node.id.as_ref().expect("table entries have ids"),
            )
        });
        candidates.truncate(count);
        candidates
    }

    pub async fn all_nodes(&self) -> Vec<NodeEntry> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().await;
            nodes.extend(bucket.nodes().cloned());
        }
        nodes
    }

    pub async fn len(&self) -> usize {
        let mut count = 0usize;
        for bucket in &self.buckets {
            count += bucket.read().await.len();
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        for bucket in &self.buckets {
            if !bucket.read().await.is_empty() {
                return false;
            }
        }
        true
    }

    /// `(bucket index, entry count)` for every non-empty bucket.
    pub async fn bucket_stats(&self) -> Vec<(usize, usize)> {
        let mut stats = Vec::with_capacity(NUM_BUCKETS);
        for (i, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.read().await;
            if !bucket.is_empty() {
                stats.push((i, bucket.len()));
            }
        }
        stats
    }

    /// Invariant check used by tests: every entry lives in the bucket its
    /// distance from `local_id` selects.
    #[cfg(test)]
    pub async fn check_bucket_invariant(&self) -> bool {
        for (i, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.read().await;
            for entry in bucket.nodes() {
                let id = entry.node.id.expect("table entries have ids");
                if self.bucket_index(&id) != Some(i) {
                    return false;
                }
            }
        }
        true
    }
}

#[allow(dead_code)]
fn touch_last_seen(_entry: &mut NodeEntry, _now: Instant) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Node;
    use std::net::Ipv4Addr;

    fn id_with_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[0] = b;
        NodeId::new(bytes)
    }

    fn node_entry(id: NodeId, port: u16) -> NodeEntry {
        let node = Node::new(Some(id), Some(Ipv4Addr::new(127, 0, 0, 1)), None, port, 1, 1).unwrap();
        NodeEntry::new(node)
    }

    #[tokio::test]
    async fn new_table_is_empty() {
        let table = RoutingTable::new(id_with_byte(0), DEFAULT_BUCKET_SIZE);
        assert!(table.is_empty().await);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn insert_and_contains() {
        let table = RoutingTable::new(id_with_byte(0), DEFAULT_BUCKET_SIZE);
        let id = id_with_byte(1);
        let result = table.insert(node_entry(id, 30301)).await;
        assert_eq!(result, InsertResult::Inserted);
        assert!(table.contains(&id).await);
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn insert_self_is_rejected() {
        let local = id_with_byte(0);
        let table = RoutingTable::new(local, DEFAULT_BUCKET_SIZE);
        let result = table.insert(node_entry(local, 30301)).await;
        assert_eq!(result, InsertResult::SelfInsert);
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_insert_updates() {
        let table = RoutingTable::new(id_with_byte(0), DEFAULT_BUCKET_SIZE);
        let id = id_with_byte(1);
        table.insert(node_entry(id, 30301)).await;
        let result = table.insert(node_entry(id, 30302)).await;
        assert_eq!(result, InsertResult::Updated);
        assert_eq!(table.len().await, 1);
        assert_eq!(table.get(&id).await.unwrap().node.port, 30302);
    }

    #[tokio::test]
    async fn bucket_fills_up_to_k_then_reports_fresh_entry_is_dropped() {
        // All three IDs share the same highest set bit (bit 2 of the low
        // byte: 0b100, 0b101, 0b110), so `bucket_distance` — which only
        // depends on the position of the highest differing bit — puts all
        // three in the same bucket regardless of their lower bits.
        let local = NodeId::new([0u8; 20]);
        let table = RoutingTable::new(local, 2);

        let mut ids = Vec::new();
        for low in [0b100u8, 0b101u8, 0b110u8] {
            let mut bytes = [0u8; 20];
            bytes[19] = low;
            ids.push(NodeId::new(bytes));
        }

        assert_eq!(table.insert(node_entry(ids[0], 1)).await, InsertResult::Inserted);
        assert_eq!(table.insert(node_entry(ids[1], 2)).await, InsertResult::Inserted);
        // Bucket capacity 2 is now full; a third, freshly-seen incumbent
        // means the oldest is not yet stale -> dropped.
        assert_eq!(table.insert(node_entry(ids[2], 3)).await, InsertResult::Dropped);
        assert_eq!(table.len().await, 2);
    }

    #[tokio::test]
    async fn closest_sorted_by_distance() {
        let local = id_with_byte(0);
        let table = RoutingTable::new(local, DEFAULT_BUCKET_SIZE);
        for i in 1..=5u8 {
            table.insert(node_entry(id_with_byte(i), 30300 + i as u16)).await;
        }
        let target = id_with_byte(0xFF);
        let closest = table.closest(&target, 3).await;
        assert!(closest.len() <= 3);
        for window in closest.windows(2) {
            let ordering = compare_distance(
                &target,
                window[0].node.id.as_ref().unwrap(),
                window[1].node.id.as_ref().unwrap(),
            );
            assert_ne!(ordering, std::cmp::Ordering::Greater);
        }
    }

    #[tokio::test]
    async fn bucket_invariant_holds_after_inserts() {
        let local = id_with_byte(0);
        let table = RoutingTable::new(local, DEFAULT_BUCKET_SIZE);
        for i in 1..=20u8 {
            table.insert(node_entry(id_with_byte(i), 30300 + i as u16)).await;
        }
        assert!(table.check_bucket_invariant().await);
    }

    #[tokio::test]
    async fn evict_if_oldest_removes_only_the_front_entry() {
        let local = id_with_byte(0);
        let table = RoutingTable::new(local, DEFAULT_BUCKET_SIZE);
        let a = id_with_byte(1);
        let b = id_with_byte(2);
        table.insert(node_entry(a, 1)).await;
        table.insert(node_entry(b, 2)).await;

        assert!(!table.evict_if_oldest(&b).await);
        assert!(table.evict_if_oldest(&a).await);
        assert!(!table.contains(&a).await);
        assert!(table.contains(&b).await);
    }
}
