//! Publish pipeline: collect -> dedupe -> batch -> sign -> diff -> threshold-gate.

use std::collections::HashMap;
use std::time::Duration;

use data_encoding::BASE64;
use log::{info, warn};

use crate::identity::{Node, NodeIdentity};

use super::entry::{BranchEntry, NodesEntry, RootEntry, TreeEntry};
use super::error::TreeResult;
use super::provider::DnsProvider;

pub const DEFAULT_MAX_MERGE: usize = 5;
pub const DEFAULT_CHANGE_THRESHOLD: f64 = 0.1;
pub const DEFAULT_BRANCH_WIDTH: usize = 3;
pub const DEFAULT_ROOT_TTL: u32 = 3600;
pub const DEFAULT_NODE_TTL: u32 = 3600;
pub const DEFAULT_MAX_RETRIES: usize = 3;

pub struct PublishConfig {
    pub domain: String,
    pub max_merge: usize,
    pub change_threshold: f64,
    pub branch_width: usize,
    pub root_ttl: u32,
    pub node_ttl: u32,
    pub max_retries: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            max_merge: DEFAULT_MAX_MERGE,
            change_threshold: DEFAULT_CHANGE_THRESHOLD,
            branch_width: DEFAULT_BRANCH_WIDTH,
            root_ttl: DEFAULT_ROOT_TTL,
            node_ttl: DEFAULT_NODE_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// A fully-built, signed tree: the root entry plus every non-root entry
/// keyed by its content hash (the name each is published under is
/// `hash.<domain>`).
pub struct BuiltTree {
    pub root: RootEntry,
    pub entries: HashMap<String, TreeEntry>,
}

/// Deduplicate nodes by endpoint (ipv4/ipv6/port), batch into `Nodes`
/// leaves of up to `max_merge` records, and sign a new root with
/// `seq = last_seq + 1`.
pub fn build_tree(
    identity: &NodeIdentity,
    nodes: &[Node],
    last_seq: u64,
    config: &PublishConfig,
) -> BuiltTree {
    let mut seen = Vec::new();
    let mut deduped = Vec::new();
    for node in nodes {
        if seen.iter().any(|n: &Node| n.same_endpoint(node)) {
            continue;
        }
        seen.push(node.clone());
        deduped.push(node.clone());
    }

    let mut entries = HashMap::new();
    let leaf_hashes: Vec<String> = deduped
        .chunks(config.max_merge.max(1))
        .map(|chunk| {
            let leaf = TreeEntry::Nodes(NodesEntry {
                records: chunk.to_vec(),
            });
            let hash = leaf.hash();
            entries.insert(hash.clone(), leaf);
            hash
        })
        .collect();

    let e_root = build_branches(leaf_hashes, config.branch_width, &mut entries);
    // No link subtree content to publish by default; an empty branch still
    // gives clients a well-defined (empty) l_root to resolve against.
    let l_root = build_branches(Vec::new(), config.branch_width, &mut entries);

    let seq = last_seq + 1;
    let payload = RootEntry::signing_payload(&e_root, &l_root, seq);
    let signature = identity.sign(&payload);
    let root = RootEntry {
        e_root,
        l_root,
        seq,
        sig: BASE64.encode(crate::identity::signature_to_bytes(&signature)),
    };

    BuiltTree { root, entries }
}

/// Fold a flat list of leaf hashes into a tree of `Branch` entries no wider
/// than `branch_width`, returning the hash of the top branch (or, if there
/// is exactly one leaf, that leaf's own hash; if there are none, the hash
/// of an empty branch).
fn build_branches(
    mut hashes: Vec<String>,
    branch_width: usize,
    entries: &mut HashMap<String, TreeEntry>,
) -> String {
    if hashes.is_empty() {
        let empty = TreeEntry::Branch(BranchEntry { children: Vec::new() });
        let hash = empty.hash();
        entries.insert(hash.clone(), empty);
        return hash;
    }
    if hashes.len() == 1 {
        return hashes.remove(0);
    }

    loop {
        let next: Vec<String> = hashes
            .chunks(branch_width.max(2))
            .map(|chunk| {
                let branch = TreeEntry::Branch(BranchEntry {
                    children: chunk.to_vec(),
                });
                let hash = branch.hash();
                entries.insert(hash.clone(), branch);
                hash
            })
            .collect();
        if next.len() == 1 {
            return next.into_iter().next().unwrap();
        }
        hashes = next;
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishPlan {
    pub creates: Vec<(String, String)>,
    pub upserts: Vec<(String, String)>,
    pub deletes: Vec<String>,
}

impl PublishPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Ordered "creates -> upserts -> deletes" as required by §4.3 step 3.
    pub fn ordered_names(&self) -> Vec<&str> {
        self.creates
            .iter()
            .chain(self.upserts.iter())
            .map(|(name, _)| name.as_str())
            .chain(self.deletes.iter().map(String::as_str))
            .collect()
    }
}

/// Count nodes added/removed between two (possibly un-deduped) node sets,
/// matched by endpoint. This is the node-level churn S4/S5 talk about
/// ("3 added / 100 nodes", "20 added and 5 removed"), as distinct from the
/// TXT-record-level churn a merge-batch restructuring can produce even when
/// only a handful of nodes actually changed.
fn node_level_change(old_nodes: &[Node], new_nodes: &[Node]) -> (usize, usize) {
    let added = new_nodes
        .iter()
        .filter(|n| !old_nodes.iter().any(|o| o.same_endpoint(n)))
        .count();
    let removed = old_nodes
        .iter()
        .filter(|o| !new_nodes.iter().any(|n| n.same_endpoint(o)))
        .count();
    (added, removed)
}

/// Diff the newly built tree against the provider's current TXT set for
/// `domain`, gated by node-level churn rather than TXT-record churn: a
/// handful of added/removed nodes can still restructure several `Nodes` and
/// `Branch` leaves once batched, so the threshold must be measured over
/// `old_nodes`/`new_nodes` directly (§4.3 step 4, S4/S5). Returns `None`
/// ("below threshold") when `(added + removed) / old_nodes.len() <
/// change_threshold`.
pub fn diff_and_plan(
    built: &BuiltTree,
    current: &HashMap<String, String>,
    old_nodes: &[Node],
    new_nodes: &[Node],
    domain: &str,
    config: &PublishConfig,
) -> Option<PublishPlan> {
    let (added, removed) = node_level_change(old_nodes, new_nodes);
    let current_count = old_nodes.len().max(1);
    let ratio = (added + removed) as f64 / current_count as f64;
    if ratio < config.change_threshold {
        info!("dns tree publish below threshold ({ratio:.3} < {}); skipping", config.change_threshold);
        return None;
    }

    let mut new_records = HashMap::new();
    new_records.insert(domain.to_string(), built.root.to_text());
    for (hash, entry) in &built.entries {
        new_records.insert(format!("{hash}.{domain}"), entry.to_text());
    }

    let mut plan = PublishPlan::default();
    for (name, value) in &new_records {
        match current.get(name) {
            None => plan.creates.push((name.clone(), value.clone())),
            Some(existing) if existing != value => {
                plan.upserts.push((name.clone(), value.clone()))
            }
            Some(_) => {}
        }
    }
    for name in current.keys() {
        if !new_records.contains_key(name) {
            plan.deletes.push(name.clone());
        }
    }

    Some(plan)
}

/// Submit `plan`'s changes in batches respecting `provider.max_batch_size()`,
/// retrying a failing batch up to `max_retries` times with exponential
/// backoff. On exhaustion, the caller must NOT advance `last_seq`.
pub async fn submit_plan(
    provider: &dyn DnsProvider,
    plan: &PublishPlan,
    ttl: u32,
    max_retries: usize,
) -> TreeResult<()> {
    let batch_size = provider.max_batch_size().max(1);

    for chunk in plan.creates.iter().chain(plan.upserts.iter()).collect::<Vec<_>>().chunks(batch_size) {
        for (name, value) in chunk {
            retry_with_backoff(max_retries, || {
                provider.upsert_txt(name, &[value.clone()], ttl)
            })
            .await?;
        }
    }

    for chunk in plan.deletes.chunks(batch_size) {
        for name in chunk {
            retry_with_backoff(max_retries, || provider.delete_txt(name)).await?;
        }
    }

    Ok(())
}

async fn retry_with_backoff<F, Fut>(max_retries: usize, mut op: F) -> TreeResult<String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = TreeResult<String>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(request_id) => return Ok(request_id),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt as u32));
                warn!("dns publish batch failed (attempt {attempt}/{max_retries}): {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_nodes(n: u8) -> Vec<Node> {
        (0..n)
            .map(|i| {
                Node::new(
                    Some(crate::identity::NodeId::new([i; 20])),
                    Some(Ipv4Addr::new(10, 0, 0, i)),
                    None,
                    30301 + i as u16,
                    1,
                    1,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn dedup_drops_same_endpoint_nodes() {
        let identity = NodeIdentity::generate();
        let mut nodes = sample_nodes(3);
        let duplicate_endpoint = nodes[0].clone();
        nodes.push(duplicate_endpoint);

        let config = PublishConfig {
            domain: "nodes.example.org".to_string(),
            max_merge: 5,
            ..Default::default()
        };
        let built = build_tree(&identity, &nodes, 0, &config);
        let total_records: usize = built
            .entries
            .values()
            .filter_map(|e| match e {
                TreeEntry::Nodes(n) => Some(n.records.len()),
                _ => None,
            })
            .sum();
        assert_eq!(total_records, 3);
        assert_eq!(built.root.seq, 1);
    }

    #[test]
    fn batches_into_max_merge_sized_leaves() {
        let identity = NodeIdentity::generate();
        let nodes = sample_nodes(12);
        let config = PublishConfig {
            domain: "nodes.example.org".to_string(),
            max_merge: 5,
            ..Default::default()
        };
        let built = build_tree(&identity, &nodes, 0, &config);
        let leaf_sizes: Vec<usize> = built
            .entries
            .values()
            .filter_map(|e| match e {
                TreeEntry::Nodes(n) => Some(n.records.len()),
                _ => None,
            })
            .collect();
        assert_eq!(leaf_sizes.len(), 3); // 5, 5, 2
        assert!(leaf_sizes.iter().all(|&n| n <= 5));
    }

    #[test]
    fn small_change_is_skipped_below_threshold() {
        let identity = NodeIdentity::generate();
        let domain = "nodes.example.org";
        let old_nodes = sample_nodes(100);
        let config = PublishConfig {
            domain: domain.to_string(),
            max_merge: 100,
            change_threshold: 0.1,
            ..Default::default()
        };
        let old_built = build_tree(&identity, &old_nodes, 0, &config);
        let mut current = HashMap::new();
        current.insert(domain.to_string(), old_built.root.to_text());
        for (hash, entry) in &old_built.entries {
            current.insert(format!("{hash}.{domain}"), entry.to_text());
        }

        // 103 nodes: 3 added, 0 removed, out of 100 -> ratio 0.03 < 0.1.
        let mut new_nodes = old_nodes.clone();
        new_nodes.extend(sample_nodes(3).into_iter().map(|mut n| {
            n.port += 1000;
            n
        }));
        let new_built = build_tree(&identity, &new_nodes, old_built.root.seq, &config);

        let plan = diff_and_plan(&new_built, &current, &old_nodes, &new_nodes, domain, &config);
        assert!(plan.is_none());
    }

    #[test]
    fn large_change_produces_ordered_plan() {
        let identity = NodeIdentity::generate();
        let domain = "nodes.example.org";
        let old_nodes = sample_nodes(100);
        let config = PublishConfig {
            domain: domain.to_string(),
            max_merge: 1, // one record per leaf makes add/remove counts easy to reason about
            change_threshold: 0.1,
            ..Default::default()
        };
        let old_built = build_tree(&identity, &old_nodes, 0, &config);
        let mut current = HashMap::new();
        current.insert(domain.to_string(), old_built.root.to_text());
        for (hash, entry) in &old_built.entries {
            current.insert(format!("{hash}.{domain}"), entry.to_text());
        }

        let mut new_nodes: Vec<Node> = old_nodes[5..].to_vec(); // remove 5
        new_nodes.extend(sample_nodes(20).into_iter().map(|mut n| {
            n.port += 2000;
            n
        })); // add 20
        let new_built = build_tree(&identity, &new_nodes, old_built.root.seq, &config);

        let plan = diff_and_plan(&new_built, &current, &old_nodes, &new_nodes, domain, &config)
            .expect("above threshold");
        assert!(!plan.creates.is_empty());
        let ordered = plan.ordered_names();
        let first_delete_pos = ordered
            .iter()
            .position(|n| plan.deletes.iter().any(|d| d == n));
        let last_create_or_upsert_pos = plan.creates.len() + plan.upserts.len();
        if let Some(pos) = first_delete_pos {
            assert!(pos >= last_create_or_upsert_pos.saturating_sub(1));
        }
    }

    #[test]
    fn root_seq_increments_from_last_seq() {
        let identity = NodeIdentity::generate();
        let config = PublishConfig::default();
        let built = build_tree(&identity, &sample_nodes(2), 41, &config);
        assert_eq!(built.root.seq, 42);
    }
}
