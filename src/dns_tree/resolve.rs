//! Resolve pipeline: BFS walk of a published tree, bounded by depth and
//! enforcing seq monotonicity and subtree-type separation.

use std::collections::{HashMap, VecDeque};

use secp256k1::PublicKey;

use crate::identity::Node;

use super::entry::{RootEntry, TreeEntry};
use super::error::{TreeError, TreeResult};
use super::provider::DnsProvider;

pub const DEFAULT_MAX_RESOLVE_DEPTH: usize = 16;

/// Fetches raw TXT record text for a DNS name. Implemented over
/// `DnsProvider::list_txt` by callers that already hold a provider handle;
/// kept as its own trait so tests can resolve from an in-memory map without
/// constructing a `DnsProvider`.
pub trait TxtLookup {
    fn lookup(&self, name: &str) -> TreeResult<String>;
}

/// Resolve a tree rooted at `domain`, trusting root signatures from
/// `public_key`. `last_seen_seq` enforces monotonicity: a resolved root with
/// `seq <= last_seen_seq` is rejected, per spec ("clients MUST reject a root
/// with seq < lastSeenSeq").
pub fn resolve_tree(
    lookup: &dyn TxtLookup,
    domain: &str,
    public_key: &PublicKey,
    last_seen_seq: Option<u64>,
    max_depth: usize,
) -> TreeResult<Vec<Node>> {
    let root_text = lookup.lookup(domain)?;
    let root = RootEntry::parse(&root_text)?;
    root.verify(public_key)?;

    if let Some(last_seq) = last_seen_seq {
        if root.seq < last_seq {
            return Err(TreeError::StaleSeq(root.seq, last_seq));
        }
    }

    let nodes = walk_subtree(lookup, domain, &root.e_root, max_depth, SubtreeKind::Nodes)?;
    // The links subtree is walked for validation only (catches
    // NodesInLinkTree/LinkInNodesTree mismatches); followed links are not
    // expanded recursively here, matching this crate's single-domain scope.
    if !root.l_root.is_empty() {
        walk_subtree(lookup, domain, &root.l_root, max_depth, SubtreeKind::Links)?;
    }

    Ok(nodes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubtreeKind {
    Nodes,
    Links,
}

fn walk_subtree(
    lookup: &dyn TxtLookup,
    domain: &str,
    root_hash: &str,
    max_depth: usize,
    kind: SubtreeKind,
) -> TreeResult<Vec<Node>> {
    let mut records = Vec::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    queue.push_back((root_hash.to_string(), 0));
    let mut visited = HashMap::new();

    while let Some((hash, depth)) = queue.pop_front() {
        if depth > max_depth {
            return Err(TreeError::MaxDepthExceeded(max_depth));
        }
        if visited.contains_key(&hash) {
            continue;
        }
        visited.insert(hash.clone(), ());

        let name = format!("{hash}.{domain}");
        let text = lookup
            .lookup(&name)
            .map_err(|_| TreeError::UnresolvedHash(hash.clone()))?;
        let entry = TreeEntry::parse(&text)?;

        match (&entry, kind) {
            (TreeEntry::Branch(branch), _) => {
                for child in &branch.children {
                    queue.push_back((child.clone(), depth + 1));
                }
            }
            (TreeEntry::Nodes(nodes), SubtreeKind::Nodes) => {
                records.extend(nodes.records.clone());
            }
            (TreeEntry::Nodes(_), SubtreeKind::Links) => return Err(TreeError::NodesInLinkTree),
            (TreeEntry::Link(_), SubtreeKind::Links) => {
                // Leaf of the links subtree: recorded but not followed
                // cross-domain by this resolver.
            }
            (TreeEntry::Link(_), SubtreeKind::Nodes) => return Err(TreeError::LinkInNodesTree),
            (TreeEntry::Root(_), _) => {
                return Err(TreeError::Malformed(format!(
                    "unexpected root entry at hash {hash}"
                )))
            }
        }
    }

    Ok(records)
}

/// In-memory `TxtLookup` used by tests and by callers that have already
/// pulled a full zone snapshot via `DnsProvider::list_txt`.
pub struct StaticZone {
    records: HashMap<String, String>,
}

impl StaticZone {
    pub fn new(records: HashMap<String, String>) -> Self {
        Self { records }
    }

    pub async fn from_provider(provider: &dyn DnsProvider, domain: &str) -> TreeResult<Self> {
        let records = provider.list_txt(domain).await?.into_iter().collect();
        Ok(Self { records })
    }
}

impl TxtLookup for StaticZone {
    fn lookup(&self, name: &str) -> TreeResult<String> {
        self.records
            .get(name)
            .cloned()
            .ok_or_else(|| TreeError::UnresolvedHash(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_tree::publish::{build_tree, PublishConfig};
    use crate::identity::NodeIdentity;
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

    fn published_zone(domain: &str, identity: &NodeIdentity, nodes: &[Node], seq: u64) -> (HashMap<String, String>, u64) {
        let config = PublishConfig {
            domain: domain.to_string(),
            max_merge: 3,
            ..Default::default()
        };
        let built = build_tree(identity, nodes, seq, &config);
        let mut zone = HashMap::new();
        zone.insert(domain.to_string(), built.root.to_text());
        for (hash, entry) in &built.entries {
            zone.insert(format!("{hash}.{domain}"), entry.to_text());
        }
        (zone, built.root.seq)
    }

    #[test]
    fn resolves_all_published_nodes() {
        let identity = NodeIdentity::generate();
        let domain = "nodes.example.org";
        let nodes = sample_nodes(7);
        let (zone, _seq) = published_zone(domain, &identity, &nodes, 0);
        let lookup = StaticZone::new(zone);

        let resolved = resolve_tree(
            &lookup,
            domain,
            &identity.public_key(),
            None,
            DEFAULT_MAX_RESOLVE_DEPTH,
        )
        .unwrap();
        assert_eq!(resolved.len(), 7);
    }

    #[test]
    fn rejects_stale_seq() {
        let identity = NodeIdentity::generate();
        let domain = "nodes.example.org";
        let nodes = sample_nodes(2);
        let (zone, seq) = published_zone(domain, &identity, &nodes, 10);
        let lookup = StaticZone::new(zone);

        let err = resolve_tree(
            &lookup,
            domain,
            &identity.public_key(),
            Some(seq + 1),
            DEFAULT_MAX_RESOLVE_DEPTH,
        )
        .unwrap_err();
        assert!(matches!(err, TreeError::StaleSeq(_, _)));
    }

    #[test]
    fn rejects_root_signed_by_wrong_key() {
        let identity = NodeIdentity::generate();
        let attacker = NodeIdentity::generate();
        let domain = "nodes.example.org";
        let nodes = sample_nodes(2);
        let (zone, _seq) = published_zone(domain, &identity, &nodes, 0);
        let lookup = StaticZone::new(zone);

        let err = resolve_tree(
            &lookup,
            domain,
            &attacker.public_key(),
            None,
            DEFAULT_MAX_RESOLVE_DEPTH,
        )
        .unwrap_err();
        assert!(matches!(err, TreeError::InvalidSignature));
    }

    #[test]
    fn unresolved_hash_surfaces_as_error() {
        let identity = NodeIdentity::generate();
        let domain = "nodes.example.org";
        let nodes = sample_nodes(2);
        let (mut zone, _seq) = published_zone(domain, &identity, &nodes, 0);
        // Drop every non-root record to simulate a broken zone.
        let root_text = zone.get(domain).cloned().unwrap();
        zone.retain(|k, _| k == domain);
        zone.insert(domain.to_string(), root_text);
        let lookup = StaticZone::new(zone);

        let err = resolve_tree(
            &lookup,
            domain,
            &identity.public_key(),
            None,
            DEFAULT_MAX_RESOLVE_DEPTH,
        )
        .unwrap_err();
        assert!(matches!(err, TreeError::UnresolvedHash(_)));
    }
}
