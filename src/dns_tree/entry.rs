//! EIP-1459-style DNS discovery tree entries.
//!
//! Each entry has a canonical single-line text form (the thing actually
//! published as a TXT record, `255`-byte chunks concatenated by the
//! transport layer) and, for non-root entries, a content hash: the first 26
//! characters of the base32 encoding of the SHA-256 of that text form.

use data_encoding::{BASE32_NOPAD, BASE64};
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};

use crate::identity::Node;
use crate::wire::{Reader, Serializer, Writer};

use super::error::{TreeError, TreeResult};

pub const ROOT_PREFIX: &str = "enrtree-root:v1";
pub const BRANCH_PREFIX: &str = "enrtree-branch:";
pub const NODES_PREFIX: &str = "enrtree-nodes:";
pub const LINK_SCHEME: &str = "enrtree://";

/// Length of a non-root entry's content-addressed hash.
pub const HASH_LEN: usize = 26;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    pub e_root: String,
    pub l_root: String,
    pub seq: u64,
    /// Base64-encoded 65-byte recoverable signature over `(e_root, l_root, seq)`.
    pub sig: String,
}

impl RootEntry {
    /// The exact bytes the signature covers: `e=<e_root> l=<l_root> seq=<seq>`.
    pub fn signing_payload(e_root: &str, l_root: &str, seq: u64) -> Vec<u8> {
        format!("e={e_root} l={l_root} seq={seq}").into_bytes()
    }

    pub fn to_text(&self) -> String {
        format!(
            "{ROOT_PREFIX} e={} l={} seq={} sig={}",
            self.e_root, self.l_root, self.seq, self.sig
        )
    }

    pub fn parse(text: &str) -> TreeResult<Self> {
        let rest = text
            .strip_prefix(ROOT_PREFIX)
            .ok_or_else(|| TreeError::Malformed(format!("not a root entry: {text}")))?;

        let mut e_root = None;
        let mut l_root = None;
        let mut seq = None;
        let mut sig = None;

        for field in rest.split_whitespace() {
            if let Some(v) = field.strip_prefix("e=") {
                e_root = Some(v.to_string());
            } else if let Some(v) = field.strip_prefix("l=") {
                l_root = Some(v.to_string());
            } else if let Some(v) = field.strip_prefix("seq=") {
                seq = Some(v.parse::<u64>().map_err(|_| {
                    TreeError::Malformed(format!("invalid seq in root entry: {v}"))
                })?);
            } else if let Some(v) = field.strip_prefix("sig=") {
                sig = Some(v.to_string());
            }
        }

        Ok(Self {
            e_root: e_root.ok_or_else(|| TreeError::Malformed("root entry missing e=".into()))?,
            l_root: l_root.ok_or_else(|| TreeError::Malformed("root entry missing l=".into()))?,
            seq: seq.ok_or_else(|| TreeError::Malformed("root entry missing seq=".into()))?,
            sig: sig.ok_or_else(|| TreeError::Malformed("root entry missing sig=".into()))?,
        })
    }

    /// Verify the signature covers `(e_root, l_root, seq)` under `public_key`.
    pub fn verify(&self, public_key: &PublicKey) -> TreeResult<()> {
        let sig_bytes = BASE64
            .decode(self.sig.as_bytes())
            .map_err(|_| TreeError::InvalidSignature)?;
        if sig_bytes.len() != 65 {
            return Err(TreeError::InvalidSignature);
        }
        let mut fixed = [0u8; 65];
        fixed.copy_from_slice(&sig_bytes);
        let signature =
            crate::identity::signature_from_bytes(&fixed).map_err(|_| TreeError::InvalidSignature)?;

        let payload = Self::signing_payload(&self.e_root, &self.l_root, self.seq);
        let recovered = crate::identity::NodeIdentity::recover_public_key(&payload, &signature)
            .map_err(|_| TreeError::InvalidSignature)?;
        if recovered != *public_key {
            return Err(TreeError::InvalidSignature);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEntry {
    pub children: Vec<String>,
}

impl BranchEntry {
    pub fn to_text(&self) -> String {
        format!("{BRANCH_PREFIX}{}", self.children.join(","))
    }

    pub fn parse(text: &str) -> TreeResult<Self> {
        let rest = text
            .strip_prefix(BRANCH_PREFIX)
            .ok_or_else(|| TreeError::Malformed(format!("not a branch entry: {text}")))?;
        let children = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(str::to_string).collect()
        };
        Ok(Self { children })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    /// Base32-encoded compressed secp256k1 public key of the linked tree.
    pub public_key_b32: String,
    pub domain: String,
}

impl LinkEntry {
    pub fn to_text(&self) -> String {
        format!("{LINK_SCHEME}{}@{}", self.public_key_b32, self.domain)
    }

    pub fn parse(text: &str) -> TreeResult<Self> {
        let rest = text
            .strip_prefix(LINK_SCHEME)
            .ok_or_else(|| TreeError::Malformed(format!("not a link entry: {text}")))?;
        let (key, domain) = rest
            .split_once('@')
            .ok_or_else(|| TreeError::Malformed(format!("link entry missing '@': {text}")))?;
        Ok(Self {
            public_key_b32: key.to_string(),
            domain: domain.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesEntry {
    pub records: Vec<Node>,
}

impl NodesEntry {
    pub fn to_text(&self) -> String {
        let mut bytes = Vec::new();
        let mut writer = Writer::new(&mut bytes);
        writer.write_u32(self.records.len() as u32);
        for node in &self.records {
            node.write(&mut writer);
        }
        format!("{NODES_PREFIX}{}", BASE64.encode(&bytes))
    }

    pub fn parse(text: &str) -> TreeResult<Self> {
        let rest = text
            .strip_prefix(NODES_PREFIX)
            .ok_or_else(|| TreeError::Malformed(format!("not a nodes entry: {text}")))?;
        let bytes = BASE64
            .decode(rest.as_bytes())
            .map_err(|_| TreeError::Malformed("invalid base64 in nodes entry".into()))?;
        let mut reader = Reader::new(&bytes);
        let count = reader
            .read_u32()
            .map_err(|e| TreeError::Malformed(e.to_string()))? as usize;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(Node::read(&mut reader).map_err(|e| TreeError::Malformed(e.to_string()))?);
        }
        Ok(Self { records })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    Root(RootEntry),
    Branch(BranchEntry),
    Link(LinkEntry),
    Nodes(NodesEntry),
}

impl TreeEntry {
    pub fn to_text(&self) -> String {
        match self {
            TreeEntry::Root(e) => e.to_text(),
            TreeEntry::Branch(e) => e.to_text(),
            TreeEntry::Link(e) => e.to_text(),
            TreeEntry::Nodes(e) => e.to_text(),
        }
    }

    pub fn parse(text: &str) -> TreeResult<Self> {
        if text.starts_with(ROOT_PREFIX) {
            Ok(TreeEntry::Root(RootEntry::parse(text)?))
        } else if text.starts_with(BRANCH_PREFIX) {
            Ok(TreeEntry::Branch(BranchEntry::parse(text)?))
        } else if text.starts_with(LINK_SCHEME) {
            Ok(TreeEntry::Link(LinkEntry::parse(text)?))
        } else if text.starts_with(NODES_PREFIX) {
            Ok(TreeEntry::Nodes(NodesEntry::parse(text)?))
        } else {
            Err(TreeError::Malformed(format!("unrecognized entry: {text}")))
        }
    }

    /// First 26 base32 characters of the SHA-256 of this entry's canonical text form.
    /// Not meaningful for root entries, which are published at the zone apex.
    pub fn hash(&self) -> String {
        hash_text(&self.to_text())
    }
}

pub fn hash_text(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let encoded = BASE32_NOPAD.encode(&digest);
    encoded.chars().take(HASH_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn branch_roundtrip() {
        let entry = BranchEntry {
            children: vec!["AAAA".to_string(), "BBBB".to_string()],
        };
        let text = entry.to_text();
        assert_eq!(BranchEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn link_roundtrip() {
        let entry = LinkEntry {
            public_key_b32: "AB2CD3EF".to_string(),
            domain: "nodes.example.org".to_string(),
        };
        let text = entry.to_text();
        assert_eq!(LinkEntry::parse(&text).unwrap(), entry);
    }

    #[test]
    fn nodes_roundtrip() {
        let node = Node::new(
            Some(crate::identity::NodeId::new([7u8; 20])),
            Some(Ipv4Addr::new(10, 0, 0, 1)),
            None,
            30301,
            1,
            1,
        )
        .unwrap();
        let entry = NodesEntry { records: vec![node] };
        let text = entry.to_text();
        let parsed = NodesEntry::parse(&text).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn root_signature_roundtrip() {
        let identity = crate::identity::NodeIdentity::generate();
        let payload = RootEntry::signing_payload("E1", "L1", 3);
        let sig = identity.sign(&payload);
        let sig_b64 = BASE64.encode(crate::identity::signature_to_bytes(&sig));

        let root = RootEntry {
            e_root: "E1".to_string(),
            l_root: "L1".to_string(),
            seq: 3,
            sig: sig_b64,
        };
        root.verify(&identity.public_key()).unwrap();

        let text = root.to_text();
        let parsed = RootEntry::parse(&text).unwrap();
        assert_eq!(parsed, root);
        parsed.verify(&identity.public_key()).unwrap();
    }

    #[test]
    fn root_rejects_wrong_key() {
        let identity = crate::identity::NodeIdentity::generate();
        let other = crate::identity::NodeIdentity::generate();
        let payload = RootEntry::signing_payload("E1", "L1", 1);
        let sig = identity.sign(&payload);
        let root = RootEntry {
            e_root: "E1".to_string(),
            l_root: "L1".to_string(),
            seq: 1,
            sig: BASE64.encode(crate::identity::signature_to_bytes(&sig)),
        };
        assert!(root.verify(&other.public_key()).is_err());
    }

    #[test]
    fn hash_is_26_chars_and_deterministic() {
        let h1 = hash_text("enrtree-branch:AAAA");
        let h2 = hash_text("enrtree-branch:AAAA");
        assert_eq!(h1.len(), HASH_LEN);
        assert_eq!(h1, h2);
    }

    #[test]
    fn entry_dispatch_roundtrips_each_variant() {
        let branch = TreeEntry::Branch(BranchEntry { children: vec!["X".into()] });
        assert_eq!(TreeEntry::parse(&branch.to_text()).unwrap(), branch);

        let link = TreeEntry::Link(LinkEntry {
            public_key_b32: "PUBKEY".into(),
            domain: "example.org".into(),
        });
        assert_eq!(TreeEntry::parse(&link.to_text()).unwrap(), link);
    }
}
