//! Node identity and address (C2).
//!
//! Generalizes `discovery/identity.rs`'s `NodeIdentity`/`xor_distance`/
//! `log2_distance` shape from the teacher's 32-byte Schnorr/Ristretto
//! scheme to this spec's 20-byte `RIPEMD160(SHA256(pubkey))` address and
//! secp256k1 recoverable signatures.

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Node IDs are fixed at 160 bits, per spec: "implementers MUST reject any
/// peer advertising a non-20-byte ID."
pub const NODE_ID_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid node id length: expected {NODE_ID_LEN}, got {0}")]
    InvalidIdLength(usize),
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("port out of range (0, 65535]: {0}")]
    InvalidPort(u16),
    #[error("node has neither a valid ipv4 nor ipv6 address")]
    MissingAddress,
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// A 160-bit node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> IdentityResult<Self> {
        if bytes.len() != NODE_ID_LEN {
            return Err(IdentityError::InvalidIdLength(bytes.len()));
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// `address(public_key) = RIPEMD160(SHA256(public_key))`.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let sha = Sha256::digest(public_key.serialize());
        let ripe = Ripemd160::digest(sha);
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&ripe);
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// `distance(target, id) := 160 - leading_zero_bits(target XOR id)`, clamped
/// into `[0, 255]`. Identical IDs XOR to all-zero, i.e. 160 leading zero
/// bits, landing in bucket 0 — the smallest bucket, per spec. Callers that
/// must exclude the local node from its own table (self-insertion) do so
/// with an explicit identity check, not by relying on this function.
pub fn bucket_distance(target: &NodeId, id: &NodeId) -> Option<u8> {
    const TOTAL_BITS: usize = NODE_ID_LEN * 8;

    let mut xored = [0u8; NODE_ID_LEN];
    for i in 0..NODE_ID_LEN {
        xored[i] = target.0[i] ^ id.0[i];
    }

    let leading_zero_bits = xored
        .iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
        .unwrap_or(TOTAL_BITS);

    Some(TOTAL_BITS.saturating_sub(leading_zero_bits).min(255) as u8)
}

/// Compare two node IDs by XOR distance to `target`, closest first.
pub fn compare_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    for i in 0..NODE_ID_LEN {
        let da = target.0[i] ^ a.0[i];
        let db = target.0[i] ^ b.0[i];
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// A dual-stack endpoint plus the metadata carried in discovery/transport
/// handshakes. At least one of `ipv4`/`ipv6` must be set; `port` must be
/// nonzero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: Option<NodeId>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub port: u16,
    pub network_id: u8,
    pub network_version: i16,
}

impl Node {
    pub fn new(
        id: Option<NodeId>,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
        port: u16,
        network_id: u8,
        network_version: i16,
    ) -> IdentityResult<Self> {
        if ipv4.is_none() && ipv6.is_none() {
            return Err(IdentityError::MissingAddress);
        }
        if port == 0 {
            return Err(IdentityError::InvalidPort(port));
        }
        Ok(Self {
            id,
            ipv4,
            ipv6,
            port,
            network_id,
            network_version,
        })
    }

    /// Nodes compare equal by endpoint + port only, per spec: "Entries
    /// compare equal iff their Nodes compare equal (same endpoint + port;
    /// ID not required for equality)."
    pub fn same_endpoint(&self, other: &Node) -> bool {
        self.ipv4 == other.ipv4 && self.ipv6 == other.ipv6 && self.port == other.port
    }

    /// Preferred address for dialing: IPv4 first, falling back to IPv6.
    pub fn preferred_ip(&self) -> std::net::IpAddr {
        match (self.ipv4, self.ipv6) {
            (Some(v4), _) => std::net::IpAddr::V4(v4),
            (None, Some(v6)) => std::net::IpAddr::V6(v6),
            (None, None) => unreachable!("Node::new guarantees at least one address"),
        }
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.preferred_ip(), self.port)
    }
}

/// A `Node` plus the bookkeeping the routing table needs (`modified_at`).
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node: Node,
    pub modified_at: Instant,
}

impl NodeEntry {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            modified_at: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.modified_at = Instant::now();
    }
}

impl PartialEq for NodeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.node.same_endpoint(&other.node)
    }
}
impl Eq for NodeEntry {}

/// Local node key material: a secp256k1 keypair generated at startup (or
/// loaded), and the node ID derived from the public key.
#[derive(Clone)]
pub struct NodeIdentity {
    secret_key: SecretKey,
    public_key: PublicKey,
    node_id: NodeId,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut rand::thread_rng());
        let node_id = NodeId::from_public_key(&public_key);
        Self {
            secret_key,
            public_key,
            node_id,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> IdentityResult<Self> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| IdentityError::InvalidSecretKey)?;
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        let node_id = NodeId::from_public_key(&public_key);
        Ok(Self {
            secret_key,
            public_key,
            node_id,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Sign a message digest (the caller hashes first; signatures here are
    /// recoverable so the public key can be reconstructed from the wire
    /// packet alone, per spec: "recoverable signatures on discovery
    /// messages").
    pub fn sign(&self, message: &[u8]) -> RecoverableSignature {
        let digest = Sha256::digest(message);
        let msg = Message::from_digest_slice(&digest).expect("sha256 digest is 32 bytes");
        let secp = Secp256k1::new();
        secp.sign_ecdsa_recoverable(&msg, &self.secret_key)
    }

    /// Recover the signer's public key from a message + recoverable signature.
    pub fn recover_public_key(
        message: &[u8],
        signature: &RecoverableSignature,
    ) -> IdentityResult<PublicKey> {
        let digest = Sha256::digest(message);
        let msg = Message::from_digest_slice(&digest).expect("sha256 digest is 32 bytes");
        let secp = Secp256k1::new();
        secp.recover_ecdsa(&msg, signature)
            .map_err(|_| IdentityError::InvalidSignature)
    }

    /// Recover the signer's public key and check it matches the expected node ID.
    pub fn recover_and_verify(
        message: &[u8],
        signature: &RecoverableSignature,
        expected: &NodeId,
    ) -> IdentityResult<PublicKey> {
        let recovered = Self::recover_public_key(message, signature)?;
        if NodeId::from_public_key(&recovered) != *expected {
            return Err(IdentityError::InvalidSignature);
        }
        Ok(recovered)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Serialize a `RecoverableSignature` to a fixed 65-byte wire form:
/// 64 bytes of compact signature followed by a 1-byte recovery id.
pub fn signature_to_bytes(signature: &RecoverableSignature) -> [u8; 65] {
    let (recovery_id, compact) = signature.serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}

pub fn signature_from_bytes(bytes: &[u8; 65]) -> IdentityResult<RecoverableSignature> {
    let recovery_id =
        RecoveryId::from_i32(bytes[64] as i32).map_err(|_| IdentityError::InvalidSignature)?;
    RecoverableSignature::from_compact(&bytes[..64], recovery_id)
        .map_err(|_| IdentityError::InvalidSignature)
}
