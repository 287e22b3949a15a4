//! Kademlia discovery, an EIP-1459-style DNS tree, and an admission
//! controlled TCP connection/channel pipeline for a blockchain P2P network.

pub mod channel;
pub mod connection;
pub mod discovery;
pub mod dns_tree;
pub mod identity;
pub mod service;
pub mod wire;

pub use identity::{Node, NodeId, NodeIdentity};
pub use service::{P2pService, ServiceConfig, ServiceStats};
