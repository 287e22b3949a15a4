//! Kademlia-style UDP node discovery: routing table, bonding state machine,
//! and the server that drives both.

pub mod config;
pub mod error;
pub mod messages;
pub mod routing_table;
pub mod server;
pub mod state_machine;
pub mod url;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult};
pub use routing_table::{InsertResult, RoutingTable};
pub use server::DiscoveryServer;
pub use state_machine::{DiscoveryPeerState, PeerState};
pub use url::NodeUrl;
