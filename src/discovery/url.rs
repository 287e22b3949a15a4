//! `nodeid://` bootstrap URL parser.
//!
//! Format: `nodeid://<node_id_hex>@<ip>:<port>`

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::identity::{NodeId, NODE_ID_LEN};

use super::error::{DiscoveryError, DiscoveryResult};

pub const NODEID_URL_SCHEME: &str = "nodeid://";

const NODE_ID_HEX_LEN: usize = NODE_ID_LEN * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeUrl {
    pub node_id: NodeId,
    pub address: SocketAddr,
}

impl NodeUrl {
    pub fn new(node_id: NodeId, address: SocketAddr) -> Self {
        Self { node_id, address }
    }

    pub fn parse(s: &str) -> DiscoveryResult<Self> {
        let rest = s.strip_prefix(NODEID_URL_SCHEME).ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must start with '{NODEID_URL_SCHEME}', got: {s}"
            ))
        })?;

        let parts: Vec<&str> = rest.splitn(2, '@').collect();
        if parts.len() != 2 {
            return Err(DiscoveryError::InvalidUrl(format!(
                "URL must contain '@' separator between node_id and address: {s}"
            )));
        }

        let node_id_hex = parts[0];
        let address_str = parts[1];

        if node_id_hex.len() != NODE_ID_HEX_LEN {
            return Err(DiscoveryError::InvalidUrl(format!(
                "node id must be {NODE_ID_HEX_LEN} hex characters ({NODE_ID_LEN} bytes), got {} characters",
                node_id_hex.len()
            )));
        }

        let node_id_bytes = hex::decode(node_id_hex)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("invalid node id hex: {e}")))?;
        let node_id = NodeId::from_slice(&node_id_bytes)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("invalid node id: {e}")))?;

        let address: SocketAddr = address_str.parse().map_err(|e| {
            DiscoveryError::InvalidUrl(format!("invalid socket address '{address_str}': {e}"))
        })?;

        Ok(Self { node_id, address })
    }

    pub fn to_string_url(&self) -> String {
        format!(
            "{}{}@{}",
            NODEID_URL_SCHEME,
            hex::encode(self.node_id.as_bytes()),
            self.address
        )
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_url())
    }
}

impl FromStr for NodeUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
