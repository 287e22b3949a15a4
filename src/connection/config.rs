//! Connection manager configuration (§4.4, §6 environment/config).

use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

pub const DEFAULT_POOL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MALFORMED_BAN_DURATION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Minimum total connections the manager tries to maintain.
    #[clap(long, default_value_t = 8)]
    pub min_connections: usize,
    /// Minimum outbound ("active") connections among `min_connections`.
    #[clap(long, default_value_t = 4)]
    pub min_active_connections: usize,
    /// Hard cap on total connections (inbound + outbound).
    #[clap(long, default_value_t = 50)]
    pub max_connections: usize,
    /// Hard cap on connections sharing the same remote IP.
    #[clap(long, default_value_t = 3)]
    pub max_connections_same_ip: usize,

    #[clap(skip)]
    pub trust_nodes: Vec<SocketAddr>,
    #[clap(skip)]
    pub seed_nodes: Vec<SocketAddr>,
    #[clap(skip)]
    pub active_nodes: Vec<SocketAddr>,

    #[clap(skip)]
    pub pool_interval: Duration,
    #[clap(skip)]
    pub ban_duration: Duration,
    #[clap(skip)]
    pub malformed_ban_duration: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            min_connections: 8,
            min_active_connections: 4,
            max_connections: 50,
            max_connections_same_ip: 3,
            trust_nodes: Vec::new(),
            seed_nodes: Vec::new(),
            active_nodes: Vec::new(),
            pool_interval: DEFAULT_POOL_INTERVAL,
            ban_duration: DEFAULT_BAN_DURATION,
            malformed_ban_duration: DEFAULT_MALFORMED_BAN_DURATION,
        }
    }
}

impl ConnectionConfig {
    pub fn is_trusted(&self, addr: &SocketAddr) -> bool {
        self.trust_nodes.iter().any(|t| t.ip() == addr.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_caps_are_sane() {
        let config = ConnectionConfig::default();
        assert!(config.min_connections <= config.max_connections);
        assert!(config.min_active_connections <= config.min_connections);
    }

    #[test]
    fn trust_check_matches_by_ip_only() {
        let mut config = ConnectionConfig::default();
        config.trust_nodes.push("10.0.0.1:30303".parse().unwrap());
        assert!(config.is_trusted(&"10.0.0.1:40000".parse().unwrap()));
        assert!(!config.is_trusted(&"10.0.0.2:30303".parse().unwrap()));
    }
}
