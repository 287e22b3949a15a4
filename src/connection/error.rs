//! Admission-control error kinds (§7): distinguished by behavior, not by type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("too many peers (max_connections reached)")]
    TooManyPeers,
    #[error("duplicate peer: already connected to {0}")]
    DuplicatePeer(std::net::SocketAddr),
    #[error("peer {0} is banned")]
    PeerBanned(std::net::IpAddr),
    #[error("too many connections from {0} (max_connections_same_ip reached)")]
    TooManySameIp(std::net::IpAddr),
    #[error("dial to {0} timed out")]
    Timeout(std::net::SocketAddr),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot connect to the home node")]
    SelfConnection,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
