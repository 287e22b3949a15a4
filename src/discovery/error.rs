//! Error types for the discovery protocol.

use std::io::Error as IoError;
use std::net::AddrParseError;
use thiserror::Error;

use crate::identity::IdentityError;
use crate::wire::CodecError;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] CodecError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("invalid bootstrap URL: {0}")]
    InvalidUrl(String),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("message expired: timestamp {0} is older than {1} seconds")]
    MessageExpired(u64, u64),

    #[error("invalid packet size: expected at least {0} bytes, got {1}")]
    InvalidPacketSize(usize, usize),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("invalid node id: expected {0}, got {1}")]
    InvalidNodeId(String, String),

    #[error("routing table bucket {0} is full")]
    BucketFull(usize),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("failed to bind UDP socket on {0}: {1}")]
    BindFailed(String, IoError),

    #[error("packet too large: {0} bytes exceeds maximum {1}")]
    PacketTooLarge(usize, usize),

    #[error("hex decode error: {0}")]
    HexError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("channel send error: {0}")]
    ChannelError(String),

    #[error("cannot perform operation on self")]
    SelfOperation,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
