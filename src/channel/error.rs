//! Channel-pipeline error kinds (§7).

use thiserror::Error;

use crate::wire::{CodecError, CompressionError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame codec error: {0}")]
    Frame(String),
    #[error("message codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("incompatible peer: network_id={0} network_version={1}")]
    Incompatible(u8, i16),
    #[error("idle timeout")]
    Timeout,
    #[error("channel closed")]
    Closed,
    #[error("unknown message code {0}")]
    UnknownCode(u8),
}

pub type ChannelResult<T> = Result<T, ChannelError>;
