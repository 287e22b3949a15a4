//! Wire codec: message primitives, TCP framing and frame compression.
//!
//! This is the C1 component: a deterministic binary encoding for discovery
//! and transport messages, length-prefixed TCP framing, and an optional
//! Snappy compression envelope around frame bodies.

pub mod codec;
pub mod compression;
pub mod frame;

pub use codec::{CodecError, CodecResult, Reader, Serializer, Writer};
pub use compression::{Compression, CompressionError};
pub use frame::{frame_codec, DEFAULT_MAX_DECOMPRESSED, DEFAULT_MAX_FRAME};
