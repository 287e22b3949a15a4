//! Length-prefixed TCP framing: `u32 length || body`.
//!
//! Built on `tokio_util::codec::LengthDelimitedCodec` the way `ethrex-p2p`
//! pulls in `tokio-util`'s codec feature for its own RLPx framing. The
//! codec enforces `MAX_FRAME` itself by refusing to decode any frame whose
//! declared length prefix exceeds it; callers never see an oversized frame.

use tokio_util::codec::LengthDelimitedCodec;

/// Default maximum frame body size (64 KiB), configurable per connection.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Upper bound on a decompressed frame body, independent of the wire frame
/// length prefix. Guards against zip-bomb-style `uncompressed_size` claims
/// in the compression envelope.
pub const DEFAULT_MAX_DECOMPRESSED: usize = 8 * DEFAULT_MAX_FRAME;

/// Build a length-delimited frame codec bounded to `max_frame` bytes.
///
/// Frame layout: 4-byte big-endian length prefix, not itself included in
/// the count, followed by exactly `length` bytes of body.
pub fn frame_codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame)
        .big_endian()
        .new_codec()
}
