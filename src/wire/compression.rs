//! Optional Snappy compression envelope for transport frame bodies.
//!
//! Envelope layout when compression is enabled: `u8 algo || u32
//! uncompressed_size || bytes compressed`. `algo = 0` means "stored, not
//! compressed" (used when compressing would not shrink the payload);
//! `algo = 1` means Snappy. Mirrors `p2p/compression.rs`'s encoder/decoder
//! pair reusing scratch buffers behind a `Mutex`, same `snap` crate.

use human_bytes::human_bytes;
use metrics::histogram;
use snap::raw::{Decoder, Encoder};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

use super::frame::DEFAULT_MAX_DECOMPRESSED;

/// Packets smaller than this are sent stored; compressing them rarely pays
/// for the CPU and can even grow small inputs.
pub const COMPRESSION_THRESHOLD: usize = 256;

pub const ALGO_STORED: u8 = 0;
pub const ALGO_SNAPPY: u8 = 1;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("compression failed")]
    Compress,
    #[error("decompression failed")]
    Decompress,
    #[error("unknown compression algorithm id {0}")]
    UnknownAlgo(u8),
    #[error("envelope too short")]
    Truncated,
    #[error("uncompressed size {0} exceeds maximum {1}")]
    TooLarge(u32, usize),
}

pub type CompressionResult<T> = Result<T, CompressionError>;

/// Per-connection compressor/decompressor. `None` means compression is
/// disabled for this connection (frame bodies are sent stored without an
/// envelope at all; see `channel::handshake` for the negotiation).
pub struct Compression {
    encoder: Mutex<Encoder>,
    decoder: Mutex<Decoder>,
    max_decompressed: usize,
}

impl Compression {
    pub fn new(max_decompressed: usize) -> Self {
        Self {
            encoder: Mutex::new(Encoder::new()),
            decoder: Mutex::new(Decoder::new()),
            max_decompressed,
        }
    }

    /// Wrap `body` in a compression envelope, compressing if it is both
    /// above `COMPRESSION_THRESHOLD` and Snappy actually shrinks it.
    pub async fn encode(&self, body: &[u8]) -> CompressionResult<Vec<u8>> {
        let (algo, payload) = if body.len() > COMPRESSION_THRESHOLD {
            let start = Instant::now();
            let mut encoder = self.encoder.lock().await;
            let compressed = encoder
                .compress_vec(body)
                .map_err(|_| CompressionError::Compress)?;
            histogram!("p2p_net_compress_ms").record(start.elapsed().as_secs_f64() * 1000.0);

            if compressed.len() < body.len() {
                trace_compressed(body.len(), compressed.len());
                (ALGO_SNAPPY, compressed)
            } else {
                (ALGO_STORED, body.to_vec())
            }
        } else {
            (ALGO_STORED, body.to_vec())
        };

        let mut envelope = Vec::with_capacity(1 + 4 + payload.len());
        envelope.push(algo);
        envelope.extend_from_slice(&(body.len() as u32).to_be_bytes());
        envelope.extend_from_slice(&payload);
        Ok(envelope)
    }

    /// Unwrap a compression envelope, rejecting claims of an uncompressed
    /// size larger than `max_decompressed`.
    pub async fn decode(&self, envelope: &[u8]) -> CompressionResult<Vec<u8>> {
        if envelope.len() < 5 {
            return Err(CompressionError::Truncated);
        }
        let algo = envelope[0];
        let uncompressed_size = u32::from_be_bytes(envelope[1..5].try_into().unwrap());
        if uncompressed_size as usize > self.max_decompressed {
            return Err(CompressionError::TooLarge(
                uncompressed_size,
                self.max_decompressed,
            ));
        }
        let payload = &envelope[5..];

        match algo {
            ALGO_STORED => Ok(payload.to_vec()),
            ALGO_SNAPPY => {
                let start = Instant::now();
                let mut decoder = self.decoder.lock().await;
                let decompressed = decoder
                    .decompress_vec(payload)
                    .map_err(|_| CompressionError::Decompress)?;
                histogram!("p2p_net_decompress_ms").record(start.elapsed().as_secs_f64() * 1000.0);
                if decompressed.len() != uncompressed_size as usize {
                    return Err(CompressionError::Decompress);
                }
                Ok(decompressed)
            }
            other => Err(CompressionError::UnknownAlgo(other)),
        }
    }
}

impl Default for Compression {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DECOMPRESSED)
    }
}

fn trace_compressed(before: usize, after: usize) {
    if log::log_enabled!(log::Level::Trace) {
        log::trace!(
            "compressed frame body {} -> {}",
            human_bytes(before as f64),
            human_bytes(after as f64)
        );
    }
}
