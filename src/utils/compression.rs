//! zlib compression for attachment transfers and sticker payloads.

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};

/// Maximum output size for one-shot inflation (prevents decompression bombs)
pub const MAX_INFLATE_SIZE: usize = MAX_FRAME_SIZE;

/// Compresses data into a zlib stream
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
}

/// Decompresses a complete zlib stream, refusing output larger than `limit`
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - The stream is malformed
/// - Output size exceeds `limit`
pub fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut reader = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();

    // Read in chunks to enforce size limit
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                if out.len() > limit {
                    return Err(ProtocolError::DecompressionFailure);
                }
            }
            Err(_) => return Err(ProtocolError::DecompressionFailure),
        }
    }
    Ok(out)
}

/// Incremental zlib decoder fed one chunk at a time
pub struct StreamInflater {
    decoder: ZlibDecoder<Vec<u8>>,
}

impl Default for StreamInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamInflater {
    pub fn new() -> Self {
        Self {
            decoder: ZlibDecoder::new(Vec::new()),
        }
    }

    /// Feed compressed bytes into the decoder
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        self.decoder
            .write_all(data)
            .map_err(|_| ProtocolError::DecompressionFailure)
    }

    /// Number of decompressed bytes produced so far
    pub fn output_len(&self) -> usize {
        self.decoder.get_ref().len()
    }

    /// Flush the decoder and return everything it produced
    pub fn finish(self) -> Result<Vec<u8>> {
        self.decoder
            .finish()
            .map_err(|_| ProtocolError::DecompressionFailure)
    }
}
