//! Per-chunk compression: applied only if the raw size meets the
//! configured threshold *and* the compressed result is smaller than the raw
//! input. Incompressible chunks are stored raw, and the algorithm actually
//! used is recorded on the chunk entry so reads decompress with the right
//! codec regardless of later configuration changes.

use crate::config::CompressionKind;
use std::io::{Read, Write};

/// Errors from compressing or decompressing a chunk.
#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    /// The underlying codec failed.
    #[error("compression codec error: {0}")]
    Codec(String),
}

impl CompressError {
    /// Fold into the crate-wide taxonomy: a codec failure is an unexpected
    /// invariant violation, not a transient or retryable condition.
    pub fn kind(&self) -> crate::error::ErrorKind {
        crate::error::ErrorKind::Fatal
    }
}

/// Compress `data` with `kind` if it is at least `threshold` bytes and the
/// result is actually smaller; otherwise returns the kind actually used
/// (`CompressionKind::None`) alongside the original bytes.
pub fn compress(
    data: &[u8],
    kind: CompressionKind,
    threshold: usize,
) -> Result<(CompressionKind, Vec<u8>), CompressError> {
    if data.len() < threshold || matches!(kind, CompressionKind::None) {
        return Ok((CompressionKind::None, data.to_vec()));
    }

    let compressed = match kind {
        CompressionKind::None => unreachable!(),
        CompressionKind::Gzip => {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .map_err(|e| CompressError::Codec(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| CompressError::Codec(e.to_string()))?
        }
        CompressionKind::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new()
                .build(Vec::new())
                .map_err(|e| CompressError::Codec(e.to_string()))?;
            encoder
                .write_all(data)
                .map_err(|e| CompressError::Codec(e.to_string()))?;
            let (buf, result) = encoder.finish();
            result.map_err(|e| CompressError::Codec(e.to_string()))?;
            buf
        }
        CompressionKind::Zstd => {
            zstd::encode_all(data, 0).map_err(|e| CompressError::Codec(e.to_string()))?
        }
        CompressionKind::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params)
                .map_err(|e| CompressError::Codec(e.to_string()))?;
            out
        }
    };

    if compressed.len() < data.len() {
        Ok((kind, compressed))
    } else {
        Ok((CompressionKind::None, data.to_vec()))
    }
}

/// Decompress `data` that was compressed with `kind`. `CompressionKind::None`
/// is a no-op copy.
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, CompressError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Gzip => {
            use flate2::read::GzDecoder;
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CompressError::Codec(e.to_string()))?;
            Ok(out)
        }
        CompressionKind::Lz4 => {
            let mut decoder =
                lz4::Decoder::new(data).map_err(|e| CompressError::Codec(e.to_string()))?;
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CompressError::Codec(e.to_string()))?;
            Ok(out)
        }
        CompressionKind::Zstd => {
            zstd::decode_all(data).map_err(|e| CompressError::Codec(e.to_string()))
        }
        CompressionKind::Brotli => {
            let mut out = Vec::new();
            let mut reader = brotli::Decompressor::new(data, 4096);
            reader
                .read_to_end(&mut out)
                .map_err(|e| CompressError::Codec(e.to_string()))?;
            Ok(out)
        }
    }
}
