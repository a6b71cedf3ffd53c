//! Decoding of COMPRESSED_MESSAGE payloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use std::io::Read;

use crate::error::SocketError;

/// Turns a compressed payload back into the JSON text of a server message.
pub trait Decompressor: Send + Sync {
    fn decompress(&self, payload: &str) -> Result<String, SocketError>;
}

/// Base64-encoded gzip, the encoding keyservers use for large frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipDecompressor;

impl Decompressor for GzipDecompressor {
    fn decompress(&self, payload: &str) -> Result<String, SocketError> {
        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| SocketError::MalformedMessage(format!("invalid base64 payload: {}", e)))?;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| SocketError::MalformedMessage(format!("gzip decode failed: {}", e)))?;
        Ok(text)
    }
}

#[cfg(test)]
pub(crate) fn compress_for_test(text: &str) -> String {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(text.as_bytes()).unwrap();
    STANDARD.encode(encoder.finish().unwrap())
}

#[cfg(test)]
#[path = "tests/compression_tests.rs"]
mod tests;
