use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("gzip encoding failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Gzip-encodes a request body.
pub fn gzip(data: &[u8]) -> Result<Bytes, CompressionError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    Ok(Bytes::from(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn output_decodes_back_to_the_input() {
        let input = b"some log line\nanother log line\n".repeat(50);
        let compressed = gzip(&input).unwrap();
        assert!(compressed.len() < input.len());

        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn empty_input_is_valid() {
        let compressed = gzip(b"").unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert!(decompressed.is_empty());
    }
}
