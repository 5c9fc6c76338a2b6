//! Zlib compression for batch payloads.

use std::io::Write;

use anyhow::{bail, Context, Result};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

/// Symmetric compressor with a fixed level.
///
/// `decompress(compress(x)) == x` for every byte sequence, and empty input
/// passes through unchanged in both directions.
#[derive(Debug, Clone)]
pub struct Compressor {
    level: u32,
}

impl Compressor {
    /// Create a compressor. Levels 1 (fastest) through 9 (smallest).
    pub fn new(level: u32) -> Result<Self> {
        if !(1..=9).contains(&level) {
            bail!("compression level must be in 1..=9, got {level}");
        }
        Ok(Self { level })
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .context("failed to compress payload")?;
        Ok(encoder.finish()?)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let mut decoder = ZlibDecoder::new(Vec::new());
        decoder
            .write_all(data)
            .context("failed to decompress payload")?;
        Ok(decoder.finish()?)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        // Level 6 is zlib's usual speed/size tradeoff.
        Self { level: 6 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let c = Compressor::default();
        let input = b"INSERT INTO `users` VALUES (1,'a'),(2,'b')".repeat(50);
        let packed = c.compress(&input).unwrap();
        assert!(packed.len() < input.len());
        assert_eq!(c.decompress(&packed).unwrap(), input);
    }

    #[test]
    fn test_empty_passthrough() {
        let c = Compressor::default();
        assert!(c.compress(&[]).unwrap().is_empty());
        assert!(c.decompress(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_roundtrip_arbitrary_bytes() {
        let c = Compressor::new(1).unwrap();
        let input: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        assert_eq!(c.decompress(&c.compress(&input).unwrap()).unwrap(), input);
    }

    #[test]
    fn test_distinct_inputs_compress_distinctly() {
        let c = Compressor::default();
        let a = c.compress(b"alpha").unwrap();
        let b = c.compress(b"bravo").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_level_bounds() {
        assert!(Compressor::new(0).is_err());
        assert!(Compressor::new(10).is_err());
        assert!(Compressor::new(9).is_ok());
    }
}
