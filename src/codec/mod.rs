//! # Tile Codec Layer
//!
//! Per-tile compression and decompression. A tile travels to disk as:
//!
//! ```text
//! +----------------------+-------------------------------+
//! | u64 decompressed len | payload (compressor-specific) |
//! +----------------------+-------------------------------+
//! ```
//!
//! The length prefix is written for every compressor, including `None`, so
//! the reader can size its output buffer before touching the payload and
//! can validate the decode against the book-keeping record.
//!
//! Book-keeping stores the total on-disk size of the frame (prefix included);
//! the payload length is always `recorded size - 8`.

use std::io::{Read, Write};

use eyre::{ensure, Result, WrapErr};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Per-attribute tile compressor, frozen in the array schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Gzip,
}

impl Compressor {
    pub fn code(self) -> u8 {
        match self {
            Compressor::None => 0,
            Compressor::Gzip => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Compressor::None),
            1 => Ok(Compressor::Gzip),
            other => eyre::bail!("unknown compressor code {}", other),
        }
    }

    /// Encodes one tile into its on-disk frame.
    pub fn compress(self, tile: &[u8]) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(8 + tile.len());
        frame.extend((tile.len() as u64).to_le_bytes());
        match self {
            Compressor::None => frame.extend_from_slice(tile),
            Compressor::Gzip => {
                let mut encoder = ZlibEncoder::new(frame, Compression::default());
                encoder
                    .write_all(tile)
                    .wrap_err("failed to compress tile")?;
                frame = encoder.finish().wrap_err("failed to finish compression")?;
            }
        }
        Ok(frame)
    }

    /// Decodes one on-disk frame back into tile bytes.
    pub fn decompress(self, frame: &[u8]) -> Result<Vec<u8>> {
        ensure!(
            frame.len() >= 8,
            "tile frame of {} bytes is shorter than its length prefix",
            frame.len()
        );
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&frame[..8]);
        let decompressed_len = u64::from_le_bytes(prefix) as usize;
        let payload = &frame[8..];

        let tile = match self {
            Compressor::None => {
                ensure!(
                    payload.len() == decompressed_len,
                    "uncompressed tile payload is {} bytes, prefix says {}",
                    payload.len(),
                    decompressed_len
                );
                payload.to_vec()
            }
            Compressor::Gzip => {
                let mut tile = Vec::with_capacity(decompressed_len);
                ZlibDecoder::new(payload)
                    .read_to_end(&mut tile)
                    .wrap_err("failed to decompress tile")?;
                ensure!(
                    tile.len() == decompressed_len,
                    "decompressed tile is {} bytes, prefix says {}",
                    tile.len(),
                    decompressed_len
                );
                tile
            }
        };
        Ok(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let tile: Vec<u8> = (0..4096u32).flat_map(|v| (v % 7).to_le_bytes()).collect();
        let frame = Compressor::Gzip.compress(&tile).unwrap();
        assert!(frame.len() < tile.len(), "repetitive data should shrink");
        assert_eq!(Compressor::Gzip.decompress(&frame).unwrap(), tile);
    }

    #[test]
    fn none_round_trip_keeps_prefix() {
        let tile = b"plain bytes".to_vec();
        let frame = Compressor::None.compress(&tile).unwrap();
        assert_eq!(frame.len(), tile.len() + 8);
        assert_eq!(Compressor::None.decompress(&frame).unwrap(), tile);
    }

    #[test]
    fn empty_tile_round_trip() {
        for compressor in [Compressor::None, Compressor::Gzip] {
            let frame = compressor.compress(&[]).unwrap();
            assert!(compressor.decompress(&frame).unwrap().is_empty());
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(Compressor::None.decompress(&[1, 2, 3]).is_err());

        let frame = Compressor::Gzip.compress(b"some tile data").unwrap();
        assert!(Compressor::Gzip.decompress(&frame[..frame.len() - 3]).is_err());
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut frame = Compressor::None.compress(b"abcd").unwrap();
        frame[0] = 9;
        assert!(Compressor::None.decompress(&frame).is_err());
    }
}
