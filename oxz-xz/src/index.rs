//! The Index field.
//!
//! The Index is the trailing catalog of a stream: one record per block with
//! its unpadded and uncompressed size. Readers use it to seek and to verify
//! that the blocks they decoded are the blocks the writer wrote.

use oxz_core::crc::Crc32;
use oxz_core::error::{Result, XzError};
use oxz_core::vli::{VLI_MAX, vli_decode, vli_encode, vli_size};

use crate::block::total_size;

/// The byte that distinguishes the Index from a block header.
pub const INDEX_INDICATOR: u8 = 0x00;

/// One block's sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Size of the block without its trailing padding.
    pub unpadded_size: u64,
    /// Size of the block's uncompressed data.
    pub uncompressed_size: u64,
}

/// The block catalog of one stream.
#[derive(Debug, Clone, Default)]
pub struct Index {
    records: Vec<IndexRecord>,
}

impl Index {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded blocks.
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Append one block.
    pub fn push(&mut self, unpadded_size: u64, uncompressed_size: u64) -> Result<()> {
        if unpadded_size == 0 || unpadded_size > VLI_MAX || uncompressed_size > VLI_MAX {
            return Err(XzError::data("block sizes out of range for the index"));
        }
        self.records.push(IndexRecord {
            unpadded_size,
            uncompressed_size,
        });
        Ok(())
    }

    /// Sum of the total (padded) sizes of all recorded blocks.
    pub fn total_blocks_size(&self) -> u64 {
        self.records.iter().map(|r| total_size(r.unpadded_size)).sum()
    }

    /// Sum of all uncompressed sizes.
    pub fn uncompressed_size(&self) -> u64 {
        self.records.iter().map(|r| r.uncompressed_size).sum()
    }

    /// Size of the serialized Index field in bytes.
    pub fn encoded_size(&self) -> u64 {
        let mut size = 1 + vli_size(self.records.len() as u64) as u64;
        for record in &self.records {
            size += vli_size(record.unpadded_size) as u64;
            size += vli_size(record.uncompressed_size) as u64;
        }
        // Pad the field, CRC included, to a multiple of four.
        size.div_ceil(4) * 4 + 4
    }

    /// Serialize the Index field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let size = self.encoded_size() as usize;
        let mut buf = vec![0u8; size];

        buf[0] = INDEX_INDICATOR;
        let mut pos = 1;
        vli_encode(self.records.len() as u64, &mut buf, &mut pos)?;
        for record in &self.records {
            vli_encode(record.unpadded_size, &mut buf, &mut pos)?;
            vli_encode(record.uncompressed_size, &mut buf, &mut pos)?;
        }
        // buf is zero-initialized, so the padding is already in place.

        let crc = Crc32::compute(&buf[..size - 4]);
        buf[size - 4..].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse a complete Index field, verifying padding and CRC.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 || buf.len() % 4 != 0 {
            return Err(XzError::data("index field size is invalid"));
        }
        if buf[0] != INDEX_INDICATOR {
            return Err(XzError::data("index indicator byte not found"));
        }

        let stored = u32::from_le_bytes([
            buf[buf.len() - 4],
            buf[buf.len() - 3],
            buf[buf.len() - 2],
            buf[buf.len() - 1],
        ]);
        let computed = Crc32::compute(&buf[..buf.len() - 4]);
        if stored != computed {
            return Err(XzError::crc_mismatch(stored.into(), computed.into()));
        }

        let mut pos = 1;
        let count = vli_decode(buf, &mut pos)?;
        let mut index = Self::new();
        for _ in 0..count {
            let unpadded = vli_decode(buf, &mut pos)?;
            let uncompressed = vli_decode(buf, &mut pos)?;
            index.push(unpadded, uncompressed)?;
        }

        if buf[pos..buf.len() - 4].iter().any(|&b| b != 0) {
            return Err(XzError::data("non-zero padding in the index"));
        }

        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_index() {
        let index = Index::new();
        let buf = index.encode().unwrap();
        // Indicator + count + padding + CRC.
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.len() as u64, index.encoded_size());

        let parsed = Index::decode(&buf).unwrap();
        assert!(parsed.records().is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let mut index = Index::new();
        index.push(22, 33).unwrap();
        index.push(44, 55).unwrap();
        index.push(66, 77).unwrap();

        let buf = index.encode().unwrap();
        assert_eq!(buf.len() as u64, index.encoded_size());
        assert_eq!(buf.len() % 4, 0);

        let parsed = Index::decode(&buf).unwrap();
        assert_eq!(parsed.records(), index.records());
        assert_eq!(parsed.uncompressed_size(), 33 + 55 + 77);
    }

    #[test]
    fn test_large_sizes() {
        let mut index = Index::new();
        index.push(VLI_MAX, VLI_MAX).unwrap();
        let buf = index.encode().unwrap();
        let parsed = Index::decode(&buf).unwrap();
        assert_eq!(parsed.records()[0].unpadded_size, VLI_MAX);
    }

    #[test]
    fn test_total_blocks_size_rounds_up() {
        let mut index = Index::new();
        index.push(21, 100).unwrap();
        index.push(24, 100).unwrap();
        assert_eq!(index.total_blocks_size(), 24 + 24);
    }

    #[test]
    fn test_invalid_records() {
        let mut index = Index::new();
        assert!(index.push(0, 5).is_err());
        assert!(index.push(u64::MAX, 5).is_err());
    }

    #[test]
    fn test_crc_verified() {
        let mut index = Index::new();
        index.push(100, 200).unwrap();
        let mut buf = index.encode().unwrap();
        buf[2] ^= 1;
        assert!(Index::decode(&buf).is_err());
    }
}
