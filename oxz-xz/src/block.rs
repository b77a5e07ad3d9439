//! Block Header encoding and decoding.
//!
//! A block header declares its own size in the first byte (in units of four
//! bytes; the value zero is reserved to mark the Index), carries optional
//! compressed/uncompressed sizes, the filter chain, zero padding up to the
//! declared size, and a CRC32 over everything before the CRC itself.

use oxz_core::crc::Crc32;
use oxz_core::error::{Result, XzError};
use oxz_core::vli::{VLI_MAX, vli_decode, vli_encode, vli_size};

use crate::filter::{FILTERS_MAX, Filter, validate_chain};

/// Smallest possible block header.
pub const BLOCK_HEADER_SIZE_MIN: usize = 8;

/// Largest possible block header.
pub const BLOCK_HEADER_SIZE_MAX: usize = 1024;

/// Flag bit: the Compressed Size field is present.
const FLAG_COMPRESSED_SIZE: u8 = 0x40;

/// Flag bit: the Uncompressed Size field is present.
const FLAG_UNCOMPRESSED_SIZE: u8 = 0x80;

/// Decode the header size byte into the full header length in bytes.
/// Returns `None` for the reserved value that introduces the Index.
pub fn header_size_decode(byte: u8) -> Option<usize> {
    if byte == 0 {
        None
    } else {
        Some((usize::from(byte) + 1) * 4)
    }
}

/// Everything a block header declares, plus the sizes the coders fill in
/// while the block is processed.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    /// The filter chain, forward order, terminal filter last.
    pub filters: Vec<Filter>,
    /// Declared size of the compressed payload, if any.
    pub compressed_size: Option<u64>,
    /// Declared size of the uncompressed data, if any.
    pub uncompressed_size: Option<u64>,
    /// Total header size on the wire, including the CRC.
    pub header_size: usize,
}

impl BlockHeader {
    /// Build a header for a filter chain with no declared sizes.
    pub fn new(filters: Vec<Filter>) -> Result<Self> {
        validate_chain(&filters)?;
        let mut header = Self {
            filters,
            compressed_size: None,
            uncompressed_size: None,
            header_size: 0,
        };
        header.header_size = header.encoded_size()?;
        Ok(header)
    }

    /// Compute the on-wire header size: the variable fields rounded up to
    /// a multiple of four, plus the size byte, flags and CRC.
    pub fn encoded_size(&self) -> Result<usize> {
        let mut body = 0usize;
        if let Some(size) = self.compressed_size {
            if size == 0 || size > VLI_MAX {
                return Err(XzError::options("invalid declared compressed size"));
            }
            body += vli_size(size);
        }
        if let Some(size) = self.uncompressed_size {
            if size > VLI_MAX {
                return Err(XzError::options("invalid declared uncompressed size"));
            }
            body += vli_size(size);
        }
        for filter in &self.filters {
            body += filter.flags_size();
        }

        // Size byte + flags byte + body, padded to four, + CRC32.
        let size = (1 + 1 + body + 3) / 4 * 4 + 4;
        if !(BLOCK_HEADER_SIZE_MIN..=BLOCK_HEADER_SIZE_MAX).contains(&size) {
            return Err(XzError::options("block header size out of range"));
        }
        Ok(size)
    }

    /// Serialize the header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        validate_chain(&self.filters)?;
        let size = self.encoded_size()?;

        let mut buf = vec![0u8; size];
        buf[0] = (size / 4 - 1) as u8;

        let mut flags = (self.filters.len() - 1) as u8;
        if self.compressed_size.is_some() {
            flags |= FLAG_COMPRESSED_SIZE;
        }
        if self.uncompressed_size.is_some() {
            flags |= FLAG_UNCOMPRESSED_SIZE;
        }
        buf[1] = flags;

        let mut pos = 2;
        if let Some(value) = self.compressed_size {
            vli_encode(value, &mut buf, &mut pos)?;
        }
        if let Some(value) = self.uncompressed_size {
            vli_encode(value, &mut buf, &mut pos)?;
        }
        for filter in &self.filters {
            filter.encode_flags(&mut buf, &mut pos)?;
        }
        debug_assert!(pos <= size - 4);

        let crc = Crc32::compute(&buf[..size - 4]);
        buf[size - 4..].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse and verify a complete header. `buf` must hold exactly the
    /// number of bytes announced by the size byte.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let size = header_size_decode(buf[0])
            .ok_or_else(|| XzError::data("index indicator in place of a block header"))?;
        if buf.len() != size {
            return Err(XzError::program("block header buffer size mismatch"));
        }

        let stored = u32::from_le_bytes([
            buf[size - 4],
            buf[size - 3],
            buf[size - 2],
            buf[size - 1],
        ]);
        let computed = Crc32::compute(&buf[..size - 4]);
        if stored != computed {
            return Err(XzError::crc_mismatch(stored.into(), computed.into()));
        }

        let flags = buf[1];
        if flags & 0x3C != 0 {
            return Err(XzError::options("reserved block flag bits set"));
        }
        let filter_count = usize::from(flags & 0x03) + 1;

        let mut pos = 2;
        let compressed_size = if flags & FLAG_COMPRESSED_SIZE != 0 {
            let value = vli_decode(buf, &mut pos)?;
            if value == 0 {
                return Err(XzError::data("declared compressed size of zero"));
            }
            Some(value)
        } else {
            None
        };
        let uncompressed_size = if flags & FLAG_UNCOMPRESSED_SIZE != 0 {
            Some(vli_decode(buf, &mut pos)?)
        } else {
            None
        };

        let mut filters = Vec::with_capacity(FILTERS_MAX);
        for _ in 0..filter_count {
            if pos >= size - 4 {
                return Err(XzError::data("block header too small for its filters"));
            }
            filters.push(Filter::decode_flags(&buf[..size - 4], &mut pos)?);
        }
        validate_chain(&filters)?;

        // Everything up to the CRC must be zero padding.
        if buf[pos..size - 4].iter().any(|&b| b != 0) {
            return Err(XzError::data("non-zero padding in a block header"));
        }

        Ok(Self {
            filters,
            compressed_size,
            uncompressed_size,
            header_size: size,
        })
    }

    /// Unpadded size of a finished block with these observed sizes.
    pub fn unpadded_size(&self, compressed: u64, check_size: usize) -> u64 {
        self.header_size as u64 + compressed + check_size as u64
    }
}

/// Total on-wire size of a block from its unpadded size.
pub fn total_size(unpadded: u64) -> u64 {
    unpadded.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxz_filters::bcj::BcjArch;
    use oxz_lzma::LzmaOptions;

    fn chain() -> Vec<Filter> {
        vec![
            Filter::Bcj {
                arch: BcjArch::X86,
                start_offset: 0,
            },
            Filter::Lzma2 {
                options: LzmaOptions {
                    dict_size: 1 << 20,
                    ..LzmaOptions::default()
                },
            },
        ]
    }

    #[test]
    fn test_roundtrip_plain() {
        let header = BlockHeader::new(chain()).unwrap();
        let buf = header.encode().unwrap();
        assert_eq!(buf.len() % 4, 0);
        assert!(buf.len() >= BLOCK_HEADER_SIZE_MIN);

        let parsed = BlockHeader::decode(&buf).unwrap();
        assert_eq!(parsed.filters.len(), 2);
        assert_eq!(parsed.compressed_size, None);
        assert_eq!(parsed.uncompressed_size, None);
        assert_eq!(parsed.header_size, buf.len());
    }

    #[test]
    fn test_roundtrip_with_sizes() {
        let mut header = BlockHeader::new(chain()).unwrap();
        header.compressed_size = Some(123_456);
        header.uncompressed_size = Some(987_654_321);
        header.header_size = header.encoded_size().unwrap();

        let buf = header.encode().unwrap();
        let parsed = BlockHeader::decode(&buf).unwrap();
        assert_eq!(parsed.compressed_size, Some(123_456));
        assert_eq!(parsed.uncompressed_size, Some(987_654_321));
    }

    #[test]
    fn test_crc_is_verified() {
        let header = BlockHeader::new(chain()).unwrap();
        let mut buf = header.encode().unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x40;
        assert!(matches!(
            BlockHeader::decode(&buf),
            Err(XzError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_reserved_flag_bits() {
        let header = BlockHeader::new(chain()).unwrap();
        let mut buf = header.encode().unwrap();
        buf[1] |= 0x04;
        let size = buf.len();
        let crc = Crc32::compute(&buf[..size - 4]);
        buf[size - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            BlockHeader::decode(&buf),
            Err(XzError::Options { .. })
        ));
    }

    #[test]
    fn test_nonzero_padding_rejected() {
        let header = BlockHeader::new(chain()).unwrap();
        let mut buf = header.encode().unwrap();
        // Corrupt a padding byte (just before the CRC) if there is one,
        // otherwise grow the header to create padding.
        let size = buf.len();
        buf[size - 5] = 0xAA;
        let crc = Crc32::compute(&buf[..size - 4]);
        buf[size - 4..].copy_from_slice(&crc.to_le_bytes());

        let result = BlockHeader::decode(&buf);
        assert!(result.is_err());
    }

    #[test]
    fn test_size_math() {
        let header = BlockHeader::new(chain()).unwrap();
        let unpadded = header.unpadded_size(1001, 8);
        assert_eq!(unpadded, header.header_size as u64 + 1001 + 8);
        assert_eq!(total_size(unpadded) % 4, 0);
        assert!(total_size(unpadded) - unpadded <= 3);
        assert_eq!(total_size(8), 8);
        assert_eq!(total_size(9), 12);
    }

    #[test]
    fn test_header_size_byte() {
        assert_eq!(header_size_decode(0), None);
        assert_eq!(header_size_decode(1), Some(8));
        assert_eq!(header_size_decode(255), Some(1024));
    }
}
