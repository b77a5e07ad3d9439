//! Stream Header and Stream Footer.
//!
//! Both ends of a stream are fixed 12-byte structures. The two Stream Flags
//! bytes must be byte-identical in header and footer; the footer adds the
//! Backward Size so a reader can locate the Index from the end of the file.

use oxz_core::check::CheckType;
use oxz_core::crc::Crc32;
use oxz_core::error::{Result, XzError};

/// The six magic bytes opening a stream.
pub const HEADER_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];

/// The two magic bytes closing a stream.
pub const FOOTER_MAGIC: [u8; 2] = [0x59, 0x5A];

/// Size of the Stream Header and the Stream Footer.
pub const STREAM_HEADER_SIZE: usize = 12;

/// The Stream Flags: currently just the check type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags {
    /// Integrity check applied to every block.
    pub check: CheckType,
}

impl StreamFlags {
    fn encode_bytes(self) -> [u8; 2] {
        [0x00, self.check.id()]
    }

    fn decode_bytes(bytes: [u8; 2]) -> Result<Self> {
        if bytes[0] != 0x00 || bytes[1] & 0xF0 != 0 {
            return Err(XzError::options("reserved stream flag bits set"));
        }
        Ok(Self {
            check: CheckType::from_id(bytes[1])?,
        })
    }
}

/// Serialize the 12-byte Stream Header.
pub fn stream_header_encode(flags: StreamFlags) -> [u8; STREAM_HEADER_SIZE] {
    let mut out = [0u8; STREAM_HEADER_SIZE];
    out[..6].copy_from_slice(&HEADER_MAGIC);
    out[6..8].copy_from_slice(&flags.encode_bytes());
    let crc = Crc32::compute(&out[6..8]);
    out[8..12].copy_from_slice(&crc.to_le_bytes());
    out
}

/// Parse and verify a 12-byte Stream Header.
pub fn stream_header_decode(buf: &[u8; STREAM_HEADER_SIZE]) -> Result<StreamFlags> {
    if buf[..6] != HEADER_MAGIC {
        return Err(XzError::Format);
    }

    let stored = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let computed = Crc32::compute(&buf[6..8]);
    if stored != computed {
        return Err(XzError::crc_mismatch(stored.into(), computed.into()));
    }

    StreamFlags::decode_bytes([buf[6], buf[7]])
}

/// Serialize the 12-byte Stream Footer for an Index of `index_size` bytes.
pub fn stream_footer_encode(flags: StreamFlags, index_size: u64) -> Result<[u8; STREAM_HEADER_SIZE]> {
    debug_assert_eq!(index_size % 4, 0);
    let backward = index_size / 4 - 1;
    if backward > u64::from(u32::MAX) {
        return Err(XzError::program("index too large for the footer"));
    }

    let mut out = [0u8; STREAM_HEADER_SIZE];
    out[4..8].copy_from_slice(&(backward as u32).to_le_bytes());
    out[8..10].copy_from_slice(&flags.encode_bytes());
    out[10..12].copy_from_slice(&FOOTER_MAGIC);
    let crc = Crc32::compute(&out[4..10]);
    out[..4].copy_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Parse and verify a 12-byte Stream Footer. Returns the flags and the
/// size of the Index field in bytes.
pub fn stream_footer_decode(buf: &[u8; STREAM_HEADER_SIZE]) -> Result<(StreamFlags, u64)> {
    if buf[10..12] != FOOTER_MAGIC {
        return Err(XzError::data("stream footer magic bytes not found"));
    }

    let stored = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let computed = Crc32::compute(&buf[4..10]);
    if stored != computed {
        return Err(XzError::crc_mismatch(stored.into(), computed.into()));
    }

    let backward = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let flags = StreamFlags::decode_bytes([buf[8], buf[9]])?;
    Ok((flags, (u64::from(backward) + 1) * 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for check in [
            CheckType::None,
            CheckType::Crc32,
            CheckType::Crc64,
            CheckType::Sha256,
        ] {
            let flags = StreamFlags { check };
            let buf = stream_header_encode(flags);
            assert_eq!(stream_header_decode(&buf).unwrap(), flags);
        }
    }

    #[test]
    fn test_header_bytes_crc64() {
        // Known encoding: CRC64 check type is id 0x04.
        let buf = stream_header_encode(StreamFlags {
            check: CheckType::Crc64,
        });
        assert_eq!(&buf[..6], &HEADER_MAGIC);
        assert_eq!(buf[6], 0x00);
        assert_eq!(buf[7], 0x04);
    }

    #[test]
    fn test_footer_roundtrip() {
        let flags = StreamFlags {
            check: CheckType::Crc32,
        };
        for index_size in [8u64, 16, 1024, 1 << 20] {
            let buf = stream_footer_encode(flags, index_size).unwrap();
            let (parsed, size) = stream_footer_decode(&buf).unwrap();
            assert_eq!(parsed, flags);
            assert_eq!(size, index_size);
        }
    }

    #[test]
    fn test_header_wrong_magic() {
        let mut buf = stream_header_encode(StreamFlags::default());
        buf[0] ^= 1;
        assert!(matches!(
            stream_header_decode(&buf),
            Err(XzError::Format)
        ));
    }

    #[test]
    fn test_header_crc_flip() {
        let mut buf = stream_header_encode(StreamFlags::default());
        buf[8] ^= 0x10;
        assert!(matches!(
            stream_header_decode(&buf),
            Err(XzError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_flags_reserved_bits() {
        let mut buf = stream_header_encode(StreamFlags::default());
        buf[6] = 0x01;
        let crc = Crc32::compute(&buf[6..8]);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            stream_header_decode(&buf),
            Err(XzError::Options { .. })
        ));
    }

    #[test]
    fn test_footer_flags_match_header() {
        let flags = StreamFlags {
            check: CheckType::Sha256,
        };
        let header = stream_header_encode(flags);
        let footer = stream_footer_encode(flags, 8).unwrap();
        assert_eq!(header[6..8], footer[8..10]);
    }
}
