//! # oxz xz
//!
//! The `.xz` container for the oxz compression stack.
//!
//! A stream is a self-describing framed payload: Stream Header, one or
//! more independently framed blocks whose payload is produced by a filter
//! chain, a trailing Index cataloguing the blocks, and a Stream Footer.
//! Multiple streams may be concatenated with aligned zero padding.
//!
//! - [`flags`]: Stream Header/Footer and the Stream Flags
//! - [`filter`]: the filter registry and filter-flags codec
//! - [`pipeline`]: the filter chain runtime
//! - [`block`] and [`block_coder`]: block framing and payload coding
//! - [`index`] and [`index_hash`]: the block catalog and its
//!   constant-memory validator
//! - [`stream`]: the stream-level state machines
//!
//! The easiest entry points are [`xz_compress`] and [`xz_decompress`];
//! streaming callers drive [`stream::StreamEncoder`] and
//! [`stream::StreamDecoder`] through the [`Coder`] contract.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod block_coder;
pub mod filter;
pub mod flags;
pub mod index;
pub mod index_hash;
pub mod pipeline;
pub mod stream;

// Re-exports
pub use block::BlockHeader;
pub use filter::Filter;
pub use flags::StreamFlags;
pub use index::{Index, IndexRecord};
pub use index_hash::IndexHash;
pub use stream::{StreamDecoder, StreamEncoder};

use oxz_core::check::CheckType;
use oxz_core::coder::{Action, Coder};
use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;
use oxz_lzma::LzmaOptions;

use crate::flags::{STREAM_HEADER_SIZE, stream_footer_decode, stream_header_decode};

/// Container-level options: the filter chain, the check and block splitting.
#[derive(Debug, Clone)]
pub struct XzOptions {
    /// Integrity check for every block.
    pub check: CheckType,
    /// Filter chain, terminal LZMA2 last.
    pub filters: Vec<Filter>,
    /// Split blocks at this many uncompressed bytes, if set.
    pub block_size: Option<u64>,
}

impl XzOptions {
    /// Options for a compression preset 0..=9 with the default CRC-64
    /// check and a plain LZMA2 chain.
    pub fn preset(level: u32) -> Self {
        Self {
            check: CheckType::Crc64,
            filters: vec![Filter::Lzma2 {
                options: LzmaOptions::preset(level),
            }],
            block_size: None,
        }
    }
}

impl Default for XzOptions {
    fn default() -> Self {
        Self::preset(6)
    }
}

/// Compress a whole buffer into a `.xz` stream.
pub fn xz_compress(data: &[u8], options: &XzOptions) -> Result<Vec<u8>> {
    let mut encoder =
        StreamEncoder::new(options.filters.clone(), options.check, options.block_size)?;
    oxz_core::coder::code_all(&mut encoder, data)
}

/// Decompress a whole buffer of one or more concatenated `.xz` streams.
///
/// A stream with a valid but unimplemented check type is still decoded;
/// the data simply is not verified against that check.
pub fn xz_decompress(data: &[u8]) -> Result<Vec<u8>> {
    xz_decompress_limited(data, None).map(|(out, _)| out)
}

/// Like [`xz_decompress`] with a memory budget for the decoder. Returns
/// the data together with a flag telling whether an unsupported check
/// type was skipped.
pub fn xz_decompress_limited(
    data: &[u8],
    memlimit: Option<MemLimit>,
) -> Result<(Vec<u8>, bool)> {
    let mut decoder = StreamDecoder::new(true, memlimit);
    let mut out = Vec::new();
    let mut buf = vec![0u8; 1 << 16];
    let mut pos = 0;
    let mut unverified = false;

    loop {
        let action = if pos == data.len() {
            Action::Finish
        } else {
            Action::Run
        };

        match decoder.code(&data[pos..], &mut buf, action) {
            Ok(status) => {
                pos += status.consumed;
                out.extend_from_slice(&buf[..status.produced]);
                if status.ended {
                    return Ok((out, unverified));
                }
                if status.consumed == 0 && status.produced == 0 && action == Action::Finish {
                    return Err(XzError::Buffer);
                }
            }
            Err(XzError::UnsupportedCheck { .. }) => {
                unverified = true;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Summary of one stream found in a buffer.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Check type declared by the stream flags.
    pub check: CheckType,
    /// One record per block.
    pub blocks: Vec<IndexRecord>,
    /// On-wire size of the stream, padding between streams excluded.
    pub compressed_size: u64,
    /// Total uncompressed size of the stream.
    pub uncompressed_size: u64,
}

/// Walk a buffer of concatenated streams from the end, reading each
/// stream's Index without decoding any payload. This is how `list`-style
/// tooling summarises a file cheaply.
pub fn stream_list(data: &[u8]) -> Result<Vec<StreamInfo>> {
    let mut infos = Vec::new();
    let mut end = data.len();

    while end > 0 {
        // Skip stream padding, which is always four-aligned zeros.
        while end >= 4 && data[end - 4..end] == [0, 0, 0, 0] {
            end -= 4;
        }
        if end == 0 {
            break;
        }
        if end < 2 * STREAM_HEADER_SIZE + 8 {
            return Err(XzError::data("trailing garbage after the last stream"));
        }

        let footer: [u8; STREAM_HEADER_SIZE] =
            data[end - STREAM_HEADER_SIZE..end].try_into().unwrap();
        let (flags, index_size) = stream_footer_decode(&footer)?;

        let index_end = end - STREAM_HEADER_SIZE;
        let index_start = index_end
            .checked_sub(index_size as usize)
            .ok_or_else(|| XzError::data("index size reaches before the buffer"))?;
        let index = Index::decode(&data[index_start..index_end])?;

        let blocks_size = index.total_blocks_size();
        let header_start = index_start
            .checked_sub(blocks_size as usize)
            .and_then(|s| s.checked_sub(STREAM_HEADER_SIZE))
            .ok_or_else(|| XzError::data("blocks reach before the buffer"))?;

        let header: [u8; STREAM_HEADER_SIZE] = data
            [header_start..header_start + STREAM_HEADER_SIZE]
            .try_into()
            .unwrap();
        let header_flags = stream_header_decode(&header)?;
        if header_flags != flags {
            return Err(XzError::data(
                "stream flags differ between header and footer",
            ));
        }

        infos.push(StreamInfo {
            check: flags.check,
            blocks: index.records().to_vec(),
            compressed_size: (end - header_start) as u64,
            uncompressed_size: index.uncompressed_size(),
        });
        end = header_start;
    }

    infos.reverse();
    Ok(infos)
}

/// Predict the decoder memory usage of a buffer from its block headers,
/// without decoding. Walks the first block header of each stream.
pub fn decoder_memusage(data: &[u8]) -> Result<u64> {
    // The dictionary dominates; report the largest dictionary of any
    // stream's first block plus fixed overhead.
    let mut max_dict = 0u64;
    let mut offset = 0usize;

    for info in stream_list(data)? {
        let header_end = offset + STREAM_HEADER_SIZE;
        if let Some(size) = data
            .get(header_end)
            .copied()
            .and_then(block::header_size_decode)
        {
            if let Some(buf) = data.get(header_end..header_end + size) {
                if let Ok(header) = BlockHeader::decode(buf) {
                    if let Some(Filter::Lzma2 { options }) = header.filters.last() {
                        max_dict = max_dict.max(u64::from(options.dict_size));
                    }
                }
            }
        }
        offset += info.compressed_size as usize;
        // Padding between streams.
        while offset + 4 <= data.len() && data[offset..offset + 4] == [0, 0, 0, 0] {
            offset += 4;
        }
    }

    Ok(LzmaOptions::decoder_memusage(max_dict.min(u64::from(u32::MAX)) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress() {
        let data = b"top level helper roundtrip ".repeat(300);
        let options = XzOptions {
            filters: vec![Filter::Lzma2 {
                options: LzmaOptions {
                    dict_size: 1 << 16,
                    ..LzmaOptions::preset(1)
                },
            }],
            ..XzOptions::default()
        };
        let compressed = xz_compress(&data, &options).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(xz_decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_magic_bytes() {
        let compressed = xz_compress(b"x", &XzOptions::preset(0)).unwrap();
        assert_eq!(&compressed[..6], &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]);
        assert_eq!(&compressed[compressed.len() - 2..], b"YZ");
    }

    #[test]
    fn test_stream_list() {
        let options = XzOptions {
            check: CheckType::Sha256,
            block_size: Some(512),
            ..XzOptions::preset(0)
        };
        let data = b"stream listing ".repeat(200);
        let compressed = xz_compress(&data, &options).unwrap();

        let infos = stream_list(&compressed).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].check, CheckType::Sha256);
        assert!(infos[0].blocks.len() > 1);
        assert_eq!(infos[0].uncompressed_size, data.len() as u64);
        assert_eq!(infos[0].compressed_size, compressed.len() as u64);
    }

    #[test]
    fn test_stream_list_concatenated() {
        let a = xz_compress(b"first", &XzOptions::preset(0)).unwrap();
        let b = xz_compress(b"second", &XzOptions::preset(0)).unwrap();
        let mut joined = a;
        joined.extend_from_slice(&[0u8; 12]);
        joined.extend_from_slice(&b);

        let infos = stream_list(&joined).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].uncompressed_size, 5);
        assert_eq!(infos[1].uncompressed_size, 6);
    }

    #[test]
    fn test_decoder_memusage() {
        let compressed = xz_compress(b"memusage", &XzOptions::preset(0)).unwrap();
        let usage = decoder_memusage(&compressed).unwrap();
        assert!(usage >= u64::from(LzmaOptions::preset(0).dict_size));
    }
}
