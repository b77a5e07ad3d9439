//! Constant-memory Index validation.
//!
//! While decoding blocks, the stream decoder cannot afford to materialise
//! the whole Index just to compare it at the end. Instead it accumulates
//! two rolling digests and the running sums as each block finishes; when
//! the Index field finally arrives it is parsed record by record, feeding
//! the same digests, and any disagreement is a data error. Memory use is
//! constant no matter how many blocks the stream has.

use oxz_core::crc::{Crc32, Crc64};
use oxz_core::error::{Result, XzError};
use oxz_core::vli::{VLI_MAX, VliReader, vli_size};

use crate::index::INDEX_INDICATOR;

/// Digest pair over the record stream: one over the raw (unpadded,
/// uncompressed) values, one over their encoded VLI bytes.
#[derive(Debug, Clone)]
struct RecordDigest {
    values: Crc64,
    encoded: Crc64,
}

impl RecordDigest {
    fn new() -> Self {
        Self {
            values: Crc64::new(),
            encoded: Crc64::new(),
        }
    }

    fn push_values(&mut self, unpadded: u64, uncompressed: u64) {
        self.values.update(&unpadded.to_le_bytes());
        self.values.update(&uncompressed.to_le_bytes());
    }

    fn push_encoded_byte(&mut self, byte: u8) {
        self.encoded.update(&[byte]);
    }

    /// Encode both values the canonical way and feed the byte digest, for
    /// the appending (block-decoding) side.
    fn push_encoded_values(&mut self, unpadded: u64, uncompressed: u64) {
        for value in [unpadded, uncompressed] {
            let mut v = value;
            loop {
                let byte = (v & 0x7F) as u8;
                v >>= 7;
                if v == 0 {
                    self.encoded.update(&[byte]);
                    break;
                }
                self.encoded.update(&[byte | 0x80]);
            }
        }
    }

    fn matches(&self, other: &Self) -> bool {
        self.values.value() == other.values.value()
            && self.encoded.value() == other.encoded.value()
    }
}

/// Parsing position within the Index field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seq {
    Indicator,
    Count,
    Unpadded,
    Uncompressed,
    Padding,
    Crc,
}

/// The streaming Index validator.
#[derive(Debug)]
pub struct IndexHash {
    // Accumulated while blocks are decoded.
    records: u64,
    unpadded_sum: u64,
    uncompressed_sum: u64,
    index_size: u64,
    appended: RecordDigest,

    // State of the Index field parse.
    seq: Seq,
    parsed: RecordDigest,
    reader: VliReader,
    crc: Crc32,
    consumed: u64,
    remaining: u64,
    pending_unpadded: u64,
    crc_pos: usize,
    decoding: bool,
}

impl IndexHash {
    /// A fresh accumulator.
    pub fn new() -> Self {
        Self {
            records: 0,
            unpadded_sum: 0,
            uncompressed_sum: 0,
            // Indicator byte; the count VLI is added in index_size().
            index_size: 1,
            appended: RecordDigest::new(),
            seq: Seq::Indicator,
            parsed: RecordDigest::new(),
            reader: VliReader::new(),
            crc: Crc32::new(),
            consumed: 0,
            remaining: 0,
            pending_unpadded: 0,
            crc_pos: 0,
            decoding: false,
        }
    }

    /// Record one decoded block. Must not be called once Index parsing
    /// has started.
    pub fn append(&mut self, unpadded_size: u64, uncompressed_size: u64) -> Result<()> {
        if self.decoding {
            return Err(XzError::program("index hash appended during validation"));
        }
        if unpadded_size == 0 || unpadded_size > VLI_MAX {
            return Err(XzError::data("block unpadded size out of range"));
        }
        let unpadded_sum = self.unpadded_sum.checked_add(unpadded_size);
        let uncompressed_sum = self.uncompressed_sum.checked_add(uncompressed_size);
        match (unpadded_sum, uncompressed_sum) {
            (Some(u), Some(c)) if u <= VLI_MAX && c <= VLI_MAX => {
                self.unpadded_sum = u;
                self.uncompressed_sum = c;
            }
            _ => return Err(XzError::data("stream sizes overflow")),
        }

        self.records += 1;
        self.index_size += (vli_size(unpadded_size) + vli_size(uncompressed_size)) as u64;
        self.appended.push_values(unpadded_size, uncompressed_size);
        self.appended.push_encoded_values(unpadded_size, uncompressed_size);
        Ok(())
    }

    /// Number of blocks recorded so far.
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Sum of the uncompressed sizes recorded so far.
    pub fn uncompressed_sum(&self) -> u64 {
        self.uncompressed_sum
    }

    /// Expected size of the Index field for the records appended so far;
    /// this is what the Stream Footer's Backward Size must equal.
    pub fn index_size(&self) -> u64 {
        let body = self.index_size + vli_size(self.records) as u64;
        body.div_ceil(4) * 4 + 4
    }

    /// Feed Index bytes. Returns `true` once the whole field, CRC
    /// included, has been parsed and everything matched the appended
    /// records.
    pub fn decode(&mut self, input: &[u8], in_pos: &mut usize) -> Result<bool> {
        self.decoding = true;

        while *in_pos < input.len() {
            let byte = input[*in_pos];

            match self.seq {
                Seq::Indicator => {
                    if byte != INDEX_INDICATOR {
                        return Err(XzError::data("index indicator byte not found"));
                    }
                    self.advance(input, in_pos, 1);
                    self.seq = Seq::Count;
                }

                Seq::Count => {
                    self.advance(input, in_pos, 1);
                    if let Some(count) = self.reader.feed(&[byte], &mut 0)? {
                        if count != self.records {
                            return Err(XzError::data(
                                "index record count does not match the blocks",
                            ));
                        }
                        self.remaining = count;
                        self.seq = if count == 0 { Seq::Padding } else { Seq::Unpadded };
                    }
                }

                Seq::Unpadded => {
                    self.advance(input, in_pos, 1);
                    self.parsed.push_encoded_byte(byte);
                    if let Some(value) = self.reader.feed(&[byte], &mut 0)? {
                        if value == 0 || value > VLI_MAX {
                            return Err(XzError::data("index unpadded size out of range"));
                        }
                        self.pending_unpadded = value;
                        self.seq = Seq::Uncompressed;
                    }
                }

                Seq::Uncompressed => {
                    self.advance(input, in_pos, 1);
                    self.parsed.push_encoded_byte(byte);
                    if let Some(value) = self.reader.feed(&[byte], &mut 0)? {
                        self.parsed.push_values(self.pending_unpadded, value);
                        self.remaining -= 1;
                        self.seq = if self.remaining == 0 {
                            Seq::Padding
                        } else {
                            Seq::Unpadded
                        };
                    }
                }

                Seq::Padding => {
                    if self.consumed % 4 != 0 {
                        if byte != 0 {
                            return Err(XzError::data("non-zero padding in the index"));
                        }
                        self.advance(input, in_pos, 1);
                    } else {
                        // Padding complete; validate the digests before the
                        // CRC so corrupt records are reported as such.
                        if !self.parsed.matches(&self.appended) {
                            return Err(XzError::data(
                                "index does not match the decoded blocks",
                            ));
                        }
                        self.seq = Seq::Crc;
                    }
                }

                Seq::Crc => {
                    let expected = (self.crc.value() >> (8 * self.crc_pos as u32)) as u8;
                    if byte != expected {
                        return Err(XzError::data("index CRC32 mismatch"));
                    }
                    *in_pos += 1;
                    self.consumed += 1;
                    self.crc_pos += 1;
                    if self.crc_pos == 4 {
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Bytes of the Index field consumed so far by `decode`.
    pub fn decoded_size(&self) -> u64 {
        self.consumed
    }

    #[inline]
    fn advance(&mut self, input: &[u8], in_pos: &mut usize, n: usize) {
        self.crc.update(&input[*in_pos..*in_pos + n]);
        *in_pos += n;
        self.consumed += n as u64;
    }
}

impl Default for IndexHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    fn feed_all(hash: &mut IndexHash, data: &[u8]) -> Result<bool> {
        let mut pos = 0;
        let done = hash.decode(data, &mut pos)?;
        assert_eq!(pos, data.len());
        Ok(done)
    }

    #[test]
    fn test_validates_matching_index() {
        let pairs = [(22u64, 33u64), (44, 55), (66, 77)];

        let mut index = Index::new();
        let mut hash = IndexHash::new();
        for (unpadded, uncompressed) in pairs {
            index.push(unpadded, uncompressed).unwrap();
            hash.append(unpadded, uncompressed).unwrap();
        }

        let encoded = index.encode().unwrap();
        assert_eq!(hash.index_size(), encoded.len() as u64);
        assert!(feed_all(&mut hash, &encoded).unwrap());
        assert_eq!(hash.decoded_size(), encoded.len() as u64);
    }

    #[test]
    fn test_validates_byte_at_a_time() {
        let mut index = Index::new();
        let mut hash = IndexHash::new();
        for i in 1..20u64 {
            index.push(i * 13, i * 7).unwrap();
            hash.append(i * 13, i * 7).unwrap();
        }

        let encoded = index.encode().unwrap();
        let mut done = false;
        for chunk in encoded.chunks(1) {
            assert!(!done);
            let mut pos = 0;
            done = hash.decode(chunk, &mut pos).unwrap();
        }
        assert!(done);
    }

    #[test]
    fn test_record_count_mismatch() {
        let mut index = Index::new();
        index.push(100, 200).unwrap();
        index.push(300, 400).unwrap();
        let encoded = index.encode().unwrap();

        let mut hash = IndexHash::new();
        hash.append(100, 200).unwrap();
        assert!(feed_all(&mut hash, &encoded).is_err());
    }

    #[test]
    fn test_record_value_mismatch() {
        let mut index = Index::new();
        index.push(100, 200).unwrap();
        let encoded = index.encode().unwrap();

        let mut hash = IndexHash::new();
        hash.append(100, 201).unwrap();
        assert!(feed_all(&mut hash, &encoded).is_err());
    }

    #[test]
    fn test_empty_stream_index() {
        let index = Index::new();
        let mut hash = IndexHash::new();
        assert!(feed_all(&mut hash, &index.encode().unwrap()).unwrap());
        assert_eq!(hash.index_size(), 8);
    }

    #[test]
    fn test_corrupt_crc() {
        let mut index = Index::new();
        index.push(12, 34).unwrap();
        let mut encoded = index.encode().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 1;

        let mut hash = IndexHash::new();
        hash.append(12, 34).unwrap();
        assert!(feed_all(&mut hash, &encoded).is_err());
    }

    #[test]
    fn test_append_overflow() {
        let mut hash = IndexHash::new();
        hash.append(VLI_MAX - 10, 5).unwrap();
        assert!(hash.append(100, 5).is_err());
    }
}
