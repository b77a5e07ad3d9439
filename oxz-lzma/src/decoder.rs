//! The LZMA symbol decoder.
//!
//! Decodes one fully buffered compressed chunk at a time into a ring
//! dictionary, which is how the LZMA2 layer drives it: chunk sizes are
//! declared in the chunk header, so the input of a single decode call is
//! always complete. The probability model lives outside the call and is
//! preserved across chunks unless the chunk header asks for a reset.

use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;

use crate::model::{
    ALIGN_BITS, DIST_MODEL_END, DIST_MODEL_START, DIST_SLOT_BITS, DistanceModel, LEN_HIGH_BITS,
    LEN_LOW_BITS, LEN_LOW_SYMBOLS, LEN_MID_BITS, LEN_MID_SYMBOLS, LengthModel, LzmaModel,
    MATCH_LEN_MIN, dist_state,
};
use crate::range_coder::RangeDecoder;

/// How a chunk decode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEnd {
    /// The declared uncompressed size was produced.
    Limit,
    /// The end-of-payload marker was decoded.
    Marker,
}

/// Ring dictionary holding the most recent `size` bytes of output.
#[derive(Debug)]
pub struct DecoderDict {
    buf: Vec<u8>,
    pos: usize,
    full: bool,
    total: u64,
}

impl DecoderDict {
    /// Allocate a dictionary, claiming the buffer against an optional
    /// memory limit first.
    pub fn new(size: u32, mem: Option<&mut MemLimit>) -> Result<Self> {
        let size = size.max(4096) as usize;
        if let Some(mem) = mem {
            mem.claim(size as u64)?;
        }
        Ok(Self {
            buf: vec![0; size],
            pos: 0,
            full: false,
            total: 0,
        })
    }

    /// Forget all history, as a LZMA2 dictionary reset does.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.full = false;
        self.total = 0;
    }

    /// Uncompressed bytes produced since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes of history currently available.
    pub fn history(&self) -> usize {
        if self.full { self.buf.len() } else { self.pos }
    }

    /// The byte `dist + 1` positions back; `dist` must be within history.
    #[inline]
    fn byte_back(&self, dist: u32) -> u8 {
        let dist = dist as usize;
        let idx = if self.pos > dist {
            self.pos - dist - 1
        } else {
            self.buf.len() - (dist - self.pos) - 1
        };
        self.buf[idx]
    }

    #[inline]
    fn push(&mut self, byte: u8, out: &mut Vec<u8>) {
        self.buf[self.pos] = byte;
        self.pos += 1;
        if self.pos == self.buf.len() {
            self.pos = 0;
            self.full = true;
        }
        self.total += 1;
        out.push(byte);
    }

    /// Append raw bytes (an uncompressed LZMA2 chunk) to the history.
    pub fn extend(&mut self, data: &[u8], out: &mut Vec<u8>) {
        for &byte in data {
            self.push(byte, out);
        }
    }
}

fn decode_len(
    rc: &mut RangeDecoder<'_>,
    model: &mut LengthModel,
    pos_state: usize,
) -> Result<usize> {
    let len = if rc.decode_bit(&mut model.choice)? == 0 {
        rc.decode_bittree(&mut model.low[pos_state], LEN_LOW_BITS)? as usize
    } else if rc.decode_bit(&mut model.choice2)? == 0 {
        LEN_LOW_SYMBOLS + rc.decode_bittree(&mut model.mid[pos_state], LEN_MID_BITS)? as usize
    } else {
        LEN_LOW_SYMBOLS
            + LEN_MID_SYMBOLS
            + rc.decode_bittree(&mut model.high, LEN_HIGH_BITS)? as usize
    };
    Ok(len + MATCH_LEN_MIN)
}

fn decode_dist(rc: &mut RangeDecoder<'_>, model: &mut LzmaModel, len: usize) -> Result<u32> {
    let slot = rc.decode_bittree(&mut model.dist.slot[dist_state(len)], DIST_SLOT_BITS)?;
    if slot < DIST_MODEL_START {
        return Ok(slot);
    }

    let footer_bits = (slot >> 1) - 1;
    let mut dist = (2 | (slot & 1)) << footer_bits;

    if slot < DIST_MODEL_END {
        let mut node = 1u32;
        let mut low = 0u32;
        for i in 0..footer_bits {
            let idx = DistanceModel::special_index(slot, node);
            let bit = rc.decode_bit(&mut model.dist.special[idx])?;
            node = (node << 1) + bit;
            low |= bit << i;
        }
        dist += low;
    } else {
        let direct = rc.decode_direct_bits(footer_bits - ALIGN_BITS)?;
        dist = dist.wrapping_add(direct << ALIGN_BITS);
        dist = dist.wrapping_add(rc.decode_bittree_reverse(&mut model.dist.align, ALIGN_BITS)?);
    }

    Ok(dist)
}

fn decode_literal(
    rc: &mut RangeDecoder<'_>,
    model: &mut LzmaModel,
    dict: &DecoderDict,
) -> Result<u8> {
    let prev = if dict.total == 0 { 0 } else { dict.byte_back(0) };
    let coder = model.props.literal_index(dict.total, prev);
    let probs = &mut model.literal[coder];

    let symbol = if model.state.is_literal() {
        let mut symbol = 1usize;
        while symbol < 0x100 {
            let bit = rc.decode_bit(&mut probs[symbol])?;
            symbol = (symbol << 1) | bit as usize;
        }
        symbol
    } else {
        // After a match the literal is coded against the byte the match
        // would have continued with; once they diverge the plain tree
        // takes over.
        let mut match_byte = usize::from(dict.byte_back(model.reps[0])) << 1;
        let mut symbol = 1usize;
        loop {
            let match_bit = match_byte & 0x100;
            match_byte <<= 1;
            let bit = rc.decode_bit(&mut probs[0x100 + match_bit + symbol])? as usize;
            symbol = (symbol << 1) | bit;
            if symbol >= 0x100 {
                break;
            }
            if match_bit != bit << 8 {
                while symbol < 0x100 {
                    let bit = rc.decode_bit(&mut probs[symbol])?;
                    symbol = (symbol << 1) | bit as usize;
                }
                break;
            }
        }
        symbol
    };

    Ok((symbol - 0x100) as u8)
}

/// Decode one compressed chunk.
///
/// Produces exactly `limit` bytes into `out` (and the dictionary), unless
/// `allow_marker` is set and the end-of-payload marker terminates the
/// stream early. The whole compressed chunk must be consumed precisely.
pub fn decode_chunk(
    model: &mut LzmaModel,
    dict: &mut DecoderDict,
    input: &[u8],
    out: &mut Vec<u8>,
    limit: usize,
    allow_marker: bool,
) -> Result<ChunkEnd> {
    let mut rc = RangeDecoder::new(input)?;
    let pos_mask = model.props.pos_mask();
    let mut produced = 0usize;

    while produced < limit {
        let pos_state = (dict.total & pos_mask) as usize;
        let state_idx = model.state.index();

        if rc.decode_bit(&mut model.is_match[state_idx][pos_state])? == 0 {
            let byte = decode_literal(&mut rc, model, dict)?;
            dict.push(byte, out);
            model.state.update_literal();
            produced += 1;
            continue;
        }

        let len;
        if rc.decode_bit(&mut model.is_rep[state_idx])? == 0 {
            // New match: length, then distance.
            len = decode_len(&mut rc, &mut model.match_len, pos_state)?;
            let dist = decode_dist(&mut rc, model, len)?;

            if dist == u32::MAX {
                return if allow_marker {
                    if !rc.is_finished() {
                        Err(XzError::data("garbage after the end-of-payload marker"))
                    } else {
                        Ok(ChunkEnd::Marker)
                    }
                } else {
                    Err(XzError::data(
                        "end-of-payload marker inside a sized chunk",
                    ))
                };
            }

            model.reps = [dist, model.reps[0], model.reps[1], model.reps[2]];
            model.state.update_match();
        } else {
            // Repeat match: pick one of the cached distances.
            if rc.decode_bit(&mut model.is_rep0[state_idx])? == 0 {
                if rc.decode_bit(&mut model.is_rep0_long[state_idx][pos_state])? == 0 {
                    // One-byte repeat of the most recent distance.
                    if u64::from(model.reps[0]) >= dict.total
                        || model.reps[0] as usize >= dict.history()
                    {
                        return Err(XzError::data("repeat distance past the dictionary"));
                    }
                    let byte = dict.byte_back(model.reps[0]);
                    dict.push(byte, out);
                    model.state.update_short_rep();
                    produced += 1;
                    continue;
                }
            } else {
                let dist;
                if rc.decode_bit(&mut model.is_rep1[state_idx])? == 0 {
                    dist = model.reps[1];
                } else if rc.decode_bit(&mut model.is_rep2[state_idx])? == 0 {
                    dist = model.reps[2];
                    model.reps[2] = model.reps[1];
                } else {
                    dist = model.reps[3];
                    model.reps[3] = model.reps[2];
                    model.reps[2] = model.reps[1];
                }
                model.reps[1] = model.reps[0];
                model.reps[0] = dist;
            }

            len = decode_len(&mut rc, &mut model.rep_len, pos_state)?;
            model.state.update_rep();
        }

        let dist = model.reps[0];
        if u64::from(dist) >= dict.total || dist as usize >= dict.history() {
            return Err(XzError::data("match distance past the dictionary"));
        }
        if produced + len > limit {
            return Err(XzError::data("match overruns the declared chunk size"));
        }
        for _ in 0..len {
            let byte = dict.byte_back(dist);
            dict.push(byte, out);
        }
        produced += len;
    }

    if !rc.is_finished() {
        return Err(XzError::data("compressed chunk not fully consumed"));
    }
    Ok(ChunkEnd::Limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_ring_wraps() {
        let mut dict = DecoderDict::new(4096, None).unwrap();
        let mut out = Vec::new();

        for i in 0..5000u32 {
            dict.push((i % 251) as u8, &mut out);
        }
        assert_eq!(dict.total(), 5000);
        assert_eq!(dict.history(), 4096);

        // byte_back(0) is the most recent byte.
        assert_eq!(dict.byte_back(0), (4999 % 251) as u8);
        assert_eq!(dict.byte_back(100), (4899 % 251) as u8);
        assert_eq!(dict.byte_back(4095), (904 % 251) as u8);
    }

    #[test]
    fn test_dict_reset() {
        let mut dict = DecoderDict::new(4096, None).unwrap();
        let mut out = Vec::new();
        dict.extend(b"hello", &mut out);
        assert_eq!(dict.total(), 5);

        dict.reset();
        assert_eq!(dict.total(), 0);
        assert_eq!(dict.history(), 0);
    }

    #[test]
    fn test_dict_memlimit() {
        let mut mem = oxz_core::mem::MemLimit::new(1024);
        // A dictionary far beyond the budget is refused outright.
        assert!(DecoderDict::new(1 << 20, Some(&mut mem)).is_err());
    }

    #[test]
    fn test_truncated_chunk_is_data_error() {
        let mut model = LzmaModel::new(Default::default());
        let mut dict = DecoderDict::new(4096, None).unwrap();
        let mut out = Vec::new();

        let err = decode_chunk(&mut model, &mut dict, &[0, 1, 2], &mut out, 4, false);
        assert!(matches!(err, Err(XzError::Data { .. })));
    }
}
