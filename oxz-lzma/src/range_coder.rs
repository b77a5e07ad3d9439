//! The binary range coder.
//!
//! LZMA's entropy layer codes single bits against adaptive 11-bit
//! probabilities. The encoder keeps a 33-bit `low` accumulator whose carry
//! propagates through a cache of pending 0xFF bytes; the decoder mirrors the
//! arithmetic with a `code` register primed from the first five input bytes.
//! Normalization keeps `range` above 2^24 by shifting one byte at a time, so
//! the streams are byte-aligned and big-endian within the arithmetic.
//!
//! The encoder side also carries the price table: a 128-entry map from
//! quantized probability to bit cost in 1/16 bit units, used by the optimal
//! parser to compare candidate encodings without running the coder.

use oxz_core::error::{Result, XzError};

/// Number of bits in a probability value.
pub const PROB_BITS: u32 = 11;

/// A probability of exactly one half.
pub const PROB_INIT: u16 = (1 << PROB_BITS) / 2;

/// Upper bound (exclusive) of probability values.
pub const BIT_MODEL_TOTAL: u32 = 1 << PROB_BITS;

/// Adaptation shift: how fast probabilities move toward the coded bit.
pub const MOVE_BITS: u32 = 5;

/// Normalization threshold for the range register.
const TOP: u32 = 1 << 24;

/// Quantization shift for the price table.
const MOVE_REDUCING_BITS: u32 = 4;

/// Prices are expressed in 1/16 bit units.
pub const BIT_PRICE_SHIFT_BITS: u32 = 4;

/// A price no real encoding can reach.
pub const INFINITY_PRICE: u32 = 1 << 30;

/// Price of coding `bit` against a probability in the given quantization
/// bucket, in 1/16 bit units. Generated from -log2 of the bucket midpoint.
const PRICES: [u8; (BIT_MODEL_TOTAL >> MOVE_REDUCING_BITS) as usize] = {
    let mut prices = [0u8; (BIT_MODEL_TOTAL >> MOVE_REDUCING_BITS) as usize];
    let step = 1u32 << MOVE_REDUCING_BITS;
    let mut i = step / 2;
    while i < BIT_MODEL_TOTAL {
        // Squaring the scaled probability BIT_PRICE_SHIFT_BITS times and
        // counting the shifts needed to keep it bounded yields floor(-log2)
        // at 1/16 bit precision.
        let mut w = i;
        let mut bit_count = 0u32;
        let mut j = 0;
        while j < BIT_PRICE_SHIFT_BITS {
            w *= w;
            bit_count <<= 1;
            while w >= 1 << 16 {
                w >>= 1;
                bit_count += 1;
            }
            j += 1;
        }
        prices[(i >> MOVE_REDUCING_BITS) as usize] =
            ((PROB_BITS << BIT_PRICE_SHIFT_BITS) - 15 - bit_count) as u8;
        i += step;
    }
    prices
};

/// Price of coding `bit` with probability `prob`.
#[inline]
pub fn bit_price(prob: u16, bit: u32) -> u32 {
    let p = u32::from(prob) ^ (0u32.wrapping_sub(bit) & (BIT_MODEL_TOTAL - 1));
    u32::from(PRICES[(p >> MOVE_REDUCING_BITS) as usize])
}

/// Price of coding a zero bit with probability `prob`.
#[inline]
pub fn bit_0_price(prob: u16) -> u32 {
    u32::from(PRICES[(u32::from(prob) >> MOVE_REDUCING_BITS) as usize])
}

/// Price of coding a one bit with probability `prob`.
#[inline]
pub fn bit_1_price(prob: u16) -> u32 {
    u32::from(PRICES[((u32::from(prob) ^ (BIT_MODEL_TOTAL - 1)) >> MOVE_REDUCING_BITS) as usize])
}

/// Price of a symbol coded through a bit tree, most significant bit first.
#[inline]
pub fn bittree_price(probs: &[u16], bit_levels: u32, symbol: u32) -> u32 {
    let mut price = 0;
    let mut symbol = symbol + (1 << bit_levels);
    while symbol != 1 {
        let bit = symbol & 1;
        symbol >>= 1;
        price += bit_price(probs[symbol as usize], bit);
    }
    price
}

/// Price of a symbol coded through a reverse bit tree.
#[inline]
pub fn bittree_reverse_price(probs: &[u16], bit_levels: u32, symbol: u32) -> u32 {
    let mut price = 0;
    let mut symbol = symbol;
    let mut index = 1usize;
    for _ in 0..bit_levels {
        let bit = symbol & 1;
        symbol >>= 1;
        price += bit_price(probs[index], bit);
        index = (index << 1) + bit as usize;
    }
    price
}

/// Price of `bits` bits coded without a probability model.
#[inline]
pub fn direct_price(bits: u32) -> u32 {
    bits << BIT_PRICE_SHIFT_BITS
}

/// The range encoder. Output accumulates in an internal buffer that the
/// LZMA2 layer drains once per chunk.
#[derive(Debug, Clone)]
pub struct RangeEncoder {
    low: u64,
    cache_size: u64,
    range: u32,
    cache: u8,
    out: Vec<u8>,
}

impl RangeEncoder {
    /// Create an encoder with `capacity` bytes of output reserved up front.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            low: 0,
            cache_size: 1,
            range: u32::MAX,
            cache: 0,
            out: Vec::with_capacity(capacity),
        }
    }

    /// Reset the arithmetic state, keeping the output buffer's capacity.
    pub fn reset(&mut self) {
        self.low = 0;
        self.cache_size = 1;
        self.range = u32::MAX;
        self.cache = 0;
        self.out.clear();
    }

    /// Bytes already emitted into the output buffer.
    pub fn out_len(&self) -> usize {
        self.out.len()
    }

    /// Upper bound on the total output length if the stream were flushed
    /// now. Used by the chunking layer to stop before a chunk overflows.
    pub fn pending_len(&self) -> usize {
        self.out.len() + self.cache_size as usize + 5
    }

    fn shift_low(&mut self) {
        if self.low < 0xFF00_0000 || self.low > 0xFFFF_FFFF {
            let carry = (self.low >> 32) as u8;
            let mut byte = self.cache;
            loop {
                self.out.push(byte.wrapping_add(carry));
                byte = 0xFF;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = (self.low >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = (self.low << 8) & 0xFFFF_FFFF;
    }

    #[inline]
    fn normalize(&mut self) {
        if self.range < TOP {
            self.range <<= 8;
            self.shift_low();
        }
    }

    /// Code one bit against an adaptive probability.
    #[inline]
    pub fn encode_bit(&mut self, prob: &mut u16, bit: u32) {
        let bound = (self.range >> PROB_BITS) * u32::from(*prob);
        if bit == 0 {
            self.range = bound;
            *prob += ((BIT_MODEL_TOTAL as u16) - *prob) >> MOVE_BITS;
        } else {
            self.low += u64::from(bound);
            self.range -= bound;
            *prob -= *prob >> MOVE_BITS;
        }
        self.normalize();
    }

    /// Code `count` bits of `value` without a probability model, most
    /// significant bit first.
    pub fn encode_direct_bits(&mut self, value: u32, count: u32) {
        for i in (0..count).rev() {
            self.range >>= 1;
            if (value >> i) & 1 != 0 {
                self.low += u64::from(self.range);
            }
            self.normalize();
        }
    }

    /// Code a symbol through a bit tree, most significant bit first.
    pub fn encode_bittree(&mut self, probs: &mut [u16], bit_levels: u32, symbol: u32) {
        let mut index = 1usize;
        for i in (0..bit_levels).rev() {
            let bit = (symbol >> i) & 1;
            self.encode_bit(&mut probs[index], bit);
            index = (index << 1) | bit as usize;
        }
    }

    /// Code a symbol through a reverse bit tree.
    pub fn encode_bittree_reverse(&mut self, probs: &mut [u16], bit_levels: u32, symbol: u32) {
        let mut index = 1usize;
        let mut symbol = symbol;
        for _ in 0..bit_levels {
            let bit = symbol & 1;
            symbol >>= 1;
            self.encode_bit(&mut probs[index], bit);
            index = (index << 1) | bit as usize;
        }
    }

    /// Flush the accumulator and hand out the finished byte stream,
    /// leaving the encoder reset for the next chunk.
    pub fn finish(&mut self) -> Vec<u8> {
        for _ in 0..5 {
            self.shift_low();
        }
        let out = std::mem::take(&mut self.out);
        self.reset();
        out
    }
}

/// The range decoder, reading from a fully buffered compressed chunk.
#[derive(Debug)]
pub struct RangeDecoder<'a> {
    input: &'a [u8],
    pos: usize,
    range: u32,
    code: u32,
}

impl<'a> RangeDecoder<'a> {
    /// Prime a decoder from the start of a compressed chunk. The first byte
    /// must be zero; the next four big-endian bytes fill the code register.
    pub fn new(input: &'a [u8]) -> Result<Self> {
        if input.len() < 5 {
            return Err(XzError::data("compressed chunk shorter than five bytes"));
        }
        if input[0] != 0 {
            return Err(XzError::data("invalid first byte of a compressed chunk"));
        }
        let code = u32::from_be_bytes([input[1], input[2], input[3], input[4]]);
        Ok(Self {
            input,
            pos: 5,
            range: u32::MAX,
            code,
        })
    }

    #[inline]
    fn normalize(&mut self) -> Result<()> {
        if self.range < TOP {
            let byte = *self
                .input
                .get(self.pos)
                .ok_or_else(|| XzError::data("compressed chunk ended unexpectedly"))?;
            self.pos += 1;
            self.range <<= 8;
            self.code = (self.code << 8) | u32::from(byte);
        }
        Ok(())
    }

    /// Decode one bit against an adaptive probability.
    #[inline]
    pub fn decode_bit(&mut self, prob: &mut u16) -> Result<u32> {
        self.normalize()?;
        let bound = (self.range >> PROB_BITS) * u32::from(*prob);
        if self.code < bound {
            self.range = bound;
            *prob += ((BIT_MODEL_TOTAL as u16) - *prob) >> MOVE_BITS;
            Ok(0)
        } else {
            self.range -= bound;
            self.code -= bound;
            *prob -= *prob >> MOVE_BITS;
            Ok(1)
        }
    }

    /// Decode `count` bits coded without a probability model.
    pub fn decode_direct_bits(&mut self, count: u32) -> Result<u32> {
        let mut result = 0u32;
        for _ in 0..count {
            self.normalize()?;
            self.range >>= 1;
            self.code = self.code.wrapping_sub(self.range);
            let bit = if (self.code as i32) < 0 {
                self.code = self.code.wrapping_add(self.range);
                0
            } else {
                1
            };
            result = (result << 1) | bit;
        }
        Ok(result)
    }

    /// Decode a symbol from a bit tree, most significant bit first.
    pub fn decode_bittree(&mut self, probs: &mut [u16], bit_levels: u32) -> Result<u32> {
        let mut index = 1usize;
        for _ in 0..bit_levels {
            let bit = self.decode_bit(&mut probs[index])?;
            index = (index << 1) | bit as usize;
        }
        Ok(index as u32 - (1 << bit_levels))
    }

    /// Decode a symbol from a reverse bit tree.
    pub fn decode_bittree_reverse(&mut self, probs: &mut [u16], bit_levels: u32) -> Result<u32> {
        let mut index = 1usize;
        let mut result = 0u32;
        for i in 0..bit_levels {
            let bit = self.decode_bit(&mut probs[index])?;
            index = (index << 1) | bit as usize;
            result |= bit << i;
        }
        Ok(result)
    }

    /// Whether every input byte has been consumed. The encoder's final
    /// flush emits the whole accumulator, so a correct stream is fully
    /// consumed exactly when the last symbol has been decoded.
    pub fn is_finished(&self) -> bool {
        self.pos == self.input.len()
    }

    /// Bytes consumed so far, including the five priming bytes.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_table_shape() {
        // Certain bits are nearly free, coin flips cost almost one bit.
        assert!(bit_0_price(PROB_INIT) >= 15 && bit_0_price(PROB_INIT) <= 17);
        assert!(bit_0_price(2000) < bit_0_price(100));
        assert_eq!(bit_price(PROB_INIT, 0), bit_price(PROB_INIT, 1));
        assert_eq!(direct_price(10), 10 << BIT_PRICE_SHIFT_BITS);
    }

    #[test]
    fn test_bit_roundtrip() {
        let bits: Vec<u32> = (0..1000).map(|i| (i * 7 / 3) & 1).collect();

        let mut enc = RangeEncoder::with_capacity(1 << 12);
        let mut prob = PROB_INIT;
        for &bit in &bits {
            enc.encode_bit(&mut prob, bit);
        }
        let data = enc.finish();

        let mut dec = RangeDecoder::new(&data).unwrap();
        let mut prob = PROB_INIT;
        for &bit in &bits {
            assert_eq!(dec.decode_bit(&mut prob).unwrap(), bit);
        }
        assert!(dec.is_finished());
    }

    #[test]
    fn test_direct_bits_roundtrip() {
        let values = [0u32, 1, 0xFF, 0x1234, 0xFFFF_FFFF, 0x8000_0000];

        let mut enc = RangeEncoder::with_capacity(64);
        for &v in &values {
            enc.encode_direct_bits(v, 32);
        }
        let data = enc.finish();

        let mut dec = RangeDecoder::new(&data).unwrap();
        for &v in &values {
            assert_eq!(dec.decode_direct_bits(32).unwrap(), v);
        }
        assert!(dec.is_finished());
    }

    #[test]
    fn test_bittree_roundtrip() {
        let mut enc = RangeEncoder::with_capacity(256);
        let mut probs = [PROB_INIT; 64];
        let mut rprobs = [PROB_INIT; 16];
        for symbol in 0..64 {
            enc.encode_bittree(&mut probs, 6, symbol);
            enc.encode_bittree_reverse(&mut rprobs, 4, symbol & 15);
        }
        let data = enc.finish();

        let mut dec = RangeDecoder::new(&data).unwrap();
        let mut probs = [PROB_INIT; 64];
        let mut rprobs = [PROB_INIT; 16];
        for symbol in 0..64 {
            assert_eq!(dec.decode_bittree(&mut probs, 6).unwrap(), symbol);
            assert_eq!(
                dec.decode_bittree_reverse(&mut rprobs, 4).unwrap(),
                symbol & 15
            );
        }
        assert!(dec.is_finished());
    }

    #[test]
    fn test_carry_propagation() {
        // A long run of one bits at high probability of zero produces 0xFF
        // cache runs in the encoder; the decoder must still agree.
        let mut enc = RangeEncoder::with_capacity(1 << 12);
        let mut prob = 2040u16;
        for _ in 0..4096 {
            enc.encode_bit(&mut prob, 1);
            prob = 2040;
        }
        let data = enc.finish();

        let mut dec = RangeDecoder::new(&data).unwrap();
        let mut prob = 2040u16;
        for _ in 0..4096 {
            assert_eq!(dec.decode_bit(&mut prob).unwrap(), 1);
            prob = 2040;
        }
        assert!(dec.is_finished());
    }

    #[test]
    fn test_first_byte_is_zero() {
        let mut enc = RangeEncoder::with_capacity(16);
        let mut prob = PROB_INIT;
        enc.encode_bit(&mut prob, 1);
        let data = enc.finish();
        assert_eq!(data[0], 0);
    }

    #[test]
    fn test_bittree_price_matches_direction() {
        // The price helper must agree with the actual coded length to
        // within rounding: total predicted price of random symbols should
        // approximate 8 * bytes of output within a small factor.
        let symbols: Vec<u32> = (0..512).map(|i| (i * 37) % 64).collect();

        let mut probs = [PROB_INIT; 64];
        let mut predicted = 0u32;
        let mut enc = RangeEncoder::with_capacity(1 << 12);
        for &s in &symbols {
            predicted += bittree_price(&probs, 6, s);
            enc.encode_bittree(&mut probs, 6, s);
        }
        let actual_bits = (enc.finish().len() as u32) * 8;
        let predicted_bits = predicted >> BIT_PRICE_SHIFT_BITS;

        let diff = predicted_bits.abs_diff(actual_bits);
        assert!(
            diff < actual_bits / 8 + 64,
            "price model too far off: predicted {predicted_bits}, actual {actual_bits}"
        );
    }
}
