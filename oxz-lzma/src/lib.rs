//! # oxz lzma
//!
//! Pure Rust LZMA/LZMA2 codec for the oxz compression stack.
//!
//! The crate is layered the way the algorithm is:
//!
//! - [`range_coder`]: adaptive binary arithmetic coding and the price table
//! - [`model`]: the probability context tree shared by both directions
//! - [`window`]: the sliding input window and the HC3/HC4/BT2/BT3/BT4
//!   match finders
//! - [`encoder`] and [`optimal`]: symbol emission with greedy and
//!   price-optimal parsing
//! - [`decoder`]: symbol decoding into a ring dictionary
//! - [`lzma2`]: the chunked streaming layer used by the container
//! - [`micro`]: the compact single-shot frame for size-tracking callers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod encoder;
pub mod lzma2;
pub mod micro;
pub mod model;
pub mod optimal;
pub mod range_coder;
pub mod window;

// Re-exports
pub use encoder::{LzmaEncoder, Mode};
pub use lzma2::{
    CHUNK_COMP_MAX, CHUNK_UNCOMP_MAX, Lzma2Decoder, Lzma2Encoder, dict_size_from_props,
    props_from_dict_size,
};
pub use micro::{micro_decode, micro_encode};
pub use model::{LzmaProps, MATCH_LEN_MAX, MATCH_LEN_MIN};
pub use window::{MatchFinder, MfKind};

use oxz_core::coder::code_all;
use oxz_core::error::{Result, XzError};

/// Smallest supported dictionary.
pub const DICT_SIZE_MIN: u32 = 4096;

/// Largest supported dictionary (1.5 GiB).
pub const DICT_SIZE_MAX: u32 = (1 << 30) + (1 << 29);

/// Everything the LZMA2 encoder needs to know, equivalent to the classic
/// option struct that presets map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaOptions {
    /// Dictionary (history window) size in bytes.
    pub dict_size: u32,
    /// Literal context bits.
    pub lc: u32,
    /// Literal position bits.
    pub lp: u32,
    /// Position bits.
    pub pb: u32,
    /// Parser mode.
    pub mode: Mode,
    /// Match length that stops the search early.
    pub nice_len: u32,
    /// Match finder flavour.
    pub mf: MfKind,
    /// Chain/tree walk budget; zero selects the default for the finder.
    pub depth: u32,
}

impl LzmaOptions {
    /// Options for a compression preset, 0 (fastest) to 9 (strongest).
    pub fn preset(level: u32) -> Self {
        let level = level.min(9);
        let (dict_size, mode, nice_len, mf, depth) = match level {
            0 => (1 << 18, Mode::Fast, 32, MfKind::Hc3, 4),
            1 => (1 << 20, Mode::Fast, 32, MfKind::Hc4, 8),
            2 => (1 << 21, Mode::Fast, 32, MfKind::Hc4, 24),
            3 => (1 << 22, Mode::Fast, 48, MfKind::Hc4, 48),
            4 => (1 << 22, Mode::Normal, 16, MfKind::Bt4, 0),
            5 => (1 << 23, Mode::Normal, 32, MfKind::Bt4, 0),
            6 => (1 << 23, Mode::Normal, 64, MfKind::Bt4, 0),
            7 => (1 << 24, Mode::Normal, 64, MfKind::Bt4, 0),
            8 => (1 << 25, Mode::Normal, 64, MfKind::Bt4, 0),
            _ => (1 << 26, Mode::Normal, 64, MfKind::Bt4, 0),
        };
        Self {
            dict_size,
            lc: 3,
            lp: 0,
            pb: 2,
            mode,
            nice_len,
            mf,
            depth,
        }
    }

    /// Check every field against the supported ranges.
    pub fn validate(&self) -> Result<()> {
        if !(DICT_SIZE_MIN..=DICT_SIZE_MAX).contains(&self.dict_size) {
            return Err(XzError::options("dictionary size out of range"));
        }
        if LzmaProps::new(self.lc, self.lp, self.pb).is_none() {
            return Err(XzError::options("invalid lc/lp/pb combination"));
        }
        if !(8..=MATCH_LEN_MAX as u32).contains(&self.nice_len) {
            return Err(XzError::options("nice length out of range"));
        }
        Ok(())
    }

    /// Bytes of memory the LZMA2 encoder will allocate for these options.
    pub fn encoder_memusage(&self) -> u64 {
        MatchFinder::memusage(self.mf, self.dict_size, self.nice_len)
            // Probability model, chunk buffers and bookkeeping.
            + (64 << 10)
    }

    /// Bytes of memory a decoder needs for a dictionary of `dict_size`.
    pub fn decoder_memusage(dict_size: u32) -> u64 {
        u64::from(dict_size.max(DICT_SIZE_MIN)) + (64 << 10)
    }
}

impl Default for LzmaOptions {
    fn default() -> Self {
        Self::preset(6)
    }
}

/// Compress a whole buffer into a raw LZMA2 chunk stream.
pub fn lzma2_compress(data: &[u8], options: &LzmaOptions) -> Result<Vec<u8>> {
    let mut encoder = Lzma2Encoder::new(options, None)?;
    code_all(&mut encoder, data)
}

/// Decompress a whole raw LZMA2 chunk stream.
pub fn lzma2_decompress(data: &[u8], dict_size: u32) -> Result<Vec<u8>> {
    let mut decoder = Lzma2Decoder::new(dict_size, None)?;
    code_all(&mut decoder, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for level in 0..=9 {
            LzmaOptions::preset(level).validate().unwrap();
        }
        assert_eq!(LzmaOptions::preset(99), LzmaOptions::preset(9));
    }

    #[test]
    fn test_preset_progression() {
        // Dictionaries grow with the level and parsing gets stronger.
        assert!(LzmaOptions::preset(0).dict_size < LzmaOptions::preset(9).dict_size);
        assert_eq!(LzmaOptions::preset(1).mode, Mode::Fast);
        assert_eq!(LzmaOptions::preset(9).mode, Mode::Normal);
        assert_eq!(LzmaOptions::preset(9).mf, MfKind::Bt4);
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        let mut options = LzmaOptions::preset(1);
        options.dict_size = 100;
        assert!(options.validate().is_err());

        let mut options = LzmaOptions::preset(1);
        options.lc = 9;
        assert!(options.validate().is_err());

        let mut options = LzmaOptions::preset(1);
        options.nice_len = 4;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_whole_buffer_helpers() {
        let options = LzmaOptions {
            dict_size: 1 << 16,
            ..LzmaOptions::preset(1)
        };
        let data = b"whole buffer helper roundtrip ".repeat(100);
        let compressed = lzma2_compress(&data, &options).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(lzma2_decompress(&compressed, 1 << 16).unwrap(), data);
    }

    #[test]
    fn test_encoder_memusage_scales_with_dict() {
        let small = LzmaOptions {
            dict_size: 1 << 16,
            ..LzmaOptions::preset(6)
        };
        let big = LzmaOptions {
            dict_size: 1 << 24,
            ..LzmaOptions::preset(6)
        };
        assert!(big.encoder_memusage() > small.encoder_memusage());
        assert!(small.encoder_memusage() > u64::from(small.dict_size));
    }
}
