//! The compact single-shot framing.
//!
//! For callers that track sizes themselves (filesystems, firmware blobs),
//! the full container is overhead. This framing is a raw LZMA stream with
//! one twist: the first byte of range-coder output is always zero, so it is
//! overwritten with the bitwise negation of the properties byte. That keeps
//! the frame self-describing at zero cost and makes it impossible to
//! confuse with the classic `.lzma` header, whose first byte is the plain
//! properties value.

use oxz_core::error::{Result, XzError};

use crate::LzmaOptions;
use crate::decoder::{DecoderDict, decode_chunk};
use crate::encoder::LzmaEncoder;
use crate::model::{LzmaModel, LzmaProps};
use crate::range_coder::RangeEncoder;
use crate::window::MatchFinder;

/// Compress `data` into the compact frame.
pub fn micro_encode(data: &[u8], options: &LzmaOptions) -> Result<Vec<u8>> {
    options.validate()?;
    let props = LzmaProps::new(options.lc, options.lp, options.pb)
        .ok_or_else(|| XzError::options("invalid lc/lp/pb combination"))?;

    let mut enc = LzmaEncoder::new(props, options.mode, options.nice_len);
    let mut mf = MatchFinder::new(
        options.mf,
        options.dict_size,
        options.nice_len,
        options.depth,
        None,
    )?;
    let mut rc = RangeEncoder::with_capacity(data.len() / 2 + 64);

    let mut fed = 0usize;
    loop {
        if mf.can_encode() {
            enc.encode_one(&mut mf, &mut rc);
        } else if fed < data.len() {
            let n = (data.len() - fed).min(1 << 16);
            fed += mf.fill(&data[fed..fed + n], fed + n == data.len());
        } else if !mf.is_drained() {
            mf.fill(&[], true);
        } else {
            break;
        }
    }

    let mut out = rc.finish();
    out[0] = !props.to_byte();
    Ok(out)
}

/// Decompress a compact frame of known uncompressed size.
pub fn micro_decode(data: &[u8], uncomp_size: usize) -> Result<Vec<u8>> {
    if data.len() < 5 {
        return Err(XzError::data("frame shorter than the coder preamble"));
    }

    let props = LzmaProps::from_byte(!data[0])
        .ok_or_else(|| XzError::options("invalid properties in the frame byte"))?;

    // Restore the zero byte the encoder overwrote.
    let mut buf = data.to_vec();
    buf[0] = 0;

    let mut model = LzmaModel::new(props);
    let mut dict = DecoderDict::new(uncomp_size.max(4096).min(u32::MAX as usize) as u32, None)?;
    let mut out = Vec::with_capacity(uncomp_size);
    decode_chunk(&mut model, &mut dict, &buf, &mut out, uncomp_size, false)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_world_frame() {
        let data = b"\x48\x65\x6C\x6C\x6F\x0A\x57\x6F\x72\x6C\x64\x0A";
        let options = LzmaOptions::default();
        let frame = micro_encode(data, &options).unwrap();

        // Compact: twelve bytes of text must stay within 32 bytes framed.
        assert!(frame.len() <= 32, "frame is {} bytes", frame.len());

        // First byte is the negated properties (pb * 45 + lp * 9 + lc).
        let props = (options.pb * 45 + options.lp * 9 + options.lc) as u8;
        assert_eq!(frame[0], !props);

        let decoded = micro_decode(&frame, data.len()).unwrap();
        assert_eq!(&decoded, data);
    }

    #[test]
    fn test_roundtrip_various_inputs() {
        let options = LzmaOptions::default();
        for data in [
            &b""[..],
            &b"a"[..],
            &b"abcabcabcabc"[..],
            &[0u8; 4096][..],
        ] {
            let frame = micro_encode(data, &options).unwrap();
            assert_eq!(micro_decode(&frame, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn test_first_byte_never_zero_for_default_props() {
        let frame = micro_encode(b"xyz", &LzmaOptions::default()).unwrap();
        assert_ne!(frame[0], 0);
    }

    #[test]
    fn test_bad_props_rejected() {
        // A frame byte of 0x00 negates to 0xFF, which is not a valid
        // properties value.
        let bad = [0x00u8, 0, 0, 0, 0];
        assert!(micro_decode(&bad, 0).is_err());
    }

    #[test]
    fn test_truncated_frame() {
        let frame = micro_encode(b"some input data", &LzmaOptions::default()).unwrap();
        let err = micro_decode(&frame[..frame.len() - 2], 15);
        assert!(err.is_err());
    }
}
