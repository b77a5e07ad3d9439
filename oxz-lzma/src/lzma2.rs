//! The LZMA2 chunk layer.
//!
//! LZMA2 wraps raw LZMA in self-delimiting chunks so that a stream can
//! reset its probability model or dictionary mid-way, store incompressible
//! ranges verbatim, and declare every size up front. Chunk layout:
//!
//! - `0x00` ends the stream.
//! - `0x01`/`0x02` introduce an uncompressed chunk (with/without dictionary
//!   reset), followed by a big-endian `size - 1` and the raw bytes.
//! - `0x80..=0xFF` introduce an LZMA chunk: bits 6-5 select state/props/
//!   dictionary resets, bits 4-0 carry the top bits of the 21-bit
//!   `uncompressed size - 1`, then two more size bytes, the 16-bit
//!   `compressed size - 1`, and a properties byte when requested.
//!
//! Both directions implement the incremental [`Coder`] contract; all
//! buffers are bounded by the chunk limits.

use oxz_core::coder::{Action, CodeStatus, Coder};
use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;

use crate::LzmaOptions;
use crate::decoder::{DecoderDict, decode_chunk};
use crate::encoder::LzmaEncoder;
use crate::model::{LzmaModel, LzmaProps, MATCH_LEN_MAX};
use crate::range_coder::RangeEncoder;
use crate::window::MatchFinder;

/// Largest uncompressed payload of one LZMA chunk (21-bit size field).
pub const CHUNK_UNCOMP_MAX: usize = 1 << 21;

/// Largest compressed payload of one chunk (16-bit size field).
pub const CHUNK_COMP_MAX: usize = 1 << 16;

/// Headroom kept below [`CHUNK_COMP_MAX`] so one more symbol always fits.
const CHUNK_COMP_MARGIN: usize = 128;

/// Dictionary size encoded as the single LZMA2 properties byte:
/// `(2 | (p & 1)) << (p / 2 + 11)`.
pub fn dict_size_from_props(props: u8) -> Result<u32> {
    if props > 40 {
        return Err(XzError::options("invalid LZMA2 dictionary properties"));
    }
    if props == 40 {
        return Ok(u32::MAX);
    }
    Ok((2 | u32::from(props) & 1) << (u32::from(props) / 2 + 11))
}

/// Smallest properties byte covering `dict_size`.
pub fn props_from_dict_size(dict_size: u32) -> u8 {
    for props in 0..40 {
        if dict_size_from_props(props).unwrap() >= dict_size {
            return props;
        }
    }
    40
}

/// Streaming LZMA2 encoder.
pub struct Lzma2Encoder {
    enc: LzmaEncoder,
    mf: MatchFinder,
    rc: RangeEncoder,
    props: LzmaProps,
    uncomp_limit: u64,

    /// Encoder position at the start of the open chunk.
    chunk_start: u64,
    need_dict_reset: bool,
    need_props: bool,
    need_state_reset: bool,

    out_queue: Vec<u8>,
    out_pos: usize,
    ended: bool,
    poisoned: bool,
}

impl Lzma2Encoder {
    /// Create an encoder from validated options, claiming its buffers
    /// against an optional memory limit.
    pub fn new(options: &LzmaOptions, mem: Option<&mut MemLimit>) -> Result<Self> {
        options.validate()?;
        let props = LzmaProps::new(options.lc, options.lp, options.pb)
            .ok_or_else(|| XzError::options("invalid lc/lp/pb combination"))?;

        let mf = MatchFinder::new(
            options.mf,
            options.dict_size,
            options.nice_len,
            options.depth,
            mem,
        )?;

        let uncomp_limit = (options.dict_size as u64)
            .min(CHUNK_UNCOMP_MAX as u64)
            .saturating_sub(MATCH_LEN_MAX as u64)
            .max(1);

        Ok(Self {
            enc: LzmaEncoder::new(props, options.mode, options.nice_len),
            mf,
            rc: RangeEncoder::with_capacity(CHUNK_COMP_MAX),
            props,
            uncomp_limit,
            chunk_start: 0,
            need_dict_reset: true,
            need_props: true,
            need_state_reset: false,
            out_queue: Vec::with_capacity(CHUNK_COMP_MAX + 8),
            out_pos: 0,
            ended: false,
            poisoned: false,
        })
    }

    fn chunk_uncomp(&self) -> u64 {
        self.enc.position() - self.chunk_start
    }

    /// Close the open chunk: serialize it into the output queue, falling
    /// back to verbatim storage when compression did not help.
    fn emit_chunk(&mut self) {
        let uncomp = self.chunk_uncomp() as usize;
        debug_assert!(uncomp > 0 && uncomp <= CHUNK_UNCOMP_MAX);
        let comp = self.rc.finish();
        debug_assert!(comp.len() <= CHUNK_COMP_MAX);

        // Verbatim storage is only safe when no parser decisions are
        // queued: queued repeats refer to the distance cache the state
        // reset would clear.
        if comp.len() >= uncomp && !self.enc.has_lookahead() {
            let bytes = self.mf.recent_bytes(uncomp).to_vec();
            for part in bytes.chunks(CHUNK_COMP_MAX) {
                let control = if self.need_dict_reset { 0x01 } else { 0x02 };
                self.need_dict_reset = false;
                self.out_queue.push(control);
                let size = (part.len() - 1) as u16;
                self.out_queue.extend_from_slice(&size.to_be_bytes());
                self.out_queue.extend_from_slice(part);
            }
            self.enc.reset_state();
            self.need_state_reset = true;
            self.need_props = true;
        } else {
            let reset = if self.need_dict_reset {
                3u8
            } else if self.need_state_reset && self.need_props {
                2
            } else if self.need_state_reset {
                1
            } else {
                0
            };

            let size_bits = (uncomp - 1) as u32;
            self.out_queue
                .push(0x80 | (reset << 5) | (size_bits >> 16) as u8);
            self.out_queue.push((size_bits >> 8) as u8);
            self.out_queue.push(size_bits as u8);
            let comp_bits = (comp.len() - 1) as u16;
            self.out_queue.extend_from_slice(&comp_bits.to_be_bytes());
            if reset >= 2 {
                self.out_queue.push(self.props.to_byte());
            }
            self.out_queue.extend_from_slice(&comp);

            self.need_dict_reset = false;
            self.need_props = false;
            self.need_state_reset = false;
        }

        self.chunk_start = self.enc.position();
    }
}

impl Coder for Lzma2Encoder {
    fn code(&mut self, input: &[u8], output: &mut [u8], action: Action) -> Result<CodeStatus> {
        if self.poisoned {
            return Err(XzError::program("encoder used after a fatal error"));
        }
        if self.ended && self.out_pos >= self.out_queue.len() {
            return Err(XzError::program("encoder used after finish"));
        }

        let mut consumed = 0usize;
        let mut produced = 0usize;
        let finishing = action != Action::Run;

        loop {
            // Drain serialized chunks first.
            if self.out_pos < self.out_queue.len() {
                let n = (self.out_queue.len() - self.out_pos).min(output.len() - produced);
                output[produced..produced + n]
                    .copy_from_slice(&self.out_queue[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                produced += n;

                if self.out_pos < self.out_queue.len() {
                    return Ok(CodeStatus::more(consumed, produced));
                }
                self.out_queue.clear();
                self.out_pos = 0;

                if self.ended {
                    return Ok(CodeStatus::end(consumed, produced));
                }
            }

            // Feed the window.
            if consumed < input.len() {
                consumed += self.mf.fill(&input[consumed..], finishing);
            } else if finishing && !self.mf.is_ended() {
                self.mf.fill(&[], true);
            }

            // Encode until the chunk is full or data runs out.
            let mut budget_hit = false;
            while self.mf.can_encode() {
                if self.chunk_uncomp() >= self.uncomp_limit
                    || self.rc.pending_len() >= CHUNK_COMP_MAX - CHUNK_COMP_MARGIN
                {
                    budget_hit = true;
                    break;
                }
                self.enc.encode_one(&mut self.mf, &mut self.rc);
            }

            let drained =
                finishing && consumed == input.len() && self.mf.is_drained()
                    && !self.enc.has_lookahead();

            if budget_hit || (drained && self.chunk_uncomp() > 0) {
                self.emit_chunk();
                continue;
            }

            if drained {
                match action {
                    Action::Finish => {
                        self.out_queue.push(0x00);
                        self.ended = true;
                        continue;
                    }
                    Action::SyncFlush | Action::FullFlush => {
                        self.mf.reopen();
                        return Ok(CodeStatus::end(consumed, produced));
                    }
                    Action::Run => unreachable!(),
                }
            }

            if !finishing && consumed == input.len() {
                // Waiting for more input.
                return Ok(CodeStatus::more(consumed, produced));
            }
        }
    }
}

/// Chunk-header parsing position of the streaming decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seq {
    Control,
    UncompSize(u8),
    CompSize(u8),
    Props,
    LzmaData,
    UncompData,
}

/// Streaming LZMA2 decoder.
pub struct Lzma2Decoder {
    model: Option<LzmaModel>,
    dict: DecoderDict,

    seq: Seq,
    control: u8,
    uncomp_size: usize,
    comp_size: usize,
    chunk_buf: Vec<u8>,

    /// Set until the first chunk arrived; it must reset the dictionary.
    need_dict_reset: bool,
    /// Set while the LZMA state is undefined (start, or after an
    /// uncompressed chunk); the next LZMA chunk must reset it.
    need_state_reset: bool,

    out_queue: Vec<u8>,
    out_pos: usize,
    ended: bool,
    poisoned: bool,
}

impl Lzma2Decoder {
    /// Create a decoder for the given dictionary size, claiming the
    /// dictionary against an optional memory limit.
    pub fn new(dict_size: u32, mem: Option<&mut MemLimit>) -> Result<Self> {
        Ok(Self {
            model: None,
            dict: DecoderDict::new(dict_size, mem)?,
            seq: Seq::Control,
            control: 0,
            uncomp_size: 0,
            comp_size: 0,
            chunk_buf: Vec::with_capacity(CHUNK_COMP_MAX),
            need_dict_reset: true,
            need_state_reset: true,
            out_queue: Vec::with_capacity(CHUNK_UNCOMP_MAX.min(1 << 18)),
            out_pos: 0,
            ended: false,
            poisoned: false,
        })
    }

    /// Create a decoder from the single LZMA2 properties byte.
    pub fn from_props(props: &[u8], mem: Option<&mut MemLimit>) -> Result<Self> {
        let [byte] = props else {
            return Err(XzError::options("LZMA2 properties must be one byte"));
        };
        Self::new(dict_size_from_props(*byte)?, mem)
    }

    fn start_lzma_chunk(&mut self, props_byte: Option<u8>) -> Result<()> {
        let reset = (self.control >> 5) & 0x3;

        if self.need_dict_reset && reset != 3 {
            return Err(XzError::data("first chunk does not reset the dictionary"));
        }
        if self.need_state_reset && reset == 0 {
            return Err(XzError::data(
                "LZMA chunk continues an undefined coder state",
            ));
        }

        if let Some(byte) = props_byte {
            let props = LzmaProps::from_byte(byte)
                .ok_or_else(|| XzError::options("invalid LZMA properties byte"))?;
            match &mut self.model {
                Some(model) if model.props == props => model.reset(),
                _ => self.model = Some(LzmaModel::new(props)),
            }
        } else {
            let model = self
                .model
                .as_mut()
                .ok_or_else(|| XzError::data("LZMA chunk before any properties"))?;
            if reset >= 1 {
                model.reset();
            }
        }

        if reset == 3 {
            self.dict.reset();
        }
        self.need_dict_reset = false;
        self.need_state_reset = false;
        Ok(())
    }
}

impl Lzma2Decoder {
    /// One step of the header/data state machine. Consumes at least one
    /// byte unless the current chunk payload is being accumulated.
    fn step(&mut self, input: &[u8], consumed: &mut usize) -> Result<()> {
        match self.seq {
            Seq::Control => {
                let c = input[*consumed];
                *consumed += 1;

                if c == 0x00 {
                    self.ended = true;
                } else if c < 0x80 {
                    if c > 0x02 {
                        return Err(XzError::data("invalid LZMA2 control byte"));
                    }
                    if self.need_dict_reset && c != 0x01 {
                        return Err(XzError::data(
                            "first chunk does not reset the dictionary",
                        ));
                    }
                    self.control = c;
                    self.uncomp_size = 0;
                    self.seq = Seq::UncompSize(0);
                } else {
                    self.control = c;
                    self.uncomp_size = ((c & 0x1F) as usize) << 16;
                    self.seq = Seq::UncompSize(0);
                }
            }

            Seq::UncompSize(step) => {
                self.uncomp_size |= (input[*consumed] as usize) << (8 * (1 - step as usize));
                *consumed += 1;

                if step == 0 {
                    self.seq = Seq::UncompSize(1);
                } else {
                    self.uncomp_size += 1;
                    if self.control < 0x80 {
                        // Uncompressed chunk: the payload follows directly.
                        if self.control == 0x01 {
                            self.dict.reset();
                        }
                        self.need_dict_reset = false;
                        // The LZMA state does not survive a verbatim chunk.
                        self.need_state_reset = true;
                        self.seq = Seq::UncompData;
                    } else {
                        self.comp_size = 0;
                        self.seq = Seq::CompSize(0);
                    }
                }
            }

            Seq::CompSize(step) => {
                self.comp_size |= (input[*consumed] as usize) << (8 * (1 - step as usize));
                *consumed += 1;

                if step == 0 {
                    self.seq = Seq::CompSize(1);
                } else {
                    self.comp_size += 1;
                    if (self.control >> 5) & 0x3 >= 2 {
                        self.seq = Seq::Props;
                    } else {
                        self.start_lzma_chunk(None)?;
                        self.seq = Seq::LzmaData;
                    }
                }
            }

            Seq::Props => {
                let byte = input[*consumed];
                *consumed += 1;
                self.start_lzma_chunk(Some(byte))?;
                self.seq = Seq::LzmaData;
            }

            Seq::LzmaData => {
                let want = self.comp_size - self.chunk_buf.len();
                let n = want.min(input.len() - *consumed);
                self.chunk_buf
                    .extend_from_slice(&input[*consumed..*consumed + n]);
                *consumed += n;

                if self.chunk_buf.len() == self.comp_size {
                    let model = self
                        .model
                        .as_mut()
                        .ok_or_else(|| XzError::data("LZMA chunk before any properties"))?;
                    decode_chunk(
                        model,
                        &mut self.dict,
                        &self.chunk_buf,
                        &mut self.out_queue,
                        self.uncomp_size,
                        false,
                    )?;
                    self.chunk_buf.clear();
                    self.seq = Seq::Control;
                }
            }

            Seq::UncompData => {
                let n = self.uncomp_size.min(input.len() - *consumed);
                self.dict
                    .extend(&input[*consumed..*consumed + n], &mut self.out_queue);
                *consumed += n;
                self.uncomp_size -= n;

                if self.uncomp_size == 0 {
                    self.seq = Seq::Control;
                }
            }
        }
        Ok(())
    }
}

impl Coder for Lzma2Decoder {
    fn code(&mut self, input: &[u8], output: &mut [u8], _action: Action) -> Result<CodeStatus> {
        if self.poisoned {
            return Err(XzError::program("decoder used after a fatal error"));
        }

        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            // Drain decoded bytes first.
            if self.out_pos < self.out_queue.len() {
                let n = (self.out_queue.len() - self.out_pos).min(output.len() - produced);
                output[produced..produced + n]
                    .copy_from_slice(&self.out_queue[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                produced += n;

                if self.out_pos < self.out_queue.len() {
                    return Ok(CodeStatus::more(consumed, produced));
                }
                self.out_queue.clear();
                self.out_pos = 0;
            }

            if self.ended {
                return Ok(CodeStatus::end(consumed, produced));
            }
            if consumed == input.len() {
                return Ok(CodeStatus::more(consumed, produced));
            }

            if let Err(err) = self.step(input, &mut consumed) {
                if err.is_fatal() {
                    self.poisoned = true;
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Mode;
    use crate::window::MfKind;
    use oxz_core::coder::code_all;

    fn options(mode: Mode) -> LzmaOptions {
        LzmaOptions {
            dict_size: 1 << 16,
            lc: 3,
            lp: 0,
            pb: 2,
            mode,
            nice_len: 64,
            mf: MfKind::Hc4,
            depth: 0,
        }
    }

    fn lzma2_roundtrip(mode: Mode, data: &[u8]) -> Vec<u8> {
        let mut enc = Lzma2Encoder::new(&options(mode), None).unwrap();
        let compressed = code_all(&mut enc, data).unwrap();

        let mut dec = Lzma2Decoder::new(1 << 16, None).unwrap();
        let decoded = code_all(&mut dec, &compressed).unwrap();
        assert_eq!(decoded, data, "{mode:?} LZMA2 roundtrip failed");
        compressed
    }

    #[test]
    fn test_roundtrip_both_modes() {
        let data = b"a rose is a rose is a rose. ".repeat(300);
        lzma2_roundtrip(Mode::Fast, &data);
        lzma2_roundtrip(Mode::Normal, &data);
    }

    #[test]
    fn test_roundtrip_edges() {
        lzma2_roundtrip(Mode::Fast, b"");
        lzma2_roundtrip(Mode::Fast, b"z");
        lzma2_roundtrip(Mode::Normal, b"");
        lzma2_roundtrip(Mode::Fast, &vec![0u8; 200_000]);
    }

    #[test]
    fn test_empty_stream_is_end_marker_only() {
        let mut enc = Lzma2Encoder::new(&options(Mode::Fast), None).unwrap();
        let compressed = code_all(&mut enc, b"").unwrap();
        assert_eq!(compressed, vec![0x00]);
    }

    #[test]
    fn test_multi_chunk_stream() {
        // More than one chunk's worth of uncompressed data; the dictionary
        // is 64 KiB so chunks are capped well below the input size.
        let data: Vec<u8> = (0..300_000u32).map(|i| ((i / 3) % 251) as u8).collect();
        let compressed = lzma2_roundtrip(Mode::Fast, &data);

        // At least two chunk headers beyond the end marker.
        assert!(compressed.len() > 8);
    }

    #[test]
    fn test_incompressible_falls_back_to_verbatim() {
        let mut state = 0x8BADF00Du32;
        let data: Vec<u8> = (0..60_000)
            .map(|_| {
                state = state.wrapping_mul(0x0019_660D).wrapping_add(0x3C6E_F35F);
                (state >> 24) as u8
            })
            .collect();

        let compressed = lzma2_roundtrip(Mode::Fast, &data);
        // Verbatim chunks bound the expansion to the chunk headers.
        assert!(compressed.len() < data.len() + data.len() / 100 + 16);
    }

    #[test]
    fn test_streaming_tiny_buffers() {
        let data = b"tiny buffer streaming test ".repeat(200);
        let mut enc = Lzma2Encoder::new(&options(Mode::Fast), None).unwrap();

        // Drive the encoder with a 7-byte output buffer.
        let mut compressed = Vec::new();
        let mut buf = [0u8; 7];
        let mut pos = 0;
        loop {
            let action = if pos == data.len() {
                Action::Finish
            } else {
                Action::Run
            };
            let status = enc
                .code(&data[pos..(pos + 13).min(data.len())], &mut buf, action)
                .unwrap();
            pos += status.consumed;
            compressed.extend_from_slice(&buf[..status.produced]);
            if status.ended {
                break;
            }
        }

        // And the decoder with a 3-byte output buffer.
        let mut dec = Lzma2Decoder::new(1 << 16, None).unwrap();
        let mut decoded = Vec::new();
        let mut out = [0u8; 3];
        let mut pos = 0;
        loop {
            let status = dec
                .code(&compressed[pos..(pos + 5).min(compressed.len())], &mut out, Action::Run)
                .unwrap();
            pos += status.consumed;
            decoded.extend_from_slice(&out[..status.produced]);
            if status.ended {
                break;
            }
        }

        assert_eq!(decoded, data);
    }

    #[test]
    fn test_sync_flush_midway() {
        let part1 = b"first half of the stream, ".repeat(50);
        let part2 = b"second half of the stream.".repeat(50);

        let mut enc = Lzma2Encoder::new(&options(Mode::Fast), None).unwrap();
        let mut compressed = Vec::new();
        let mut buf = vec![0u8; 1 << 16];

        // Feed part one and sync flush.
        let mut pos = 0;
        loop {
            let status = enc.code(&part1[pos..], &mut buf, Action::SyncFlush).unwrap();
            pos += status.consumed;
            compressed.extend_from_slice(&buf[..status.produced]);
            if status.ended {
                break;
            }
        }
        let flush_point = compressed.len();

        // Everything so far must already be decodable.
        let mut dec = Lzma2Decoder::new(1 << 16, None).unwrap();
        let mut early = Vec::new();
        let mut out = vec![0u8; 1 << 16];
        let status = dec.code(&compressed, &mut out, Action::Run).unwrap();
        early.extend_from_slice(&out[..status.produced]);
        assert_eq!(early, part1, "sync flush left data unreadable");
        assert_eq!(status.consumed, flush_point);

        // Continue with part two and finish.
        let mut pos = 0;
        loop {
            let status = enc.code(&part2[pos..], &mut buf, Action::Finish).unwrap();
            pos += status.consumed;
            compressed.extend_from_slice(&buf[..status.produced]);
            if status.ended {
                break;
            }
        }

        let mut dec = Lzma2Decoder::new(1 << 16, None).unwrap();
        let decoded = code_all(&mut dec, &compressed).unwrap();
        let mut expected = part1.clone();
        expected.extend_from_slice(&part2);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_corrupt_control_byte() {
        let mut dec = Lzma2Decoder::new(1 << 16, None).unwrap();
        let mut out = [0u8; 64];
        let err = dec.code(&[0x7F, 0, 0], &mut out, Action::Run).unwrap_err();
        assert!(matches!(err, XzError::Data { .. }));

        // The handle is poisoned afterwards.
        let err = dec.code(&[0x00], &mut out, Action::Run).unwrap_err();
        assert!(matches!(err, XzError::Program { .. }));
    }

    #[test]
    fn test_first_chunk_must_reset_dict() {
        // Control 0x02 (no dictionary reset) as the first chunk is corrupt.
        let mut dec = Lzma2Decoder::new(1 << 16, None).unwrap();
        let mut out = [0u8; 64];
        let err = dec
            .code(&[0x02, 0x00, 0x00, b'x'], &mut out, Action::Run)
            .unwrap_err();
        assert!(matches!(err, XzError::Data { .. }));
    }

    #[test]
    fn test_dict_props_mapping() {
        assert_eq!(dict_size_from_props(0).unwrap(), 1 << 12);
        assert_eq!(dict_size_from_props(1).unwrap(), 3 << 11);
        assert_eq!(dict_size_from_props(2).unwrap(), 1 << 13);
        assert_eq!(dict_size_from_props(40).unwrap(), u32::MAX);
        assert!(dict_size_from_props(41).is_err());

        for size in [4096u32, 1 << 16, 1 << 20, (1 << 20) * 3] {
            let props = props_from_dict_size(size);
            assert!(dict_size_from_props(props).unwrap() >= size);
        }
    }
}
