//! Stream encoding and decoding.
//!
//! The stream machine walks Header, Blocks, Index and Footer in order,
//! driven entirely by fixed- or VLI-length prefixes of the input; no state
//! consumes input it has not committed to. A single byte decides between
//! "another block header" (its size byte) and "the Index begins" (0x00).
//! Decoders can optionally accept any number of concatenated streams with
//! four-aligned zero padding between them.

use oxz_core::check::CheckType;
use oxz_core::coder::{Action, CodeStatus, Coder};
use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;

use crate::block::{BLOCK_HEADER_SIZE_MAX, BlockHeader, header_size_decode};
use crate::block_coder::{BlockDecoder, BlockEncoder};
use crate::filter::{Filter, validate_chain};
use crate::flags::{
    STREAM_HEADER_SIZE, StreamFlags, stream_footer_decode, stream_footer_encode,
    stream_header_decode, stream_header_encode,
};
use crate::index::Index;
use crate::index_hash::IndexHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncSeq {
    StreamHeader,
    BlockInit,
    BlockPayload,
    IndexAndFooter,
}

/// Streaming `.xz` writer.
pub struct StreamEncoder {
    filters: Vec<Filter>,
    check_type: CheckType,
    /// Close the running block once it holds this much uncompressed data.
    block_size: Option<u64>,

    seq: EncSeq,
    block: Option<BlockEncoder>,
    index: Index,

    out_queue: Vec<u8>,
    out_pos: usize,
    ended: bool,
    poisoned: bool,
}

impl StreamEncoder {
    /// Create a writer for the given chain and check.
    pub fn new(
        filters: Vec<Filter>,
        check_type: CheckType,
        block_size: Option<u64>,
    ) -> Result<Self> {
        validate_chain(&filters)?;
        if !check_type.is_supported() {
            return Err(XzError::UnsupportedCheck {
                id: check_type.id(),
            });
        }
        if block_size == Some(0) {
            return Err(XzError::options("block size must be non-zero"));
        }

        Ok(Self {
            filters,
            check_type,
            block_size,
            seq: EncSeq::StreamHeader,
            block: None,
            index: Index::new(),
            out_queue: Vec::with_capacity(BLOCK_HEADER_SIZE_MAX + 32),
            out_pos: 0,
            ended: false,
            poisoned: false,
        })
    }

    fn finish_block(&mut self) -> Result<()> {
        let block = self.block.take().expect("open block");
        self.index
            .push(block.unpadded_size(), block.uncompressed_size())?;
        self.seq = EncSeq::BlockInit;
        Ok(())
    }
}

impl Coder for StreamEncoder {
    fn code(&mut self, input: &[u8], output: &mut [u8], action: Action) -> Result<CodeStatus> {
        if self.poisoned {
            return Err(XzError::program("encoder used after a fatal error"));
        }
        if self.ended && self.out_pos >= self.out_queue.len() {
            return Err(XzError::program("encoder used after finish"));
        }
        let finishing = action != Action::Run;

        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            // Queued header/index/footer bytes go out first.
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

            match self.seq {
                EncSeq::StreamHeader => {
                    let header = stream_header_encode(StreamFlags {
                        check: self.check_type,
                    });
                    self.out_queue.extend_from_slice(&header);
                    self.seq = EncSeq::BlockInit;
                }

                EncSeq::BlockInit => {
                    if consumed == input.len() && !matches!(action, Action::Finish) {
                        // Nothing to put into a block yet. A sync or full
                        // flush with no open block is already complete.
                        if finishing {
                            return Ok(CodeStatus::end(consumed, produced));
                        }
                        return Ok(CodeStatus::more(consumed, produced));
                    }
                    if consumed == input.len() && action == Action::Finish {
                        self.seq = EncSeq::IndexAndFooter;
                        continue;
                    }

                    let header = BlockHeader::new(self.filters.clone())?;
                    self.out_queue.extend_from_slice(&header.encode()?);
                    self.block = Some(BlockEncoder::new(&header, self.check_type, None)?);
                    self.seq = EncSeq::BlockPayload;
                }

                EncSeq::BlockPayload => {
                    let block = self.block.as_mut().expect("open block");

                    // Respect the per-block uncompressed limit: cap the
                    // input slice and force the block closed at the cap.
                    let mut slice_end = input.len();
                    let mut forced_finish = false;
                    if let Some(limit) = self.block_size {
                        let left = limit.saturating_sub(block.uncompressed_size());
                        if (input.len() - consumed) as u64 >= left {
                            slice_end = consumed + left as usize;
                            forced_finish = true;
                        }
                    }

                    let inner_action = if forced_finish {
                        Action::Finish
                    } else {
                        match action {
                            Action::Finish | Action::FullFlush => Action::Finish,
                            Action::SyncFlush => Action::SyncFlush,
                            Action::Run => Action::Run,
                        }
                    };

                    let status = block.code(
                        &input[consumed..slice_end],
                        &mut output[produced..],
                        inner_action,
                    )?;
                    consumed += status.consumed;
                    produced += status.produced;

                    if status.ended {
                        if inner_action == Action::SyncFlush {
                            // Flush complete; the block stays open.
                            return Ok(CodeStatus::end(consumed, produced));
                        }
                        self.finish_block()?;
                        if action == Action::FullFlush && consumed == input.len() {
                            return Ok(CodeStatus::end(consumed, produced));
                        }
                        continue;
                    }

                    if status.consumed == 0 && status.produced == 0 {
                        return Ok(CodeStatus::more(consumed, produced));
                    }
                }

                EncSeq::IndexAndFooter => {
                    let index_bytes = self.index.encode()?;
                    self.out_queue.extend_from_slice(&index_bytes);
                    let footer = stream_footer_encode(
                        StreamFlags {
                            check: self.check_type,
                        },
                        index_bytes.len() as u64,
                    )?;
                    self.out_queue.extend_from_slice(&footer);
                    self.ended = true;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecSeq {
    StreamHeader,
    BlockStart,
    BlockHeader,
    BlockPayload,
    Index,
    Footer,
    StreamPadding,
}

/// Streaming `.xz` reader.
pub struct StreamDecoder {
    /// Accept concatenated streams with aligned zero padding between them.
    concatenated: bool,
    memlimit: Option<MemLimit>,

    seq: DecSeq,
    header_buf: [u8; BLOCK_HEADER_SIZE_MAX],
    header_pos: usize,
    header_need: usize,
    stream_flags: StreamFlags,
    index_hash: IndexHash,
    block: Option<BlockDecoder>,
    block_mem: u64,
    padding: u64,

    pending_warning: bool,
    ended: bool,
    poisoned: bool,
}

impl StreamDecoder {
    /// Create a reader. With `concatenated` set, the decoder keeps going
    /// after a stream footer as long as further streams follow.
    pub fn new(concatenated: bool, memlimit: Option<MemLimit>) -> Self {
        Self {
            concatenated,
            memlimit,
            seq: DecSeq::StreamHeader,
            header_buf: [0; BLOCK_HEADER_SIZE_MAX],
            header_pos: 0,
            header_need: STREAM_HEADER_SIZE,
            stream_flags: StreamFlags::default(),
            index_hash: IndexHash::new(),
            block: None,
            block_mem: 0,
            padding: 0,
            pending_warning: false,
            ended: false,
            poisoned: false,
        }
    }

    /// The memory accounting state, if a limit was configured.
    pub fn memlimit(&self) -> Option<&MemLimit> {
        self.memlimit.as_ref()
    }

    /// Take buffered header bytes from the input; true when complete.
    fn buffer_header(&mut self, input: &[u8], consumed: &mut usize) -> bool {
        let n = (self.header_need - self.header_pos).min(input.len() - *consumed);
        self.header_buf[self.header_pos..self.header_pos + n]
            .copy_from_slice(&input[*consumed..*consumed + n]);
        self.header_pos += n;
        *consumed += n;
        self.header_pos == self.header_need
    }

    fn start_block(&mut self) -> Result<()> {
        let header = BlockHeader::decode(&self.header_buf[..self.header_need])?;

        // The dictionary dominates the decoder's memory use; claim it
        // before building the pipeline so a refusal reports how much
        // would have been needed.
        let Filter::Lzma2 { options } = header.filters.last().expect("validated chain") else {
            unreachable!("validated chain ends in LZMA2");
        };
        self.block_mem = u64::from(options.dict_size.max(4096));

        self.block = Some(BlockDecoder::new(
            &header,
            self.stream_flags.check,
            self.memlimit.as_mut(),
        )?);
        Ok(())
    }
}

impl Coder for StreamDecoder {
    fn code(&mut self, input: &[u8], output: &mut [u8], action: Action) -> Result<CodeStatus> {
        if self.poisoned {
            return Err(XzError::program("decoder used after a fatal error"));
        }
        if self.pending_warning {
            // Surfaced with zero progress so the caller loses no bytes;
            // the next call resumes where decoding left off.
            self.pending_warning = false;
            return Err(XzError::UnsupportedCheck {
                id: self.stream_flags.check.id(),
            });
        }

        let mut consumed = 0usize;
        let mut produced = 0usize;

        let result = (|| -> Result<Option<CodeStatus>> {
            loop {
                if self.ended {
                    return Ok(Some(CodeStatus::end(consumed, produced)));
                }

                match self.seq {
                    DecSeq::StreamHeader => {
                        if !self.buffer_header(input, &mut consumed) {
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                        let buf: [u8; STREAM_HEADER_SIZE] =
                            self.header_buf[..STREAM_HEADER_SIZE].try_into().unwrap();
                        self.stream_flags = stream_header_decode(&buf)?;
                        self.header_pos = 0;
                        self.seq = DecSeq::BlockStart;

                        if !self.stream_flags.check.is_supported() {
                            self.pending_warning = true;
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                    }

                    DecSeq::BlockStart => {
                        if consumed == input.len() {
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                        match header_size_decode(input[consumed]) {
                            None => {
                                // The Index begins; its decoder wants to
                                // see the indicator byte itself.
                                self.seq = DecSeq::Index;
                            }
                            Some(size) => {
                                self.header_need = size;
                                self.header_pos = 0;
                                self.seq = DecSeq::BlockHeader;
                            }
                        }
                    }

                    DecSeq::BlockHeader => {
                        if !self.buffer_header(input, &mut consumed) {
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                        self.start_block()?;
                        self.header_pos = 0;
                        self.seq = DecSeq::BlockPayload;
                    }

                    DecSeq::BlockPayload => {
                        let block = self.block.as_mut().expect("open block");
                        let status =
                            block.code(&input[consumed..], &mut output[produced..], Action::Run)?;
                        consumed += status.consumed;
                        produced += status.produced;

                        if status.ended {
                            self.index_hash
                                .append(block.unpadded_size(), block.uncompressed_size())?;
                            if let Some(mem) = self.memlimit.as_mut() {
                                mem.release(self.block_mem);
                            }
                            self.block = None;
                            self.seq = DecSeq::BlockStart;
                            continue;
                        }
                        if status.consumed == 0 && status.produced == 0 {
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                    }

                    DecSeq::Index => {
                        if !self.index_hash.decode(input, &mut consumed)? {
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                        self.header_pos = 0;
                        self.header_need = STREAM_HEADER_SIZE;
                        self.seq = DecSeq::Footer;
                    }

                    DecSeq::Footer => {
                        if !self.buffer_header(input, &mut consumed) {
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                        let buf: [u8; STREAM_HEADER_SIZE] =
                            self.header_buf[..STREAM_HEADER_SIZE].try_into().unwrap();
                        let (flags, backward_size) = stream_footer_decode(&buf)?;

                        if flags != self.stream_flags {
                            return Err(XzError::data(
                                "stream flags differ between header and footer",
                            ));
                        }
                        if backward_size != self.index_hash.index_size() {
                            return Err(XzError::data(
                                "backward size does not match the index",
                            ));
                        }

                        if self.concatenated {
                            self.padding = 0;
                            self.seq = DecSeq::StreamPadding;
                        } else {
                            self.ended = true;
                        }
                    }

                    DecSeq::StreamPadding => {
                        while consumed < input.len() && input[consumed] == 0x00 {
                            consumed += 1;
                            self.padding += 1;
                        }

                        if consumed < input.len() {
                            // A new stream begins after aligned padding.
                            if self.padding % 4 != 0 {
                                return Err(XzError::data(
                                    "stream padding is not a multiple of four",
                                ));
                            }
                            self.index_hash = IndexHash::new();
                            self.header_pos = 0;
                            self.header_need = STREAM_HEADER_SIZE;
                            self.seq = DecSeq::StreamHeader;
                        } else {
                            if action == Action::Finish {
                                if self.padding % 4 != 0 {
                                    return Err(XzError::data(
                                        "stream padding is not a multiple of four",
                                    ));
                                }
                                self.ended = true;
                                continue;
                            }
                            return Ok(Some(CodeStatus::more(consumed, produced)));
                        }
                    }
                }
            }
        })();

        match result {
            Ok(Some(status)) => Ok(status),
            Ok(None) => unreachable!(),
            Err(err) => {
                if err.is_fatal() {
                    self.poisoned = true;
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use oxz_core::coder::code_all;
    use oxz_lzma::LzmaOptions;

    fn filters() -> Vec<Filter> {
        vec![Filter::Lzma2 {
            options: LzmaOptions {
                dict_size: 1 << 16,
                ..LzmaOptions::preset(1)
            },
        }]
    }

    fn encode(data: &[u8], check: CheckType, block_size: Option<u64>) -> Vec<u8> {
        let mut enc = StreamEncoder::new(filters(), check, block_size).unwrap();
        code_all(&mut enc, data).unwrap()
    }

    fn decode(data: &[u8]) -> Result<Vec<u8>> {
        let mut dec = StreamDecoder::new(true, None);
        code_all(&mut dec, data)
    }

    #[test]
    fn test_roundtrip() {
        let data = b"stream framing roundtrip ".repeat(400);
        let stream = encode(&data, CheckType::Crc64, None);

        assert_eq!(&stream[..6], &crate::flags::HEADER_MAGIC);
        assert_eq!(&stream[stream.len() - 2..], &crate::flags::FOOTER_MAGIC);
        assert_eq!(stream.len() % 4, 0);

        assert_eq!(decode(&stream).unwrap(), data);
    }

    #[test]
    fn test_empty_input_has_no_blocks() {
        let stream = encode(b"", CheckType::Crc32, None);
        // Header 12 + empty index 8 + footer 12.
        assert_eq!(stream.len(), 32);
        assert_eq!(decode(&stream).unwrap(), b"");
    }

    #[test]
    fn test_multi_block() {
        let data = b"multi block stream test ".repeat(500);
        let stream = encode(&data, CheckType::Crc32, Some(1000));
        assert_eq!(decode(&stream).unwrap(), data);

        // Larger than single-block because of the per-block overhead.
        let single = encode(&data, CheckType::Crc32, None);
        assert!(stream.len() > single.len());
    }

    #[test]
    fn test_concatenated_streams_with_padding() {
        let a = b"first stream".repeat(30);
        let b = b"second stream".repeat(30);

        let mut joined = encode(&a, CheckType::Crc32, None);
        joined.extend_from_slice(&[0u8; 8]);
        joined.extend_from_slice(&encode(&b, CheckType::Crc64, None));
        joined.extend_from_slice(&[0u8; 4]);

        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        assert_eq!(decode(&joined).unwrap(), expected);
    }

    #[test]
    fn test_misaligned_stream_padding() {
        let a = b"padding alignment".repeat(10);
        let mut joined = encode(&a, CheckType::Crc32, None);
        joined.extend_from_slice(&[0u8; 6]);
        joined.extend_from_slice(&encode(&a, CheckType::Crc32, None));

        assert!(matches!(decode(&joined), Err(XzError::Data { .. })));
    }

    #[test]
    fn test_trailing_misaligned_padding() {
        let a = b"trailing padding".repeat(10);
        let mut joined = encode(&a, CheckType::Crc32, None);
        joined.extend_from_slice(&[0u8; 3]);

        assert!(matches!(decode(&joined), Err(XzError::Data { .. })));
    }

    #[test]
    fn test_single_stream_mode_stops_at_footer() {
        let data = b"single stream".repeat(20);
        let stream = encode(&data, CheckType::Crc32, None);
        let mut with_garbage = stream.clone();
        with_garbage.extend_from_slice(b"garbage");

        let mut dec = StreamDecoder::new(false, None);
        let mut out = vec![0u8; data.len() + 64];
        let status = dec.code(&with_garbage, &mut out, Action::Run).unwrap();
        assert!(status.ended);
        assert_eq!(status.consumed, stream.len());
        assert_eq!(&out[..status.produced], &data[..]);
    }

    #[test]
    fn test_not_xz_format() {
        let mut dec = StreamDecoder::new(false, None);
        let mut out = [0u8; 64];
        let err = dec
            .code(b"definitely not xz data", &mut out, Action::Run)
            .unwrap_err();
        assert!(matches!(err, XzError::Format));
    }

    #[test]
    fn test_truncated_stream_stalls() {
        let data = b"truncation test".repeat(50);
        let stream = encode(&data, CheckType::Crc32, None);

        let mut dec = StreamDecoder::new(false, None);
        let err = code_all(&mut dec, &stream[..stream.len() / 2]).unwrap_err();
        assert!(matches!(err, XzError::Buffer));
    }

    #[test]
    fn test_memlimit_refuses_large_dictionary() {
        let data = b"memory limited decode".repeat(10);
        let stream = encode(&data, CheckType::Crc32, None);

        // The dictionary is 64 KiB; a tiny budget must refuse it.
        let mut dec = StreamDecoder::new(false, Some(MemLimit::new(1024)));
        let err = code_all(&mut dec, &stream).unwrap_err();
        assert!(matches!(err, XzError::MemLimit { .. }));

        // A generous budget works and reports usage.
        let mut dec = StreamDecoder::new(false, Some(MemLimit::new(1 << 26)));
        assert_eq!(code_all(&mut dec, &stream).unwrap(), data);
        assert!(dec.memlimit().unwrap().peak_requested() >= 1 << 16);
    }

    #[test]
    fn test_sync_flush_then_finish() {
        let part1 = b"sync flushed part ".repeat(40);
        let part2 = b"and the rest".repeat(40);

        let mut enc = StreamEncoder::new(filters(), CheckType::Crc32, None).unwrap();
        let mut stream = Vec::new();
        let mut buf = vec![0u8; 1 << 16];

        let mut pos = 0;
        loop {
            let status = enc.code(&part1[pos..], &mut buf, Action::SyncFlush).unwrap();
            pos += status.consumed;
            stream.extend_from_slice(&buf[..status.produced]);
            if status.ended {
                break;
            }
        }

        let mut pos = 0;
        loop {
            let status = enc.code(&part2[pos..], &mut buf, Action::Finish).unwrap();
            pos += status.consumed;
            stream.extend_from_slice(&buf[..status.produced]);
            if status.ended {
                break;
            }
        }

        let mut expected = part1.clone();
        expected.extend_from_slice(&part2);
        assert_eq!(decode(&stream).unwrap(), expected);
    }

    #[test]
    fn test_full_flush_starts_new_block() {
        let part1 = b"block one".repeat(30);
        let part2 = b"block two".repeat(30);

        let mut enc = StreamEncoder::new(filters(), CheckType::Crc32, None).unwrap();
        let mut stream = Vec::new();
        let mut buf = vec![0u8; 1 << 16];

        for (part, action) in [(&part1, Action::FullFlush), (&part2, Action::Finish)] {
            let mut pos = 0;
            loop {
                let status = enc.code(&part[pos..], &mut buf, action).unwrap();
                pos += status.consumed;
                stream.extend_from_slice(&buf[..status.produced]);
                if status.ended {
                    break;
                }
            }
        }

        let mut expected = part1.clone();
        expected.extend_from_slice(&part2);
        assert_eq!(decode(&stream).unwrap(), expected);
    }
}
