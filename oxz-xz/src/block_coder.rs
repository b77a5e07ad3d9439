//! Block payload coding.
//!
//! A block's payload is the filter chain output, zero-padded to a four-byte
//! boundary, followed by the integrity check over the uncompressed data.
//! These coders sit between the stream machine and the filter pipeline:
//! they keep the running size totals, feed the check, and enforce the
//! declared sizes from the block header.

use oxz_core::check::{Check, CheckType, CheckValue};
use oxz_core::coder::{Action, CodeStatus, Coder};
use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;

use crate::block::BlockHeader;
use crate::pipeline::{DecodePipeline, EncodePipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seq {
    Code,
    Padding,
    Check,
}

/// Encodes one block's payload, padding and check.
pub struct BlockEncoder {
    pipeline: EncodePipeline,
    check: Check,
    compressed: u64,
    uncompressed: u64,
    seq: Seq,
    trailer: Option<CheckValue>,
    trailer_pos: usize,
    pad_emitted: u64,
    header_size: usize,
}

impl std::fmt::Debug for BlockEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEncoder")
            .field("check", &self.check)
            .field("compressed", &self.compressed)
            .field("uncompressed", &self.uncompressed)
            .field("seq", &self.seq)
            .field("trailer", &self.trailer)
            .field("trailer_pos", &self.trailer_pos)
            .field("pad_emitted", &self.pad_emitted)
            .field("header_size", &self.header_size)
            .finish()
    }
}

impl BlockEncoder {
    /// Create the payload encoder for a block header and stream check.
    pub fn new(
        header: &BlockHeader,
        check_type: CheckType,
        mem: Option<&mut MemLimit>,
    ) -> Result<Self> {
        if !check_type.is_supported() {
            return Err(XzError::UnsupportedCheck {
                id: check_type.id(),
            });
        }
        Ok(Self {
            pipeline: EncodePipeline::new(&header.filters, mem)?,
            check: Check::new(check_type),
            compressed: 0,
            uncompressed: 0,
            seq: Seq::Code,
            trailer: None,
            trailer_pos: 0,
            pad_emitted: 0,
            header_size: header.header_size,
        })
    }

    /// Size of this block on the wire so far, without trailing padding.
    pub fn unpadded_size(&self) -> u64 {
        self.header_size as u64 + self.compressed + self.check.check_type().size() as u64
    }

    /// Uncompressed bytes consumed so far.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed
    }
}

impl Coder for BlockEncoder {
    fn code(&mut self, input: &[u8], output: &mut [u8], action: Action) -> Result<CodeStatus> {
        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            match self.seq {
                Seq::Code => {
                    let inner_action = match action {
                        Action::FullFlush => Action::Finish,
                        other => other,
                    };
                    let status = self.pipeline.code(
                        &input[consumed..],
                        &mut output[produced..],
                        inner_action,
                    )?;

                    self.check.update(&input[consumed..consumed + status.consumed]);
                    consumed += status.consumed;
                    produced += status.produced;
                    self.compressed += status.produced as u64;
                    self.uncompressed += status.consumed as u64;

                    if status.ended {
                        if action == Action::SyncFlush {
                            // The payload continues after a sync flush.
                            return Ok(CodeStatus::end(consumed, produced));
                        }
                        self.seq = Seq::Padding;
                        continue;
                    }
                    return Ok(CodeStatus::more(consumed, produced));
                }

                Seq::Padding => {
                    while (self.compressed + self.pad_emitted) % 4 != 0 {
                        if produced == output.len() {
                            return Ok(CodeStatus::more(consumed, produced));
                        }
                        output[produced] = 0x00;
                        produced += 1;
                        self.pad_emitted += 1;
                    }
                    let check = std::mem::replace(&mut self.check, Check::None);
                    self.trailer = Some(check.finish());
                    self.seq = Seq::Check;
                }

                Seq::Check => {
                    let trailer = self.trailer.as_ref().expect("finalized in padding");
                    let bytes = trailer.as_bytes();
                    while self.trailer_pos < bytes.len() {
                        if produced == output.len() {
                            return Ok(CodeStatus::more(consumed, produced));
                        }
                        output[produced] = bytes[self.trailer_pos];
                        produced += 1;
                        self.trailer_pos += 1;
                    }
                    return Ok(CodeStatus::end(consumed, produced));
                }
            }
        }
    }
}

/// Decodes one block's payload, padding and check.
pub struct BlockDecoder {
    pipeline: DecodePipeline,
    check: Check,
    declared_compressed: Option<u64>,
    declared_uncompressed: Option<u64>,
    compressed: u64,
    uncompressed: u64,
    seq: Seq,
    trailer_pos: usize,
    stored_trailer: [u8; 64],
    header_size: usize,
}

impl BlockDecoder {
    /// Create the payload decoder for a parsed block header.
    pub fn new(
        header: &BlockHeader,
        check_type: CheckType,
        mem: Option<&mut MemLimit>,
    ) -> Result<Self> {
        Ok(Self {
            pipeline: DecodePipeline::new(&header.filters, mem)?,
            check: Check::new(check_type),
            declared_compressed: header.compressed_size,
            declared_uncompressed: header.uncompressed_size,
            compressed: 0,
            uncompressed: 0,
            seq: Seq::Code,
            trailer_pos: 0,
            stored_trailer: [0; 64],
            header_size: header.header_size,
        })
    }

    /// Size of the decoded block on the wire, without trailing padding.
    pub fn unpadded_size(&self) -> u64 {
        self.header_size as u64 + self.compressed + self.check.check_type().size() as u64
    }

    /// Uncompressed bytes produced so far.
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed
    }
}

impl Coder for BlockDecoder {
    fn code(&mut self, input: &[u8], output: &mut [u8], _action: Action) -> Result<CodeStatus> {
        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            match self.seq {
                Seq::Code => {
                    let out_start = produced;
                    let status = self.pipeline.code(
                        &input[consumed..],
                        &mut output[produced..],
                        Action::Run,
                    )?;
                    consumed += status.consumed;
                    produced += status.produced;
                    self.compressed += status.consumed as u64;
                    self.uncompressed += status.produced as u64;
                    self.check.update(&output[out_start..produced]);

                    if let Some(limit) = self.declared_compressed {
                        if self.compressed > limit {
                            return Err(XzError::data(
                                "compressed payload larger than declared",
                            ));
                        }
                    }
                    if let Some(limit) = self.declared_uncompressed {
                        if self.uncompressed > limit {
                            return Err(XzError::data(
                                "uncompressed data larger than declared",
                            ));
                        }
                    }

                    if status.ended {
                        if self
                            .declared_compressed
                            .is_some_and(|size| size != self.compressed)
                        {
                            return Err(XzError::data(
                                "compressed size does not match the header",
                            ));
                        }
                        if self
                            .declared_uncompressed
                            .is_some_and(|size| size != self.uncompressed)
                        {
                            return Err(XzError::data(
                                "uncompressed size does not match the header",
                            ));
                        }
                        self.seq = Seq::Padding;
                        continue;
                    }
                    return Ok(CodeStatus::more(consumed, produced));
                }

                Seq::Padding => {
                    while (self.compressed + self.trailer_pos as u64) % 4 != 0 {
                        if consumed == input.len() {
                            return Ok(CodeStatus::more(consumed, produced));
                        }
                        if input[consumed] != 0x00 {
                            return Err(XzError::data("non-zero block padding"));
                        }
                        consumed += 1;
                        self.trailer_pos += 1;
                    }
                    self.trailer_pos = 0;
                    self.seq = Seq::Check;
                }

                Seq::Check => {
                    let size = self.check.check_type().size();
                    while self.trailer_pos < size {
                        if consumed == input.len() {
                            return Ok(CodeStatus::more(consumed, produced));
                        }
                        self.stored_trailer[self.trailer_pos] = input[consumed];
                        consumed += 1;
                        self.trailer_pos += 1;
                    }

                    if self.check.check_type().is_supported() {
                        let check = std::mem::replace(&mut self.check, Check::None);
                        let computed = check.finish();
                        if computed.as_bytes() != &self.stored_trailer[..size] {
                            return Err(XzError::data("block integrity check mismatch"));
                        }
                    }
                    return Ok(CodeStatus::end(consumed, produced));
                }
            }
        }
    }
}
