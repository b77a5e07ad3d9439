//! The filter chain runtime.
//!
//! A chain couples zero to three size-preserving stages with the LZMA2
//! terminal. On the encoding side plaintext flows through the stages in
//! chain order and into the compressor; on the decoding side the terminal
//! runs first and the stages are applied in reverse. Every stage keeps its
//! own private buffer, so one `code` call simply moves as many bytes as it
//! can along the chain without blocking.

use oxz_core::coder::{Action, CodeStatus, Coder};
use oxz_core::error::{Result, XzError};
use oxz_core::mem::MemLimit;
use oxz_filters::bcj::BcjFilter;
use oxz_filters::delta::DeltaFilter;
use oxz_filters::simple::{CopyFilter, FilterStage, InPlaceFilter};
use oxz_lzma::{Lzma2Decoder, Lzma2Encoder};

use crate::filter::{Filter, validate_chain};

/// Buffer size between chain members.
const LINK_BUF_SIZE: usize = 4096;

/// A byte queue between two chain members.
struct LinkBuf {
    data: Vec<u8>,
    pos: usize,
    len: usize,
}

impl LinkBuf {
    fn new() -> Self {
        Self {
            data: vec![0; LINK_BUF_SIZE],
            pos: 0,
            len: 0,
        }
    }

    fn compact(&mut self) {
        if self.pos == self.len {
            self.pos = 0;
            self.len = 0;
        }
    }

    fn pending(&self) -> usize {
        self.len - self.pos
    }
}

fn build_stage(filter: &Filter, encode: bool) -> Result<FilterStage<Box<dyn InPlaceFilter>>> {
    let transform: Box<dyn InPlaceFilter> = match filter {
        Filter::Copy => Box::new(CopyFilter),
        Filter::Delta { distance } => Box::new(DeltaFilter::new(*distance, encode)?),
        Filter::Bcj { arch, start_offset } => {
            Box::new(BcjFilter::new(*arch, *start_offset, encode)?)
        }
        Filter::Lzma2 { .. } => {
            return Err(XzError::program("LZMA2 is not a chain stage"));
        }
    };
    Ok(FilterStage::new(transform))
}

/// The encoding chain: stages in chain order, then the compressor.
pub struct EncodePipeline {
    stages: Vec<FilterStage<Box<dyn InPlaceFilter>>>,
    bufs: Vec<LinkBuf>,
    stage_done: Vec<bool>,
    terminal: Lzma2Encoder,
}

impl std::fmt::Debug for EncodePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodePipeline")
            .field("stage_count", &self.stages.len())
            .field("stage_done", &self.stage_done)
            .finish()
    }
}

impl EncodePipeline {
    /// Build the chain for a validated filter list.
    pub fn new(filters: &[Filter], mem: Option<&mut MemLimit>) -> Result<Self> {
        validate_chain(filters)?;
        let (last, rest) = filters.split_last().unwrap();
        let Filter::Lzma2 { options } = last else {
            unreachable!("validate_chain guarantees the terminal");
        };

        let stages = rest
            .iter()
            .map(|f| build_stage(f, true))
            .collect::<Result<Vec<_>>>()?;
        let bufs = (0..stages.len()).map(|_| LinkBuf::new()).collect();
        let stage_done = vec![false; stages.len()];

        Ok(Self {
            stages,
            bufs,
            stage_done,
            terminal: Lzma2Encoder::new(options, mem)?,
        })
    }
}

impl Coder for EncodePipeline {
    fn code(&mut self, input: &[u8], output: &mut [u8], action: Action) -> Result<CodeStatus> {
        if action == Action::SyncFlush && !self.stages.is_empty() {
            // The stage holdback cannot be flushed without ending the
            // stages for good, so a chain with transforms only supports
            // block boundaries.
            return Err(XzError::options(
                "sync flush is unsupported with non-terminal filters",
            ));
        }
        let finishing = action != Action::Run;

        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            let mut progress = false;

            // Move bytes along the stage chain.
            for i in 0..self.stages.len() {
                let (left, right) = self.bufs.split_at_mut(i);
                let dst = &mut right[0];
                dst.compact();
                if dst.len == dst.data.len() {
                    continue;
                }

                let (src_slice, upstream_done): (&[u8], bool) = if i == 0 {
                    (&input[consumed..], finishing)
                } else {
                    let src = &left[i - 1];
                    (&src.data[src.pos..src.len], self.stage_done[i - 1])
                };

                let dst_len = dst.len;
                let (used, emitted, done) =
                    self.stages[i].process(src_slice, &mut dst.data[dst_len..], upstream_done)?;

                if i == 0 {
                    consumed += used;
                } else {
                    left[i - 1].pos += used;
                }
                dst.len += emitted;
                self.stage_done[i] = self.stage_done[i] || done;
                progress = progress || used > 0 || emitted > 0;
            }

            // Feed the compressor.
            let upstream_done = match self.stage_done.last() {
                Some(&done) => done,
                None => finishing && consumed == input.len(),
            };
            let terminal_action = if upstream_done {
                if action == Action::SyncFlush {
                    Action::SyncFlush
                } else {
                    Action::Finish
                }
            } else {
                Action::Run
            };

            let status = if self.stages.is_empty() {
                let status =
                    self.terminal
                        .code(&input[consumed..], &mut output[produced..], terminal_action)?;
                consumed += status.consumed;
                status
            } else {
                let src = self.bufs.last_mut().unwrap();
                let status = self.terminal.code(
                    &src.data[src.pos..src.len],
                    &mut output[produced..],
                    terminal_action,
                )?;
                src.pos += status.consumed;
                status
            };
            produced += status.produced;
            progress = progress || status.consumed > 0 || status.produced > 0;

            if status.ended {
                return Ok(CodeStatus::end(consumed, produced));
            }
            if produced == output.len() || !progress {
                return Ok(CodeStatus::more(consumed, produced));
            }
        }
    }
}

/// The decoding chain: the decompressor, then the stages in reverse.
pub struct DecodePipeline {
    terminal: Lzma2Decoder,
    /// Stages already reversed: index 0 runs right after the terminal.
    stages: Vec<FilterStage<Box<dyn InPlaceFilter>>>,
    bufs: Vec<LinkBuf>,
    stage_done: Vec<bool>,
    terminal_done: bool,
}

impl DecodePipeline {
    /// Build the decoding chain for a validated filter list.
    pub fn new(filters: &[Filter], mem: Option<&mut MemLimit>) -> Result<Self> {
        validate_chain(filters)?;
        let (last, rest) = filters.split_last().unwrap();
        let Filter::Lzma2 { options } = last else {
            unreachable!("validate_chain guarantees the terminal");
        };

        let stages = rest
            .iter()
            .rev()
            .map(|f| build_stage(f, false))
            .collect::<Result<Vec<_>>>()?;
        let bufs = (0..stages.len()).map(|_| LinkBuf::new()).collect();
        let stage_done = vec![false; stages.len()];

        Ok(Self {
            terminal: Lzma2Decoder::new(options.dict_size, mem)?,
            stages,
            bufs,
            stage_done,
            terminal_done: false,
        })
    }
}

impl Coder for DecodePipeline {
    fn code(&mut self, input: &[u8], output: &mut [u8], _action: Action) -> Result<CodeStatus> {
        let mut consumed = 0usize;
        let mut produced = 0usize;

        loop {
            let mut progress = false;

            // Decompress into the first link (or straight to the caller).
            if self.stages.is_empty() {
                let status =
                    self.terminal
                        .code(&input[consumed..], &mut output[produced..], Action::Run)?;
                consumed += status.consumed;
                produced += status.produced;
                progress = status.consumed > 0 || status.produced > 0;

                if status.ended {
                    return Ok(CodeStatus::end(consumed, produced));
                }
            } else {
                if !self.terminal_done {
                    let dst = &mut self.bufs[0];
                    dst.compact();
                    if dst.len < dst.data.len() {
                        let dst_len = dst.len;
                        let status = self.terminal.code(
                            &input[consumed..],
                            &mut dst.data[dst_len..],
                            Action::Run,
                        )?;
                        consumed += status.consumed;
                        dst.len += status.produced;
                        self.terminal_done = status.ended;
                        progress = status.consumed > 0 || status.produced > 0 || status.ended;
                    }
                }

                // Undo the transforms in reverse chain order.
                for i in 0..self.stages.len() {
                    let last = i + 1 == self.stages.len();
                    let upstream_done = if i == 0 {
                        self.terminal_done
                    } else {
                        self.stage_done[i - 1]
                    };

                    if last {
                        let src = &mut self.bufs[i];
                        let slice_start = src.pos;
                        let slice_end = src.len;
                        let (used, emitted, done) = self.stages[i].process(
                            &src.data[slice_start..slice_end],
                            &mut output[produced..],
                            upstream_done,
                        )?;
                        src.pos += used;
                        produced += emitted;
                        self.stage_done[i] = self.stage_done[i] || done;
                        progress = progress || used > 0 || emitted > 0;

                        if self.stage_done[i] && src.pending() == 0 {
                            return Ok(CodeStatus::end(consumed, produced));
                        }
                    } else {
                        let (left, right) = self.bufs.split_at_mut(i + 1);
                        let src = &mut left[i];
                        let dst = &mut right[0];
                        dst.compact();
                        if dst.len == dst.data.len() {
                            continue;
                        }

                        let dst_len = dst.len;
                        let (used, emitted, done) = self.stages[i].process(
                            &src.data[src.pos..src.len],
                            &mut dst.data[dst_len..],
                            upstream_done,
                        )?;
                        src.pos += used;
                        dst.len += emitted;
                        self.stage_done[i] = self.stage_done[i] || done;
                        progress = progress || used > 0 || emitted > 0;
                    }
                }
            }

            if produced == output.len() || !progress {
                return Ok(CodeStatus::more(consumed, produced));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxz_core::coder::code_all;
    use oxz_filters::bcj::BcjArch;
    use oxz_lzma::LzmaOptions;

    fn lzma2() -> Filter {
        Filter::Lzma2 {
            options: LzmaOptions {
                dict_size: 1 << 16,
                ..LzmaOptions::preset(1)
            },
        }
    }

    fn pipeline_roundtrip(filters: Vec<Filter>, data: &[u8]) -> Vec<u8> {
        let mut enc = EncodePipeline::new(&filters, None).unwrap();
        let compressed = code_all(&mut enc, data).unwrap();

        let mut dec = DecodePipeline::new(&filters, None).unwrap();
        let decoded = code_all(&mut dec, &compressed).unwrap();
        assert_eq!(decoded, data, "chain {filters:?} failed");
        compressed
    }

    #[test]
    fn test_lzma2_only() {
        let data = b"plain single filter chain ".repeat(500);
        let compressed = pipeline_roundtrip(vec![lzma2()], &data);
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn test_delta_then_lzma2() {
        // A sawtooth ramp becomes constant after delta and compresses
        // drastically better.
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 197) as u8).collect();
        let with_delta = pipeline_roundtrip(
            vec![Filter::Delta { distance: 1 }, lzma2()],
            &data,
        );
        let without = pipeline_roundtrip(vec![lzma2()], &data);
        assert!(with_delta.len() < without.len());
    }

    #[test]
    fn test_bcj_then_lzma2() {
        // Synthetic x86 code with recurring call targets.
        let mut data = Vec::new();
        for i in 0..3000u32 {
            data.push(0x90);
            data.push(0xE8);
            data.extend_from_slice(&(i.wrapping_mul(64) % 4096).to_le_bytes());
        }
        pipeline_roundtrip(
            vec![
                Filter::Bcj {
                    arch: BcjArch::X86,
                    start_offset: 0,
                },
                lzma2(),
            ],
            &data,
        );
    }

    #[test]
    fn test_three_stage_chain() {
        let data: Vec<u8> = (0..20_000u32).map(|i| ((i / 7) % 256) as u8).collect();
        pipeline_roundtrip(
            vec![
                Filter::Delta { distance: 2 },
                Filter::Copy,
                Filter::Bcj {
                    arch: BcjArch::Arm,
                    start_offset: 0,
                },
                lzma2(),
            ],
            &data,
        );
    }

    #[test]
    fn test_empty_input() {
        pipeline_roundtrip(vec![Filter::Delta { distance: 4 }, lzma2()], b"");
    }

    #[test]
    fn test_sync_flush_rejected_with_stages() {
        let filters = vec![Filter::Copy, lzma2()];
        let mut enc = EncodePipeline::new(&filters, None).unwrap();
        let mut out = [0u8; 64];
        let err = enc.code(b"abc", &mut out, Action::SyncFlush).unwrap_err();
        assert!(matches!(err, XzError::Options { .. }));
    }

    #[test]
    fn test_small_output_buffers() {
        let data = b"tiny output buffer pipeline drive ".repeat(100);
        let filters = vec![Filter::Delta { distance: 1 }, lzma2()];

        let mut enc = EncodePipeline::new(&filters, None).unwrap();
        let mut compressed = Vec::new();
        let mut buf = [0u8; 5];
        let mut pos = 0;
        loop {
            let action = if pos == data.len() {
                Action::Finish
            } else {
                Action::Run
            };
            let status = enc
                .code(&data[pos..(pos + 11).min(data.len())], &mut buf, action)
                .unwrap();
            pos += status.consumed;
            compressed.extend_from_slice(&buf[..status.produced]);
            if status.ended {
                break;
            }
        }

        let mut dec = DecodePipeline::new(&filters, None).unwrap();
        assert_eq!(code_all(&mut dec, &compressed).unwrap(), data);
    }
}
