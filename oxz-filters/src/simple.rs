//! Streaming wrapper for in-place filters.
//!
//! The Delta and BCJ transforms work on whole buffers and may leave a short
//! tail unprocessed when an instruction could continue past the end.
//! [`FilterStage`] turns such a transform into an incremental coder: it
//! buffers input, applies the transform once per byte, holds back the
//! unprocessable tail until more data arrives, and passes the tail through
//! untouched when the stream finishes.

use oxz_core::error::Result;

/// A size-preserving transform applied to a buffer in place.
///
/// `filter` returns how many leading bytes were fully processed; the caller
/// must keep the remainder and present it again, prepended to later data.
/// The implementation tracks its own absolute stream position.
pub trait InPlaceFilter {
    /// Transform as much of `buf` as possible, returning the processed length.
    fn filter(&mut self, buf: &mut [u8]) -> usize;

    /// Upper bound on the unprocessed tail `filter` may leave behind when
    /// the buffer is large enough.
    fn look_ahead(&self) -> usize;
}

/// The pass-through filter. It exists in the filter registry and doubles as
/// a harmless non-terminal chain member in tests.
#[derive(Debug, Clone, Default)]
pub struct CopyFilter;

impl InPlaceFilter for CopyFilter {
    fn filter(&mut self, buf: &mut [u8]) -> usize {
        buf.len()
    }

    fn look_ahead(&self) -> usize {
        0
    }
}

impl InPlaceFilter for Box<dyn InPlaceFilter> {
    fn filter(&mut self, buf: &mut [u8]) -> usize {
        (**self).filter(buf)
    }

    fn look_ahead(&self) -> usize {
        (**self).look_ahead()
    }
}

/// Working buffer size. Must be comfortably larger than any transform's
/// look-ahead so a full buffer always yields progress.
const STAGE_BUF_SIZE: usize = 4096;

/// Incremental driver for one [`InPlaceFilter`].
pub struct FilterStage<F> {
    filter: F,
    buf: Vec<u8>,
    /// Emission cursor into `buf[..filtered]`.
    start: usize,
    /// Prefix of `buf` that has been transformed and awaits emission.
    filtered: usize,
    /// Valid bytes in `buf`; `buf[filtered..len]` is the held-back tail.
    len: usize,
    /// Set once the tail has been flushed on finish.
    flushed: bool,
}

impl<F: InPlaceFilter> FilterStage<F> {
    /// Wrap a transform. The working buffer is allocated here, never during
    /// a `process` call.
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            buf: vec![0; STAGE_BUF_SIZE],
            start: 0,
            filtered: 0,
            len: 0,
            flushed: false,
        }
    }

    /// Access the wrapped transform.
    pub fn filter_ref(&self) -> &F {
        &self.filter
    }

    /// Feed `input` through the stage into `output`.
    ///
    /// Returns `(consumed, produced, done)`; `done` is only reported when
    /// `finish` is set, all input was consumed and everything, including the
    /// held-back tail, has been emitted.
    pub fn process(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> Result<(usize, usize, bool)> {
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            // Emit transformed bytes.
            if self.start < self.filtered && produced < output.len() {
                let n = (self.filtered - self.start).min(output.len() - produced);
                output[produced..produced + n]
                    .copy_from_slice(&self.buf[self.start..self.start + n]);
                self.start += n;
                produced += n;
            }

            if produced == output.len() {
                break;
            }

            if self.start < self.filtered {
                continue;
            }

            // All emitted; slide the held-back tail to the front and refill.
            if self.filtered > 0 {
                self.buf.copy_within(self.filtered..self.len, 0);
                self.len -= self.filtered;
                self.start = 0;
                self.filtered = 0;
            }

            let take = (input.len() - consumed).min(self.buf.len() - self.len);
            if take > 0 {
                self.buf[self.len..self.len + take]
                    .copy_from_slice(&input[consumed..consumed + take]);
                self.len += take;
                consumed += take;
            }

            let done = self.filter.filter(&mut self.buf[..self.len]);
            self.filtered = done;

            if done == 0 {
                if consumed < input.len() {
                    // More input is waiting for buffer space. A transform
                    // cannot be stuck on a full buffer, which dwarfs every
                    // look-ahead, but never risk a livelock on it.
                    debug_assert!(self.len < self.buf.len());
                    if self.len == self.buf.len() {
                        break;
                    }
                    continue;
                }

                if finish && !self.flushed {
                    // End of data: the remaining tail passes through as-is.
                    self.filtered = self.len;
                    self.flushed = true;
                    continue;
                }

                break;
            }
        }

        let done = finish
            && consumed == input.len()
            && self.flushed
            && self.start == self.filtered
            && self.filtered == self.len;
        Ok((consumed, produced, done))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bcj::{BcjArch, BcjFilter};
    use crate::delta::DeltaFilter;

    fn drive<F: InPlaceFilter>(stage: &mut FilterStage<F>, input: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        let mut pos = 0;
        loop {
            let end = (pos + chunk).min(input.len());
            // Only signal the finish once the final bytes are presented.
            let (consumed, produced, done) = stage
                .process(&input[pos..end], &mut buf, end == input.len())
                .unwrap();
            pos += consumed;
            out.extend_from_slice(&buf[..produced]);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn test_copy_stage() {
        let data: Vec<u8> = (0..10_000).map(|i| i as u8).collect();
        let mut stage = FilterStage::new(CopyFilter);
        assert_eq!(drive(&mut stage, &data, 97), data);
    }

    #[test]
    fn test_stage_is_size_preserving_and_chunk_invariant() {
        let data: Vec<u8> = (0..20_000).map(|i| (i * 7 + 3) as u8).collect();

        let mut whole = FilterStage::new(BcjFilter::new(BcjArch::X86, 0, true).unwrap());
        let expected = drive(&mut whole, &data, data.len() + 16);

        for chunk in [1, 3, 7, 64, 4096] {
            let mut stage = FilterStage::new(BcjFilter::new(BcjArch::X86, 0, true).unwrap());
            let got = drive(&mut stage, &data, chunk);
            assert_eq!(got.len(), data.len());
            assert_eq!(got, expected, "chunk size {chunk} changed the output");
        }
    }

    #[test]
    fn test_stage_roundtrip_bcj() {
        let data: Vec<u8> = (0..5000).map(|i| (i ^ (i >> 3)) as u8).collect();

        let mut enc = FilterStage::new(BcjFilter::new(BcjArch::Arm64, 0, true).unwrap());
        let encoded = drive(&mut enc, &data, 333);

        let mut dec = FilterStage::new(BcjFilter::new(BcjArch::Arm64, 0, false).unwrap());
        let decoded = drive(&mut dec, &encoded, 41);

        assert_eq!(decoded, data);
    }

    #[test]
    fn test_stage_roundtrip_delta() {
        let data: Vec<u8> = (0..4097).map(|i| (i * 13) as u8).collect();

        let mut enc = FilterStage::new(DeltaFilter::new(4, true).unwrap());
        let encoded = drive(&mut enc, &data, 1000);

        let mut dec = FilterStage::new(DeltaFilter::new(4, false).unwrap());
        let decoded = drive(&mut dec, &encoded, 1);

        assert_eq!(decoded, data);
    }

    #[test]
    fn test_tail_flushes_only_on_finish() {
        // Three bytes are below the x86 look-ahead, so nothing comes out
        // until finish is requested.
        let mut stage = FilterStage::new(BcjFilter::new(BcjArch::X86, 0, true).unwrap());
        let mut out = [0u8; 16];

        let (consumed, produced, done) = stage.process(b"abc", &mut out, false).unwrap();
        assert_eq!((consumed, produced, done), (3, 0, false));

        let (_, produced, done) = stage.process(b"", &mut out, true).unwrap();
        assert_eq!(produced, 3);
        assert!(done);
        assert_eq!(&out[..3], b"abc");
    }
}
