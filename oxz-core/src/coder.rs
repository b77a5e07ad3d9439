//! The incremental coder contract.
//!
//! Every encoder, decoder and filter in oxz is driven through the same
//! interface: the caller hands in an input slice and an output slice, the
//! coder consumes and produces what it can without blocking, and reports how
//! far it got. A coder never performs I/O and never allocates in the middle
//! of a call; all state needed to resume lives inside the coder itself, so a
//! multi-byte field may be cut at any byte boundary between calls.

use crate::error::{Result, XzError};

/// What the caller wants the coder to do with the current input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Normal operation: more input may follow.
    #[default]
    Run,
    /// Make all input given so far available from the decoder side without
    /// resetting the coder state, then keep going.
    SyncFlush,
    /// Finish the current block so that a new one can be started; the
    /// stream itself continues.
    FullFlush,
    /// No more input will be given; finish the stream.
    Finish,
}

/// Progress report from one [`Coder::code`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeStatus {
    /// Bytes consumed from the input slice.
    pub consumed: usize,
    /// Bytes written to the output slice.
    pub produced: usize,
    /// True when the coder has produced its final byte (STREAM_END in the
    /// classic return-code vocabulary). Further calls are caller misuse.
    pub ended: bool,
}

impl CodeStatus {
    /// Progress report for a call that moved `consumed`/`produced` bytes
    /// and has more work to do.
    pub fn more(consumed: usize, produced: usize) -> Self {
        Self {
            consumed,
            produced,
            ended: false,
        }
    }

    /// Progress report for the final call of a stream.
    pub fn end(consumed: usize, produced: usize) -> Self {
        Self {
            consumed,
            produced,
            ended: true,
        }
    }
}

/// A resumable byte-stream transform.
pub trait Coder {
    /// Process bytes from `input` into `output`.
    ///
    /// The coder must make forward progress whenever either input or output
    /// is available and work remains. Returning with `consumed == 0 &&
    /// produced == 0` is legal (for example when a multi-byte header
    /// straddles the buffer boundary and the input ran out); the caller's
    /// driver loop is responsible for detecting a genuine stall and turning
    /// it into [`XzError::Buffer`].
    fn code(&mut self, input: &[u8], output: &mut [u8], action: Action) -> Result<CodeStatus>;
}

/// Drive a coder over a complete input buffer, collecting all output.
///
/// This is the convenience layer over the streaming contract: it repeatedly
/// calls [`Coder::code`] with `Action::Run` and finally `Action::Finish`,
/// growing the output as needed. A stall (full pass with no progress and no
/// end) is reported as [`XzError::Buffer`].
pub fn code_all(coder: &mut dyn Coder, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 1 << 16];
    let mut in_pos = 0;

    loop {
        let action = if in_pos == input.len() {
            Action::Finish
        } else {
            Action::Run
        };

        let status = coder.code(&input[in_pos..], &mut buf, action)?;
        in_pos += status.consumed;
        out.extend_from_slice(&buf[..status.produced]);

        if status.ended {
            return Ok(out);
        }

        if status.consumed == 0 && status.produced == 0 && action == Action::Finish {
            return Err(XzError::Buffer);
        }
    }
}
