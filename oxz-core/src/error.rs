//! Error types for oxz operations.
//!
//! The error taxonomy mirrors the return codes of the coder contract: format
//! recognition, option validation, data corruption, buffer starvation, memory
//! exhaustion and caller misuse are all distinct kinds, because callers react
//! to them differently (a data error is fatal for the stream, a buffer error
//! just asks for more room).

use std::io;
use thiserror::Error;

/// The main error type for oxz operations.
#[derive(Debug, Error)]
pub enum XzError {
    /// I/O error from an underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The input is not in the expected container format.
    #[error("input is not in the .xz format")]
    Format,

    /// Recognised container, but an option in it is unsupported or invalid.
    #[error("unsupported or invalid options: {message}")]
    Options {
        /// Description of the offending option.
        message: String,
    },

    /// The compressed data is corrupt.
    #[error("corrupt data: {message}")]
    Data {
        /// Description of the corruption.
        message: String,
    },

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#x}, computed {computed:#x}")]
    CrcMismatch {
        /// Expected CRC value from the stream.
        expected: u64,
        /// Computed CRC value from the data.
        computed: u64,
    },

    /// No progress is possible: both buffers are at their boundary while
    /// more work remains. The caller must supply more input or more output
    /// space and call again.
    #[error("cannot make progress without more input or output space")]
    Buffer,

    /// An allocation failed.
    #[error("memory allocation failed")]
    Memory,

    /// The configured memory usage limit was reached.
    #[error("memory usage limit reached: {needed} bytes would have been needed")]
    MemLimit {
        /// Total memory that would have been needed to satisfy the request.
        needed: u64,
    },

    /// Caller misuse: invalid action, use after finish, poisoned coder.
    #[error("programming error: {message}")]
    Program {
        /// Description of the misuse.
        message: String,
    },

    /// The integrity check type is valid but not supported by this build.
    /// The data itself may still be decodable.
    #[error("unsupported integrity check type {id}")]
    UnsupportedCheck {
        /// The check type identifier from the stream flags.
        id: u8,
    },
}

/// Result type alias for oxz operations.
pub type Result<T> = std::result::Result<T, XzError>;

impl XzError {
    /// Create an options error.
    pub fn options(message: impl Into<String>) -> Self {
        Self::Options {
            message: message.into(),
        }
    }

    /// Create a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }

    /// Create a CRC mismatch error.
    pub fn crc_mismatch(expected: u64, computed: u64) -> Self {
        Self::CrcMismatch { expected, computed }
    }

    /// Create a programming error.
    pub fn program(message: impl Into<String>) -> Self {
        Self::Program {
            message: message.into(),
        }
    }

    /// Whether this error poisons the coder handle it came from.
    ///
    /// A poisoned coder keeps failing until it is dropped; only [`Self::Buffer`]
    /// and [`Self::UnsupportedCheck`] leave the coder usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Buffer | Self::UnsupportedCheck { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = XzError::crc_mismatch(0x1234_5678, 0xDEAD_BEEF);
        assert!(err.to_string().contains("CRC mismatch"));

        let err = XzError::options("filter chain too long");
        assert!(err.to_string().contains("filter chain too long"));

        let err = XzError::MemLimit { needed: 12288 };
        assert!(err.to_string().contains("12288"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err: XzError = io_err.into();
        assert!(matches!(err, XzError::Io(_)));
    }

    #[test]
    fn test_fatality() {
        assert!(!XzError::Buffer.is_fatal());
        assert!(!XzError::UnsupportedCheck { id: 2 }.is_fatal());
        assert!(XzError::Format.is_fatal());
        assert!(XzError::data("bad").is_fatal());
    }
}
