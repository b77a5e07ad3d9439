//! Integrity check dispatch.
//!
//! Each block carries an optional digest of its uncompressed data. The check
//! type is declared once per stream; four types are implemented here and the
//! remaining reserved identifiers are recognised (their trailer size is
//! defined by the format) but not computable, so streams using them can still
//! be skipped over or decoded without verification.

use sha2::{Digest, Sha256};

use crate::crc::{Crc32, Crc64};
use crate::error::{Result, XzError};

/// Highest valid check type identifier.
pub const CHECK_ID_MAX: u8 = 15;

/// Largest possible check trailer in bytes.
pub const CHECK_SIZE_MAX: usize = 64;

/// Trailer size in bytes for every check identifier, including the reserved
/// ones. Defined by the container format so that an unknown check can still
/// be skipped.
const CHECK_SIZES: [usize; CHECK_ID_MAX as usize + 1] =
    [0, 4, 4, 4, 8, 8, 8, 16, 16, 16, 32, 32, 32, 64, 64, 64];

/// Integrity check type of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckType {
    /// No integrity check.
    None,
    /// CRC-32 (ISO 3309), 4-byte trailer, little-endian.
    Crc32,
    /// CRC-64 (ECMA-182), 8-byte trailer, little-endian.
    #[default]
    Crc64,
    /// SHA-256, 32-byte trailer in digest byte order.
    Sha256,
    /// A reserved identifier with a format-defined trailer size but no
    /// implementation. Decoding proceeds without verification.
    Unsupported(u8),
}

impl CheckType {
    /// Parse a check identifier from the stream flags.
    ///
    /// Identifiers above [`CHECK_ID_MAX`] do not exist in the format at all
    /// and are an options error; valid-but-unimplemented identifiers map to
    /// [`CheckType::Unsupported`].
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Crc32),
            0x04 => Ok(Self::Crc64),
            0x0A => Ok(Self::Sha256),
            id if id <= CHECK_ID_MAX => Ok(Self::Unsupported(id)),
            id => Err(XzError::options(format!("invalid check type {id:#04x}"))),
        }
    }

    /// The wire identifier of this check type.
    pub fn id(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Crc32 => 0x01,
            Self::Crc64 => 0x04,
            Self::Sha256 => 0x0A,
            Self::Unsupported(id) => id,
        }
    }

    /// Size of the check trailer in bytes.
    pub fn size(self) -> usize {
        CHECK_SIZES[self.id() as usize]
    }

    /// Whether this build can compute the digest.
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

/// A finalized check value, sized according to the check type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckValue {
    bytes: [u8; CHECK_SIZE_MAX],
    len: usize,
}

impl CheckValue {
    /// The trailer bytes exactly as they appear on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Running integrity check state.
///
/// Dispatches init/update/finish over the configured check type. An
/// unsupported type degrades to a no-op whose finished value is empty, which
/// also makes the trailer comparison for it vacuously succeed.
#[derive(Debug, Clone)]
pub enum Check {
    /// No check: zero-size trailer, updates are no-ops.
    None,
    /// Running CRC-32.
    Crc32(Crc32),
    /// Running CRC-64.
    Crc64(Crc64),
    /// Running SHA-256.
    Sha256(Sha256),
    /// Recognised but not computable; tracked only for its trailer size.
    Unsupported(u8),
}

impl Check {
    /// Initialise the state for the given check type.
    pub fn new(check_type: CheckType) -> Self {
        match check_type {
            CheckType::None => Self::None,
            CheckType::Crc32 => Self::Crc32(Crc32::new()),
            CheckType::Crc64 => Self::Crc64(Crc64::new()),
            CheckType::Sha256 => Self::Sha256(Sha256::new()),
            CheckType::Unsupported(id) => Self::Unsupported(id),
        }
    }

    /// The check type this state was initialised for.
    pub fn check_type(&self) -> CheckType {
        match self {
            Self::None => CheckType::None,
            Self::Crc32(_) => CheckType::Crc32,
            Self::Crc64(_) => CheckType::Crc64,
            Self::Sha256(_) => CheckType::Sha256,
            Self::Unsupported(id) => CheckType::Unsupported(*id),
        }
    }

    /// Feed uncompressed data into the digest.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::None | Self::Unsupported(_) => {}
            Self::Crc32(crc) => crc.update(data),
            Self::Crc64(crc) => crc.update(data),
            Self::Sha256(sha) => sha.update(data),
        }
    }

    /// Finish the digest and return the wire-format trailer.
    ///
    /// CRC values are serialized little-endian; SHA-256 keeps its natural
    /// big-endian digest order. Unsupported types yield an empty value.
    pub fn finish(self) -> CheckValue {
        let mut bytes = [0u8; CHECK_SIZE_MAX];
        let len = match self {
            Self::None | Self::Unsupported(_) => 0,
            Self::Crc32(crc) => {
                bytes[..4].copy_from_slice(&crc.finalize().to_le_bytes());
                4
            }
            Self::Crc64(crc) => {
                bytes[..8].copy_from_slice(&crc.finalize().to_le_bytes());
                8
            }
            Self::Sha256(sha) => {
                bytes[..32].copy_from_slice(&sha.finalize());
                32
            }
        };
        CheckValue { bytes, len }
    }
}
